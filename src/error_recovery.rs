//! Automatic reconnection after a lost OMS link.
//!
//! The driver itself never retries a failed command. When the dispatcher reports a
//! connection-lost transition, the host may ask the driver to reconnect; the attempts
//! are paced by a [`RetryPolicy`] read from the driver configuration.

use crate::error::PlatformError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying an operation.
///
/// # Example
///
/// ```rust
/// use rsn_platform_driver::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert_eq!(policy.max_attempts, 5);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The maximum number of attempts. Zero disables reconnection.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// The constant delay between attempts, e.g. `"1s"` or `"250ms"`.
    #[serde(default = "default_backoff_delay", with = "humantime_serde")]
    pub backoff_delay: Duration,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_delay: default_backoff_delay(),
        }
    }
}

/// An asynchronous operation that can be retried.
#[async_trait]
pub trait Recoverable<E> {
    /// Attempts to recover from a failure.
    async fn recover(&mut self) -> Result<(), E>;
}

/// Retries `recoverable` according to `policy`.
///
/// Returns `Ok(())` as soon as one attempt succeeds. Otherwise returns the last
/// attempt's error, or a [`PlatformError::Connection`] if no attempt was made.
pub async fn handle_recoverable_error<T: Recoverable<PlatformError> + Send>(
    recoverable: &mut T,
    policy: &RetryPolicy,
) -> Result<(), PlatformError> {
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        match recoverable.recover().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(attempt, max_attempts = policy.max_attempts, error = %e, "recovery attempt failed");
                last_error = Some(e);
            }
        }
        if attempt < policy.max_attempts {
            sleep(policy.backoff_delay).await;
        }
    }
    Err(last_error.unwrap_or_else(|| {
        PlatformError::Connection(format!(
            "Failed to recover after {} attempts.",
            policy.max_attempts
        ))
    }))
}

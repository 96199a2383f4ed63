//! Error types for the platform driver.
//!
//! Every failure that crosses the OMS boundary is classified into one of three
//! categories so the surrounding framework can decide what to do with it:
//!
//! - **`Argument`**: a required command argument is missing or malformed. Caller error,
//!   never retried.
//! - **`Protocol`**: the OMS answered, but the answer violates the envelope or
//!   acknowledgment contract (missing platform key, non-"OK" status, unexpected
//!   attribute shape, data request too far in the past). The link is still healthy.
//! - **`Connection`**: the transport itself failed, or a liveness check failed in a way
//!   consistent with a dead link. Triggers the connection-lost transition.
//!
//! Transport implementations report [`TransportError`]; only the command executor turns
//! those into [`PlatformError::Connection`].

use crate::platform::DriverState;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Primary error type for the platform driver.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// A required command argument is missing or has the wrong type.
    #[error("Argument error: {0}")]
    Argument(String),

    /// The OMS responded but the response does not honour the expected contract.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The transport failed or the OMS is unreachable.
    ///
    /// This is the only variant that drives the connection-lost path.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Driver or node configuration is invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The event has no handler in the current driver state.
    #[error("Event {event} not handled in state {state}")]
    InvalidState {
        /// State the driver was in when the event arrived.
        state: DriverState,
        /// Wire name of the rejected event.
        event: String,
    },

    /// The driver event loop is not running or was already started.
    #[error("Driver event loop unavailable")]
    EventLoopClosed,

    /// Driver configuration file could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Node configuration file could not be parsed.
    #[error("Node configuration error: {0}")]
    NodeConfig(#[from] serde_yaml::Error),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlatformError {
    /// True if this error means the link to the OMS should be considered lost.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, PlatformError::Connection(_))
    }
}

impl From<figment::Error> for PlatformError {
    fn from(err: figment::Error) -> Self {
        PlatformError::Config(Box::new(err))
    }
}

/// Failure raised by an [`OmsClient`](crate::oms::OmsClient) implementation.
///
/// Mirrors the three failure sources of an XML-RPC style transport (server fault,
/// transport protocol error, socket error) plus an explicit timeout.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The remote procedure raised a fault.
    #[error("fault {code}: {message}")]
    Fault {
        /// Fault code reported by the server.
        code: i32,
        /// Fault string reported by the server.
        message: String,
    },

    /// HTTP or framing level protocol failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket level failure.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// The call did not complete within the transport timeout.
    #[error("call timed out")]
    Timeout,
}

//! OMS RPC client seam.
//!
//! The driver talks to the Operations Management System (OMS) exclusively through the
//! [`OmsClient`] trait. Every call returns the raw response envelope as JSON (a mapping
//! keyed by platform id) or a [`TransportError`]; interpreting the envelope is the job
//! of [`crate::platform::verifier`].
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────┐   create_instance(uri)   ┌──────────────────────┐
//! │  PlatformDriver   │ ───────────────────────▶ │   OmsClientFactory   │
//! │  (connect/discon) │ ◀─────────────────────── │  (sim://, host impl) │
//! └─────────┬─────────┘   Arc<dyn OmsClient>     └──────────────────────┘
//!           │
//!           ▼
//! ┌───────────────────┐        RPC         ┌──────────────────────┐
//! │  CommandExecutor  │ ─────────────────▶ │      OMS service     │
//! └───────────────────┘                    └──────────────────────┘
//! ```

pub mod simulator;

pub use simulator::{SimulatedOms, SimulatedOmsFactory};

use crate::error::{PlatformResult, TransportError};
use crate::node_config::OmsPortControlId;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

/// Sentinel values the OMS places in responses.
pub struct InvalidResponse;

impl InvalidResponse {
    /// Payload for a platform id the OMS does not know.
    pub const PLATFORM_ID: &'static str = "INVALID_PLATFORM_ID";
    /// Value for an attribute id the OMS does not know.
    pub const ATTRIBUTE_ID: &'static str = "INVALID_ATTRIBUTE_ID";
    /// Value for a port id the OMS does not know.
    pub const PORT_ID: &'static str = "INVALID_PORT_ID";
    /// First marker of a value list when `from_time` predates the OMS history.
    pub const DATA_REQUEST_TOO_FAR_IN_PAST: &'static str = "ERROR_DATA_REQUEST_TOO_FAR_IN_PAST";
}

/// Remote procedures exposed by the OMS.
///
/// Implementations must be safe to share, but the driver never issues two calls
/// concurrently on the same handle.
#[async_trait]
pub trait OmsClient: Send + Sync {
    /// Liveness probe. A healthy service answers `"PONG"`.
    async fn ping(&self) -> Result<Option<String>, TransportError>;

    /// Attribute values newer than each `from_time`, per attribute id.
    async fn get_platform_attribute_values(
        &self,
        platform_id: &str,
        attrs: &[(String, f64)],
    ) -> Result<Value, TransportError>;

    /// Set the over-current trip limit of a port.
    async fn set_over_current(
        &self,
        platform_id: &str,
        port: OmsPortControlId,
        milliamps: i64,
        microseconds: i64,
        src: &str,
    ) -> Result<Value, TransportError>;

    /// Power a port on.
    async fn turn_on_platform_port(
        &self,
        platform_id: &str,
        port: OmsPortControlId,
        src: &str,
    ) -> Result<Value, TransportError>;

    /// Power a port off.
    async fn turn_off_platform_port(
        &self,
        platform_id: &str,
        port: OmsPortControlId,
        src: &str,
    ) -> Result<Value, TransportError>;

    /// Start a profiler mission by name.
    async fn start_mission(
        &self,
        platform_id: &str,
        mission_name: &str,
        src: &str,
    ) -> Result<Value, TransportError>;

    /// Stop the running profiler mission.
    async fn stop_mission(
        &self,
        platform_id: &str,
        flag: &str,
        src: &str,
    ) -> Result<Value, TransportError>;

    /// Status of the profiler mission.
    async fn get_mission_status(&self, platform_id: &str) -> Result<Value, TransportError>;

    /// Missions the profiler can run.
    async fn get_available_missions(&self, platform_id: &str) -> Result<Value, TransportError>;

    /// Register `url` for all event types.
    async fn register_event_listener(&self, url: &str) -> Result<Value, TransportError>;

    /// Unregister `url` for all event types.
    async fn unregister_event_listener(&self, url: &str) -> Result<Value, TransportError>;

    /// Currently registered listener urls.
    async fn get_registered_event_listeners(&self) -> Result<Value, TransportError>;
}

/// Creates and destroys [`OmsClient`] handles for a URI.
pub trait OmsClientFactory: Send + Sync {
    /// Create a client connected to `uri`.
    fn create_instance(&self, uri: &str) -> BoxFuture<'static, PlatformResult<Arc<dyn OmsClient>>>;

    /// Release a client created by this factory.
    fn destroy_instance(&self, client: Arc<dyn OmsClient>) {
        drop(client);
    }
}

//! # RSN Platform Driver
//!
//! Driver bridging an instrument-management host to the RSN Operations Management
//! System (OMS). It translates port, mission and limit commands into OMS calls,
//! polls engineering telemetry incrementally and classifies every OMS failure as
//! argument, protocol or connection error.
//!
//! ## Crate Structure
//!
//! - **`config`**: Driver configuration loaded from TOML and the environment.
//! - **`node_config`**: Static per-node YAML configuration (ports, streams, scaling).
//! - **`error`**: `PlatformError` taxonomy and the transport-level `TransportError`.
//! - **`error_recovery`**: Retry policy used when reconnecting.
//! - **`oms`**: The `OmsClient` seam to the OMS and an in-process simulator.
//! - **`platform`**: Verifier, port mapper, command executor, telemetry poller and the
//!   driver state machine.
//! - **`time`**: NTP time helpers.
//! - **`tracing_config`**: Structured logging setup.

pub mod config;
pub mod error;
pub mod error_recovery;
pub mod node_config;
pub mod oms;
pub mod platform;
pub mod time;
pub mod tracing_config;

pub use error::{PlatformError, PlatformResult};
pub use platform::{PlatformDriver, PlatformDriverEvent};

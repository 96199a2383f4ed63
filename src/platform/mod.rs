//! RSN OMS platform driver core.
//!
//! - [`verifier`]: response envelope and acknowledgment checks
//! - [`ports`]: external port id to OMS control id translation
//! - [`executor`]: one OMS command per method, transport error classification
//! - [`poller`]: watermark based telemetry poll
//! - [`driver`]: state/event dispatch, lifecycle and scheduler
//! - [`events`]: events, states and payload types

pub mod driver;
pub mod events;
pub mod executor;
pub mod poller;
pub mod ports;
pub mod verifier;

pub use driver::{DriverHandle, GetRequest, PlatformDriver};
pub use events::{
    filter_capabilities, CommandArgs, CommandOutcome, DriverAsyncEvent, DriverState,
    EmittedSample, PlatformDriverCapability, PlatformDriverEvent, SampleValue,
};
pub use executor::{AttributeSample, AttributeValues, CommandExecutor};
pub use poller::{PollSummary, TelemetryPoller};
pub use ports::PortMapper;

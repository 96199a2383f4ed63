//! Driver events, states and the payloads that flow through the dispatcher.

use crate::error::{PlatformError, PlatformResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Connection state of the driver.
///
/// ```text
/// Unconfigured ──CONFIGURE──> Disconnected ──CONNECT──> Connected
///                                  ▲                       │
///                                  └──DISCONNECT / lost────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverState {
    /// No driver configuration applied yet
    Unconfigured,
    /// Configured, no OMS client
    Disconnected,
    /// OMS client created and verified, scheduler running
    Connected,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverState::Unconfigured => write!(f, "UNCONFIGURED"),
            DriverState::Disconnected => write!(f, "DISCONNECTED"),
            DriverState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Events understood by the platform driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlatformDriverEvent {
    /// Apply a driver configuration
    #[serde(rename = "PLATFORM_DRIVER_EVENT_CONFIGURE")]
    Configure,
    /// Create the OMS client and start polling
    #[serde(rename = "PLATFORM_DRIVER_EVENT_CONNECT")]
    Connect,
    /// Stop polling and release the OMS client
    #[serde(rename = "PLATFORM_DRIVER_EVENT_DISCONNECT")]
    Disconnect,
    /// Liveness probe
    #[serde(rename = "PLATFORM_DRIVER_PING")]
    Ping,
    /// Run one telemetry poll cycle
    #[serde(rename = "RSN_PLATFORM_DRIVER_GET_ENG_DATA")]
    GetEngData,
    /// Power a port on
    #[serde(rename = "RSN_PLATFORM_DRIVER_TURN_ON_PORT")]
    TurnOnPort,
    /// Power a port off
    #[serde(rename = "RSN_PLATFORM_DRIVER_TURN_OFF_PORT")]
    TurnOffPort,
    /// Set the over-current limits of a port
    #[serde(rename = "RSN_PLATFORM_DRIVER_SET_PORT_OVER_CURRENT_LIMITS")]
    SetPortOverCurrentLimits,
    /// Start a profiler mission
    #[serde(rename = "RSN_PLATFORM_DRIVER_START_PROFILER_MISSION")]
    StartProfilerMission,
    /// Stop the profiler mission
    #[serde(rename = "RSN_PLATFORM_DRIVER_STOP_PROFILER_MISSION")]
    StopProfilerMission,
    /// Query the profiler mission status
    #[serde(rename = "RSN_PLATFORM_DRIVER_GET_MISSION_STATUS")]
    GetMissionStatus,
    /// Query the available profiler missions
    #[serde(rename = "RSN_PLATFORM_DRIVER_GET_AVAILABLE_MISSIONS")]
    GetAvailableMissions,
    /// Fired by the poll scheduler
    #[serde(rename = "pad_sample_timer_event")]
    AcquireSample,
}

impl PlatformDriverEvent {
    /// Every event, in declaration order.
    pub const ALL: [PlatformDriverEvent; 13] = [
        PlatformDriverEvent::Configure,
        PlatformDriverEvent::Connect,
        PlatformDriverEvent::Disconnect,
        PlatformDriverEvent::Ping,
        PlatformDriverEvent::GetEngData,
        PlatformDriverEvent::TurnOnPort,
        PlatformDriverEvent::TurnOffPort,
        PlatformDriverEvent::SetPortOverCurrentLimits,
        PlatformDriverEvent::StartProfilerMission,
        PlatformDriverEvent::StopProfilerMission,
        PlatformDriverEvent::GetMissionStatus,
        PlatformDriverEvent::GetAvailableMissions,
        PlatformDriverEvent::AcquireSample,
    ];

    /// Wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformDriverEvent::Configure => "PLATFORM_DRIVER_EVENT_CONFIGURE",
            PlatformDriverEvent::Connect => "PLATFORM_DRIVER_EVENT_CONNECT",
            PlatformDriverEvent::Disconnect => "PLATFORM_DRIVER_EVENT_DISCONNECT",
            PlatformDriverEvent::Ping => "PLATFORM_DRIVER_PING",
            PlatformDriverEvent::GetEngData => "RSN_PLATFORM_DRIVER_GET_ENG_DATA",
            PlatformDriverEvent::TurnOnPort => "RSN_PLATFORM_DRIVER_TURN_ON_PORT",
            PlatformDriverEvent::TurnOffPort => "RSN_PLATFORM_DRIVER_TURN_OFF_PORT",
            PlatformDriverEvent::SetPortOverCurrentLimits => {
                "RSN_PLATFORM_DRIVER_SET_PORT_OVER_CURRENT_LIMITS"
            }
            PlatformDriverEvent::StartProfilerMission => {
                "RSN_PLATFORM_DRIVER_START_PROFILER_MISSION"
            }
            PlatformDriverEvent::StopProfilerMission => "RSN_PLATFORM_DRIVER_STOP_PROFILER_MISSION",
            PlatformDriverEvent::GetMissionStatus => "RSN_PLATFORM_DRIVER_GET_MISSION_STATUS",
            PlatformDriverEvent::GetAvailableMissions => {
                "RSN_PLATFORM_DRIVER_GET_AVAILABLE_MISSIONS"
            }
            PlatformDriverEvent::AcquireSample => "pad_sample_timer_event",
        }
    }
}

impl fmt::Display for PlatformDriverEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformDriverEvent {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlatformDriverEvent::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| PlatformError::Argument(format!("unknown driver event '{s}'")))
    }
}

/// Commands advertised to the host as driver capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformDriverCapability {
    /// See [`PlatformDriverEvent::GetEngData`]
    GetEngData,
    /// See [`PlatformDriverEvent::TurnOnPort`]
    TurnOnPort,
    /// See [`PlatformDriverEvent::TurnOffPort`]
    TurnOffPort,
    /// See [`PlatformDriverEvent::SetPortOverCurrentLimits`]
    SetPortOverCurrentLimits,
    /// See [`PlatformDriverEvent::StartProfilerMission`]
    StartProfilerMission,
    /// See [`PlatformDriverEvent::StopProfilerMission`]
    StopProfilerMission,
    /// See [`PlatformDriverEvent::GetMissionStatus`]
    GetMissionStatus,
    /// See [`PlatformDriverEvent::GetAvailableMissions`]
    GetAvailableMissions,
}

impl PlatformDriverCapability {
    /// All capabilities.
    pub const ALL: [PlatformDriverCapability; 8] = [
        PlatformDriverCapability::GetEngData,
        PlatformDriverCapability::TurnOnPort,
        PlatformDriverCapability::TurnOffPort,
        PlatformDriverCapability::SetPortOverCurrentLimits,
        PlatformDriverCapability::StartProfilerMission,
        PlatformDriverCapability::StopProfilerMission,
        PlatformDriverCapability::GetMissionStatus,
        PlatformDriverCapability::GetAvailableMissions,
    ];

    /// The event executed for this capability.
    pub fn event(&self) -> PlatformDriverEvent {
        match self {
            PlatformDriverCapability::GetEngData => PlatformDriverEvent::GetEngData,
            PlatformDriverCapability::TurnOnPort => PlatformDriverEvent::TurnOnPort,
            PlatformDriverCapability::TurnOffPort => PlatformDriverEvent::TurnOffPort,
            PlatformDriverCapability::SetPortOverCurrentLimits => {
                PlatformDriverEvent::SetPortOverCurrentLimits
            }
            PlatformDriverCapability::StartProfilerMission => {
                PlatformDriverEvent::StartProfilerMission
            }
            PlatformDriverCapability::StopProfilerMission => {
                PlatformDriverEvent::StopProfilerMission
            }
            PlatformDriverCapability::GetMissionStatus => PlatformDriverEvent::GetMissionStatus,
            PlatformDriverCapability::GetAvailableMissions => {
                PlatformDriverEvent::GetAvailableMissions
            }
        }
    }

    /// True if `name` is the wire name of a capability.
    pub fn has(name: &str) -> bool {
        Self::ALL.iter().any(|cap| cap.event().as_str() == name)
    }
}

/// Keep only the event names that are driver capabilities.
pub fn filter_capabilities<S: AsRef<str>>(events: &[S]) -> Vec<String> {
    events
        .iter()
        .map(AsRef::as_ref)
        .filter(|name| PlatformDriverCapability::has(name))
        .map(str::to_string)
        .collect()
}

/// Named arguments of a driver command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandArgs(Map<String, Value>);

impl CommandArgs {
    /// Empty argument set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an argument.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Parse `key=value` pairs. Values that parse as JSON keep their type,
    /// anything else is taken as a string.
    pub fn from_pairs<S: AsRef<str>>(pairs: &[S]) -> PlatformResult<Self> {
        let mut args = Self::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, raw) = pair.split_once('=').ok_or_else(|| {
                PlatformError::Argument(format!("expected key=value, got '{pair}'"))
            })?;
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            args.0.insert(key.trim().to_string(), value);
        }
        Ok(args)
    }

    /// Raw argument value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    /// Whether no arguments are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The arguments as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Required string argument.
    pub fn require_str(&self, key: &str, operation: &str) -> PlatformResult<&str> {
        match self.get(key) {
            None => Err(missing(key, operation)),
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(PlatformError::Argument(format!(
                "{operation}: {key} argument must be a string, got {other}"
            ))),
        }
    }

    /// Required integer argument. Numeric strings are accepted.
    pub fn require_i64(&self, key: &str, operation: &str) -> PlatformResult<i64> {
        let value = self.get(key).ok_or_else(|| missing(key, operation))?;
        let parsed = match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| {
            PlatformError::Argument(format!(
                "{operation}: {key} argument must be an integer, got {value}"
            ))
        })
    }
}

fn missing(key: &str, operation: &str) -> PlatformError {
    PlatformError::Argument(format!("{operation}: missing {key} argument"))
}

/// One named value of an emitted sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleValue {
    /// Externally visible parameter name
    pub value_id: String,
    /// Converted value
    pub value: Value,
}

/// A sample produced by the telemetry poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedSample {
    /// Stream name, the sample type tag
    pub stream: String,
    /// OMS timestamp shared by every value (NTP seconds)
    pub timestamp: f64,
    /// Converted (parameter, value) pairs
    pub values: Vec<SampleValue>,
    /// Instance-qualified id: `<reference designator>-<instance>`
    pub instance: String,
    /// Wall-clock time the sample was produced
    pub time: DateTime<Utc>,
}

/// Result of an executed event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    /// New driver state, `None` when the event caused no transition
    pub next_state: Option<DriverState>,
    /// Per-platform payload returned by the command
    pub result: Value,
}

impl CommandOutcome {
    /// Outcome without a state transition.
    pub fn stay(result: Value) -> Self {
        Self {
            next_state: None,
            result,
        }
    }

    /// Outcome with a transition to `state`.
    pub fn transition(state: DriverState) -> Self {
        Self {
            next_state: Some(state),
            result: Value::Null,
        }
    }
}

/// Asynchronous notifications sent to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverAsyncEvent {
    /// Telemetry sample
    Sample(EmittedSample),
    /// The driver changed state
    StateChange {
        /// State entered
        state: DriverState,
    },
    /// A command failed with a connection error; the driver is now disconnected
    ConnectionLost {
        /// Event that was being handled
        event: PlatformDriverEvent,
        /// Its arguments, preserved for replay
        args: CommandArgs,
        /// Description of the failure
        reason: String,
    },
    /// A telemetry poll cycle finished
    PollCompleted {
        /// Samples emitted during the cycle
        emitted: usize,
        /// Streams skipped after a protocol error
        skipped_streams: Vec<String>,
    },
}

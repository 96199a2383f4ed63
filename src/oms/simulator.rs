//! In-process OMS simulator.
//!
//! Simulates the parts of the OMS the driver uses without a network:
//! - Port power state and over-current limits
//! - Profiler missions (available, running, status)
//! - Event listener registry
//! - Attribute time series, either pushed explicitly or generated on a fixed period
//!
//! For tests it also provides failure injection, per-method response overrides and a
//! call log, in the manner of a mock hardware adapter.
//!
//! # Example
//!
//! ```rust
//! use rsn_platform_driver::node_config::OmsPortControlId;
//! use rsn_platform_driver::oms::SimulatedOms;
//!
//! let oms = SimulatedOms::new()
//!     .with_platform("LJ01D")
//!     .with_port(OmsPortControlId(1))
//!     .with_mission("mission_01");
//! assert!(oms.call_log().is_empty());
//! ```

use crate::error::{PlatformError, PlatformResult, TransportError};
use crate::node_config::{NodeConfiguration, OmsPortControlId};
use crate::oms::{InvalidResponse, OmsClient, OmsClientFactory};
use crate::time::ntp_now;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Upper bound on synthetic points returned per attribute and call.
const MAX_SYNTHETIC_POINTS: usize = 1000;

/// Calls kept in the call log; the oldest entries are dropped first.
pub const CALL_LOG_CAPACITY: usize = 1024;

/// Kind of transport failure to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// RPC fault raised by the server
    Fault,
    /// Transport protocol error
    Protocol,
    /// Socket error (connection refused)
    Socket,
    /// Call timeout
    Timeout,
}

impl InjectedFailure {
    fn to_error(self, method: &str) -> TransportError {
        match self {
            InjectedFailure::Fault => TransportError::Fault {
                code: 1,
                message: format!("simulated fault in {method}"),
            },
            InjectedFailure::Protocol => {
                TransportError::Protocol(format!("simulated protocol error in {method}"))
            }
            InjectedFailure::Socket => TransportError::Socket(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("simulated socket error in {method}"),
            )),
            InjectedFailure::Timeout => TransportError::Timeout,
        }
    }
}

/// Power state of a simulated port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortState {
    /// Whether the port is powered
    pub on: bool,
    /// Over-current limit in milliamps
    pub milliamps: Option<i64>,
    /// Over-current trip time in microseconds
    pub microseconds: Option<i64>,
}

#[derive(Debug, Clone)]
struct SyntheticSignal {
    period: f64,
    base: f64,
    noise: f64,
}

#[derive(Debug)]
struct SimState {
    platforms: HashSet<String>,
    ports: BTreeMap<OmsPortControlId, PortState>,
    missions: Vec<String>,
    running_mission: Option<String>,
    listeners: Vec<String>,
    history: HashMap<String, Vec<(Value, f64)>>,
    synthetic: HashMap<String, SyntheticSignal>,
    history_limit_secs: f64,
    now: Option<f64>,
    ping_reply: Option<String>,
    fail_next: Option<InjectedFailure>,
    unreachable: bool,
    overrides: HashMap<String, Value>,
    attribute_overrides: HashMap<String, Value>,
    call_log: VecDeque<String>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            platforms: HashSet::new(),
            ports: BTreeMap::new(),
            missions: Vec::new(),
            running_mission: None,
            listeners: Vec::new(),
            history: HashMap::new(),
            synthetic: HashMap::new(),
            history_limit_secs: 86_400.0,
            now: None,
            ping_reply: Some("PONG".to_string()),
            fail_next: None,
            unreachable: false,
            overrides: HashMap::new(),
            attribute_overrides: HashMap::new(),
            call_log: VecDeque::new(),
        }
    }
}

impl SimState {
    fn now(&self) -> f64 {
        self.now.unwrap_or_else(ntp_now)
    }

    /// Record the call and apply failure injection and overrides.
    fn begin(&mut self, method: &str, detail: String) -> Result<Option<Value>, TransportError> {
        if self.call_log.len() == CALL_LOG_CAPACITY {
            self.call_log.pop_front();
        }
        self.call_log.push_back(format!("{method}({detail})"));
        if self.unreachable {
            return Err(InjectedFailure::Socket.to_error(method));
        }
        if let Some(failure) = self.fail_next.take() {
            return Err(failure.to_error(method));
        }
        Ok(self.overrides.get(method).cloned())
    }
}

/// Simulated OMS service.
#[derive(Debug, Default)]
pub struct SimulatedOms {
    state: Mutex<SimState>,
}

impl SimulatedOms {
    /// Create an empty simulator that answers pings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a simulator serving the node described by `node`.
    ///
    /// The platform, every configured port and a synthetic signal for every stream
    /// attribute (one point per sample period) are registered.
    pub fn from_node(node: &NodeConfiguration) -> Self {
        let mut oms = Self::new().with_platform(node.platform_id());
        for info in node.ports().values() {
            oms = oms.with_port(info.port_oms_port_cntl_id);
        }
        let mut rng = rand::thread_rng();
        for stream in node.streams() {
            for attrs in stream.instances.values() {
                for attr in attrs.keys() {
                    let base = rng.gen_range(10.0..500.0);
                    oms = oms.with_synthetic_attribute(attr, node.sample_rate(), base, base * 0.01);
                }
            }
        }
        oms
    }

    /// Register a platform id.
    pub fn with_platform(self, platform_id: &str) -> Self {
        self.state.lock().platforms.insert(platform_id.to_string());
        self
    }

    /// Register a port (initially off).
    pub fn with_port(self, port: OmsPortControlId) -> Self {
        self.state.lock().ports.insert(port, PortState::default());
        self
    }

    /// Register an available profiler mission.
    pub fn with_mission(self, name: &str) -> Self {
        self.state.lock().missions.push(name.to_string());
        self
    }

    /// Generate values for `attr` every `period` seconds around `base`.
    pub fn with_synthetic_attribute(self, attr: &str, period: f64, base: f64, noise: f64) -> Self {
        self.state.lock().synthetic.insert(
            attr.to_string(),
            SyntheticSignal {
                period,
                base,
                noise,
            },
        );
        self
    }

    /// How far back (seconds) attribute history is kept.
    pub fn with_history_limit(self, secs: f64) -> Self {
        self.state.lock().history_limit_secs = secs;
        self
    }

    /// Append an explicit (value, timestamp) point for `attr`.
    pub fn push_attribute_value(&self, attr: &str, value: Value, timestamp: f64) {
        self.state
            .lock()
            .history
            .entry(attr.to_string())
            .or_default()
            .push((value, timestamp));
    }

    /// Fix the simulator clock (NTP seconds). `None` follows the wall clock.
    pub fn set_now(&self, now: Option<f64>) {
        self.state.lock().now = now;
    }

    /// Reply returned by `ping`.
    pub fn set_ping_reply(&self, reply: Option<&str>) {
        self.state.lock().ping_reply = reply.map(str::to_string);
    }

    /// Fail the next call with `failure`.
    pub fn trigger_failure(&self, failure: InjectedFailure) {
        self.state.lock().fail_next = Some(failure);
    }

    /// Fail every call with a socket error until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Return `response` verbatim for every call to `method`.
    pub fn override_response(&self, method: &str, response: Value) {
        self.state
            .lock()
            .overrides
            .insert(method.to_string(), response);
    }

    /// Return `value` verbatim as the value list of `attr`.
    pub fn override_attribute(&self, attr: &str, value: Value) {
        self.state
            .lock()
            .attribute_overrides
            .insert(attr.to_string(), value);
    }

    /// Remove all response and attribute overrides.
    pub fn clear_overrides(&self) {
        let mut state = self.state.lock();
        state.overrides.clear();
        state.attribute_overrides.clear();
    }

    /// Get a copy of the most recent calls, oldest first
    pub fn call_log(&self) -> Vec<String> {
        self.state.lock().call_log.iter().cloned().collect()
    }

    /// Clear the call log
    pub fn clear_call_log(&self) {
        self.state.lock().call_log.clear();
    }

    /// Current state of a port.
    pub fn port_state(&self, port: OmsPortControlId) -> Option<PortState> {
        self.state.lock().ports.get(&port).cloned()
    }

    /// Currently registered listener urls.
    pub fn listeners(&self) -> Vec<String> {
        self.state.lock().listeners.clone()
    }

    /// Name of the running mission, if any.
    pub fn running_mission(&self) -> Option<String> {
        self.state.lock().running_mission.clone()
    }

    fn port_call(
        &self,
        method: &str,
        platform_id: &str,
        port: OmsPortControlId,
        detail: String,
        apply: impl FnOnce(&mut PortState),
        ack: &str,
    ) -> Result<Value, TransportError> {
        let mut state = self.state.lock();
        if let Some(response) = state.begin(method, detail)? {
            return Ok(response);
        }
        if !state.platforms.contains(platform_id) {
            return Ok(json!({ platform_id: InvalidResponse::PLATFORM_ID }));
        }
        let key = port.to_string();
        let payload = match state.ports.get_mut(&port) {
            Some(port_state) => {
                apply(port_state);
                json!({ key: ack })
            }
            None => json!({ key: InvalidResponse::PORT_ID }),
        };
        Ok(json!({ platform_id: payload }))
    }

    fn attribute_values(state: &SimState, attrs: &[(String, f64)]) -> Value {
        let now = state.now();
        let mut payload = Map::new();
        for (attr, from_time) in attrs {
            if let Some(value) = state.attribute_overrides.get(attr) {
                payload.insert(attr.clone(), value.clone());
                continue;
            }
            let known = state.history.contains_key(attr) || state.synthetic.contains_key(attr);
            if !known {
                payload.insert(attr.clone(), json!(InvalidResponse::ATTRIBUTE_ID));
                continue;
            }
            if *from_time < now - state.history_limit_secs {
                payload.insert(
                    attr.clone(),
                    json!([[InvalidResponse::DATA_REQUEST_TOO_FAR_IN_PAST, from_time]]),
                );
                continue;
            }

            let mut points: Vec<Value> = state
                .history
                .get(attr)
                .map(|values| {
                    values
                        .iter()
                        .filter(|(_, ts)| *ts >= *from_time && *ts <= now)
                        .map(|(v, ts)| json!([v, ts]))
                        .collect()
                })
                .unwrap_or_default();

            if let Some(signal) = state.synthetic.get(attr) {
                points.extend(synthetic_points(signal, *from_time, now));
            }
            payload.insert(attr.clone(), Value::Array(points));
        }
        Value::Object(payload)
    }
}

fn synthetic_points(signal: &SyntheticSignal, from_time: f64, now: f64) -> Vec<Value> {
    if !(signal.period > 0.0) || from_time > now {
        return Vec::new();
    }
    let mut rng = rand::thread_rng();
    let first = (from_time / signal.period).ceil() as i64;
    let last = (now / signal.period).floor() as i64;
    (first..=last)
        .rev()
        .take(MAX_SYNTHETIC_POINTS)
        .map(|k| {
            let jitter = if signal.noise > 0.0 {
                rng.gen_range(-signal.noise..=signal.noise)
            } else {
                0.0
            };
            json!([signal.base + jitter, k as f64 * signal.period])
        })
        .collect()
}

#[async_trait]
impl OmsClient for SimulatedOms {
    async fn ping(&self) -> Result<Option<String>, TransportError> {
        let mut state = self.state.lock();
        if let Some(response) = state.begin("ping", String::new())? {
            return Ok(response.as_str().map(str::to_string));
        }
        Ok(state.ping_reply.clone())
    }

    async fn get_platform_attribute_values(
        &self,
        platform_id: &str,
        attrs: &[(String, f64)],
    ) -> Result<Value, TransportError> {
        let mut state = self.state.lock();
        let detail = format!("{platform_id}, {} attrs", attrs.len());
        if let Some(response) = state.begin("get_platform_attribute_values", detail)? {
            return Ok(response);
        }
        if !state.platforms.contains(platform_id) {
            return Ok(json!({ platform_id: InvalidResponse::PLATFORM_ID }));
        }
        Ok(json!({ platform_id: Self::attribute_values(&state, attrs) }))
    }

    async fn set_over_current(
        &self,
        platform_id: &str,
        port: OmsPortControlId,
        milliamps: i64,
        microseconds: i64,
        src: &str,
    ) -> Result<Value, TransportError> {
        self.port_call(
            "set_over_current",
            platform_id,
            port,
            format!("{platform_id}, {port}, {milliamps}, {microseconds}, {src}"),
            |p| {
                p.milliamps = Some(milliamps);
                p.microseconds = Some(microseconds);
            },
            "OK: over current limits set",
        )
    }

    async fn turn_on_platform_port(
        &self,
        platform_id: &str,
        port: OmsPortControlId,
        src: &str,
    ) -> Result<Value, TransportError> {
        self.port_call(
            "turn_on_platform_port",
            platform_id,
            port,
            format!("{platform_id}, {port}, {src}"),
            |p| p.on = true,
            "OK: port turned on",
        )
    }

    async fn turn_off_platform_port(
        &self,
        platform_id: &str,
        port: OmsPortControlId,
        src: &str,
    ) -> Result<Value, TransportError> {
        self.port_call(
            "turn_off_platform_port",
            platform_id,
            port,
            format!("{platform_id}, {port}, {src}"),
            |p| p.on = false,
            "OK: port turned off",
        )
    }

    async fn start_mission(
        &self,
        platform_id: &str,
        mission_name: &str,
        src: &str,
    ) -> Result<Value, TransportError> {
        let mut state = self.state.lock();
        let detail = format!("{platform_id}, {mission_name}, {src}");
        if let Some(response) = state.begin("start_mission", detail)? {
            return Ok(response);
        }
        if !state.platforms.contains(platform_id) {
            return Ok(json!({ platform_id: InvalidResponse::PLATFORM_ID }));
        }
        let ack = if state.missions.iter().any(|m| m == mission_name) {
            state.running_mission = Some(mission_name.to_string());
            "OK: mission started"
        } else {
            "ERROR: unknown mission"
        };
        Ok(json!({ platform_id: { mission_name: ack } }))
    }

    async fn stop_mission(
        &self,
        platform_id: &str,
        flag: &str,
        src: &str,
    ) -> Result<Value, TransportError> {
        let mut state = self.state.lock();
        let detail = format!("{platform_id}, {flag}, {src}");
        if let Some(response) = state.begin("stop_mission", detail)? {
            return Ok(response);
        }
        if !state.platforms.contains(platform_id) {
            return Ok(json!({ platform_id: InvalidResponse::PLATFORM_ID }));
        }
        let ack = match state.running_mission.take() {
            Some(_) => "OK: mission stopped",
            None => "ERROR: no mission running",
        };
        Ok(json!({ platform_id: ack }))
    }

    async fn get_mission_status(&self, platform_id: &str) -> Result<Value, TransportError> {
        let mut state = self.state.lock();
        if let Some(response) = state.begin("get_mission_status", platform_id.to_string())? {
            return Ok(response);
        }
        if !state.platforms.contains(platform_id) {
            return Ok(json!({ platform_id: InvalidResponse::PLATFORM_ID }));
        }
        let status = match &state.running_mission {
            Some(name) => json!({ "status": "running", "mission": name }),
            None => json!({ "status": "idle", "mission": null }),
        };
        Ok(json!({ platform_id: status }))
    }

    async fn get_available_missions(&self, platform_id: &str) -> Result<Value, TransportError> {
        let mut state = self.state.lock();
        if let Some(response) = state.begin("get_available_missions", platform_id.to_string())? {
            return Ok(response);
        }
        if !state.platforms.contains(platform_id) {
            return Ok(json!({ platform_id: InvalidResponse::PLATFORM_ID }));
        }
        Ok(json!({ platform_id: state.missions }))
    }

    async fn register_event_listener(&self, url: &str) -> Result<Value, TransportError> {
        let mut state = self.state.lock();
        if let Some(response) = state.begin("register_event_listener", url.to_string())? {
            return Ok(response);
        }
        if !state.listeners.iter().any(|l| l == url) {
            state.listeners.push(url.to_string());
        }
        Ok(json!({ url: "OK" }))
    }

    async fn unregister_event_listener(&self, url: &str) -> Result<Value, TransportError> {
        let mut state = self.state.lock();
        if let Some(response) = state.begin("unregister_event_listener", url.to_string())? {
            return Ok(response);
        }
        let before = state.listeners.len();
        state.listeners.retain(|l| l != url);
        let ack = if state.listeners.len() < before {
            "OK"
        } else {
            "ERROR: not registered"
        };
        Ok(json!({ url: ack }))
    }

    async fn get_registered_event_listeners(&self) -> Result<Value, TransportError> {
        let mut state = self.state.lock();
        if let Some(response) = state.begin("get_registered_event_listeners", String::new())? {
            return Ok(response);
        }
        Ok(json!(state.listeners))
    }
}

/// Factory handing out a shared [`SimulatedOms`] for `sim://` URIs.
pub struct SimulatedOmsFactory {
    oms: Arc<SimulatedOms>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl SimulatedOmsFactory {
    /// Wrap a simulator.
    pub fn new(oms: Arc<SimulatedOms>) -> Self {
        Self {
            oms,
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        }
    }

    /// The simulator behind every client this factory creates.
    pub fn oms(&self) -> &Arc<SimulatedOms> {
        &self.oms
    }

    /// Number of clients created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of clients destroyed so far.
    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl OmsClientFactory for SimulatedOmsFactory {
    fn create_instance(&self, uri: &str) -> BoxFuture<'static, PlatformResult<Arc<dyn OmsClient>>> {
        let result = if uri.starts_with("sim://") {
            self.created.fetch_add(1, Ordering::SeqCst);
            let client: Arc<dyn OmsClient> = self.oms.clone();
            Ok(client)
        } else {
            Err(PlatformError::Configuration(format!(
                "unsupported oms_uri '{uri}': only sim:// is available in this build"
            )))
        };
        Box::pin(async move { result })
    }

    fn destroy_instance(&self, client: Arc<dyn OmsClient>) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        drop(client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oms() -> SimulatedOms {
        SimulatedOms::new()
            .with_platform("LJ01D")
            .with_port(OmsPortControlId(7))
            .with_mission("mission_01")
    }

    #[tokio::test]
    async fn test_turn_on_port_echoes_control_id() -> anyhow::Result<()> {
        let oms = oms();
        let response = oms
            .turn_on_platform_port("LJ01D", OmsPortControlId(7), "test")
            .await?;
        assert_eq!(response, json!({"LJ01D": {"7": "OK: port turned on"}}));
        assert_eq!(oms.port_state(OmsPortControlId(7)).map(|p| p.on), Some(true));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_platform() -> anyhow::Result<()> {
        let response = oms().get_mission_status("XX99").await?;
        assert_eq!(response, json!({"XX99": "INVALID_PLATFORM_ID"}));
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let oms = oms();
        oms.trigger_failure(InjectedFailure::Socket);
        assert!(matches!(oms.ping().await, Err(TransportError::Socket(_))));
        assert!(matches!(oms.ping().await, Ok(Some(reply)) if reply == "PONG"));
    }

    #[tokio::test]
    async fn test_attribute_values_filter_by_from_time() -> anyhow::Result<()> {
        let oms = oms();
        oms.set_now(Some(1000.0));
        oms.push_attribute_value("temp", json!(1), 900.0);
        oms.push_attribute_value("temp", json!(2), 950.0);
        let response = oms
            .get_platform_attribute_values(
                "LJ01D",
                &[("temp".to_string(), 925.0), ("nope".to_string(), 0.0)],
            )
            .await?;
        assert_eq!(response["LJ01D"]["temp"], json!([[2, 950.0]]));
        assert_eq!(response["LJ01D"]["nope"], json!("INVALID_ATTRIBUTE_ID"));
        Ok(())
    }

    #[tokio::test]
    async fn test_too_far_in_past() -> anyhow::Result<()> {
        let oms = oms().with_history_limit(100.0);
        oms.set_now(Some(1000.0));
        oms.push_attribute_value("temp", json!(1), 990.0);
        let response = oms
            .get_platform_attribute_values("LJ01D", &[("temp".to_string(), 10.0)])
            .await?;
        assert_eq!(
            response["LJ01D"]["temp"][0][0],
            json!("ERROR_DATA_REQUEST_TOO_FAR_IN_PAST")
        );
        Ok(())
    }

    #[test]
    fn test_synthetic_points_on_period_grid() {
        let signal = SyntheticSignal {
            period: 10.0,
            base: 5.0,
            noise: 0.0,
        };
        let points = synthetic_points(&signal, 15.0, 42.0);
        let stamps: Vec<f64> = points.iter().filter_map(|p| p[1].as_f64()).collect();
        assert_eq!(stamps, vec![40.0, 30.0, 20.0]);
    }

    #[tokio::test]
    async fn test_call_log_keeps_most_recent_calls() -> anyhow::Result<()> {
        let oms = oms();
        for _ in 0..CALL_LOG_CAPACITY {
            oms.ping().await?;
        }
        oms.get_mission_status("LJ01D").await?;

        let log = oms.call_log();
        assert_eq!(log.len(), CALL_LOG_CAPACITY);
        assert_eq!(log.last().map(String::as_str), Some("get_mission_status(LJ01D)"));
        Ok(())
    }

    #[tokio::test]
    async fn test_factory_rejects_non_sim_uri() {
        let factory = SimulatedOmsFactory::new(Arc::new(oms()));
        assert!(factory.create_instance("http://oms:9021").await.is_err());
        assert!(factory.create_instance("sim://local").await.is_ok());
        assert_eq!(factory.created(), 1);
    }
}

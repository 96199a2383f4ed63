//! One logical OMS command per method.
//!
//! Each operation follows the same path:
//!
//! 1. check a client is attached (the single connection guard)
//! 2. resolve the port control id where a port is addressed
//! 3. issue the remote call; transport failures become [`PlatformError::Connection`]
//! 4. rewrite the port key, verify the envelope and the acknowledgment
//! 5. return the per-platform payload
//!
//! This is the only place a [`TransportError`] is converted.

use crate::error::{PlatformError, PlatformResult, TransportError};
use crate::node_config::OmsPortControlId;
use crate::oms::{InvalidResponse, OmsClient};
use crate::platform::ports::PortMapper;
use crate::platform::verifier::{verify_platform_id, verify_status};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One `(value, timestamp)` point returned for an attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeSample {
    /// Raw OMS value
    pub value: Value,
    /// OMS timestamp (NTP seconds)
    pub timestamp: f64,
}

/// Attribute values keyed by attribute id. Unknown attributes are absent.
pub type AttributeValues = BTreeMap<String, Vec<AttributeSample>>;

fn connection_error(call: &str, err: TransportError) -> PlatformError {
    PlatformError::Connection(format!("Cannot {call}: {err}"))
}

/// Executes OMS commands for one platform.
pub struct CommandExecutor {
    platform_id: String,
    ports: PortMapper,
    client: Option<Arc<dyn OmsClient>>,
}

impl CommandExecutor {
    /// Executor for `platform_id` with no client attached.
    pub fn new(platform_id: &str, ports: PortMapper) -> Self {
        Self {
            platform_id: platform_id.to_string(),
            ports,
            client: None,
        }
    }

    /// Platform id placed in every call.
    pub fn platform_id(&self) -> &str {
        &self.platform_id
    }

    /// Attach the client created by `connect`.
    pub fn attach(&mut self, client: Arc<dyn OmsClient>) {
        self.client = Some(client);
    }

    /// Detach and return the client.
    pub fn detach(&mut self) -> Option<Arc<dyn OmsClient>> {
        self.client.take()
    }

    fn client(&self, operation: &str) -> PlatformResult<&Arc<dyn OmsClient>> {
        self.client.as_ref().ok_or_else(|| {
            PlatformError::Connection(format!(
                "Cannot {operation}: OMS client required (created via connect() call)"
            ))
        })
    }

    /// Liveness probe. Succeeds only on a (case-insensitive) `"PONG"` reply.
    pub async fn ping(&self) -> PlatformResult<&'static str> {
        let client = self.client("ping")?;
        let reply = client
            .ping()
            .await
            .map_err(|e| connection_error("ping", e))?;
        match reply {
            Some(reply) if reply.eq_ignore_ascii_case("PONG") => Ok("PONG"),
            other => Err(PlatformError::Connection(format!(
                "Unexpected ping response: {other:?}"
            ))),
        }
    }

    /// Attribute fetch from an untyped request: a sequence of `[attr_id, from_time]`.
    ///
    /// The request is validated before any remote call.
    pub async fn get_attribute_values(&self, attrs: &Value) -> PlatformResult<AttributeValues> {
        let requests = parse_attribute_request(attrs)?;
        self.fetch_attribute_values(&requests).await
    }

    /// Attribute fetch for `(attr_id, from_time)` pairs.
    ///
    /// Attributes the OMS reports as invalid are dropped. A malformed value list or a
    /// request too far in the past is a [`PlatformError::Protocol`].
    pub async fn fetch_attribute_values(&self, attrs: &[(String, f64)]) -> PlatformResult<AttributeValues> {
        let client = self.client("get_attribute_values")?;
        let response = client
            .get_platform_attribute_values(&self.platform_id, attrs)
            .await
            .map_err(|e| connection_error("get_platform_attribute_values", e))?;

        let payload = verify_platform_id(response, &self.platform_id)?;
        let Value::Object(payload) = payload else {
            return Err(PlatformError::Protocol(format!(
                "Error returned in requesting attributes: {payload}"
            )));
        };

        let mut values = AttributeValues::new();
        for (attr, value_list) in payload {
            if value_list.as_str() == Some(InvalidResponse::ATTRIBUTE_ID) {
                tracing::debug!(platform_id = %self.platform_id, attr = %attr, "OMS reports invalid attribute id");
                continue;
            }
            let samples = parse_value_list(&attr, &value_list)?;
            values.insert(attr, samples);
        }
        Ok(values)
    }

    /// Set the over-current limits of a port.
    pub async fn set_overcurrent_limit(
        &self,
        port_id: &str,
        milliamps: i64,
        microseconds: i64,
        src: &str,
    ) -> PlatformResult<Value> {
        let client = self.client("set_overcurrent_limit")?;
        let cntl_id = self.ports.external_to_internal(port_id, "set_overcurrent_limit")?;
        let response = client
            .set_over_current(&self.platform_id, cntl_id, milliamps, microseconds, src)
            .await
            .map_err(|e| connection_error("set_overcurrent_limit", e))?;
        self.finish_port_call(port_id, cntl_id, response, "setting overcurrent")
    }

    /// Power a port on.
    pub async fn turn_on_port(&self, port_id: &str, src: &str) -> PlatformResult<Value> {
        let client = self.client("turn_on_port")?;
        let cntl_id = self.ports.external_to_internal(port_id, "turn_on_port")?;
        let response = client
            .turn_on_platform_port(&self.platform_id, cntl_id, src)
            .await
            .map_err(|e| connection_error("turn_on_platform_port", e))?;
        tracing::info!(platform_id = %self.platform_id, port_id, %cntl_id, src, "turn on port");
        self.finish_port_call(port_id, cntl_id, response, "turn on port")
    }

    /// Power a port off.
    pub async fn turn_off_port(&self, port_id: &str, src: &str) -> PlatformResult<Value> {
        let client = self.client("turn_off_port")?;
        let cntl_id = self.ports.external_to_internal(port_id, "turn_off_port")?;
        let response = client
            .turn_off_platform_port(&self.platform_id, cntl_id, src)
            .await
            .map_err(|e| connection_error("turn_off_platform_port", e))?;
        tracing::info!(platform_id = %self.platform_id, port_id, %cntl_id, src, "turn off port");
        self.finish_port_call(port_id, cntl_id, response, "turn off port")
    }

    fn finish_port_call(
        &self,
        port_id: &str,
        cntl_id: OmsPortControlId,
        response: Value,
        purpose: &str,
    ) -> PlatformResult<Value> {
        let response = self.ports.translate_response_key(port_id, cntl_id, response);
        let payload = verify_platform_id(response, &self.platform_id)?;
        verify_status(&payload, Some(port_id), purpose)?;
        Ok(payload)
    }

    /// Start a profiler mission.
    pub async fn start_profiler_mission(&self, mission_name: &str, src: &str) -> PlatformResult<Value> {
        let client = self.client("start_profiler_mission")?;
        let response = client
            .start_mission(&self.platform_id, mission_name, src)
            .await
            .map_err(|e| connection_error("start_profiler_mission", e))?;
        let payload = verify_platform_id(response, &self.platform_id)?;
        verify_status(&payload, Some(mission_name), "starting mission")?;
        Ok(payload)
    }

    /// Stop the profiler mission. The payload itself is the acknowledgment.
    pub async fn stop_profiler_mission(&self, flag: &str, src: &str) -> PlatformResult<Value> {
        let client = self.client("stop_profiler_mission")?;
        let response = client
            .stop_mission(&self.platform_id, flag, src)
            .await
            .map_err(|e| connection_error("stop_profiler_mission", e))?;
        let payload = verify_platform_id(response, &self.platform_id)?;
        verify_status(&payload, None, "stopping profiler")?;
        Ok(payload)
    }

    /// Profiler mission status.
    pub async fn get_mission_status(&self) -> PlatformResult<Value> {
        let client = self.client("get_mission_status")?;
        let response = client
            .get_mission_status(&self.platform_id)
            .await
            .map_err(|e| connection_error("get_mission_status", e))?;
        verify_platform_id(response, &self.platform_id)
    }

    /// Missions available to the profiler.
    pub async fn get_available_missions(&self) -> PlatformResult<Value> {
        let client = self.client("get_available_missions")?;
        let response = client
            .get_available_missions(&self.platform_id)
            .await
            .map_err(|e| connection_error("get_available_missions", e))?;
        verify_platform_id(response, &self.platform_id)
    }

    /// Register `url` for all OMS event types unless it already is.
    pub async fn register_event_listener(&self, url: &str) -> PlatformResult<()> {
        let client = self.client("register_event_listener")?;
        let registered = client.get_registered_event_listeners().await.map_err(|e| {
            PlatformError::Connection(format!(
                "{}: Cannot get registered event listeners: {e}",
                self.platform_id
            ))
        })?;

        let already = match &registered {
            Value::Array(urls) => urls.iter().any(|u| u.as_str() == Some(url)),
            Value::Object(urls) => urls.contains_key(url),
            _ => false,
        };
        if already {
            tracing::debug!(platform_id = %self.platform_id, url, "listener was already registered");
            return Ok(());
        }

        let result = client
            .register_event_listener(url)
            .await
            .map_err(|e| connection_error("register_event_listener", e))?;
        tracing::debug!(platform_id = %self.platform_id, url, %result, "register_event_listener");
        Ok(())
    }

    /// Unregister `url` for all OMS event types.
    pub async fn unregister_event_listener(&self, url: &str) -> PlatformResult<()> {
        let client = self.client("unregister_event_listener")?;
        let result = client
            .unregister_event_listener(url)
            .await
            .map_err(|e| connection_error("unregister_event_listener", e))?;
        tracing::debug!(platform_id = %self.platform_id, url, %result, "unregister_event_listener");
        Ok(())
    }
}

fn parse_attribute_request(attrs: &Value) -> PlatformResult<Vec<(String, f64)>> {
    let invalid = || {
        PlatformError::Argument(format!(
            "get_attribute_values: attrs argument must be a list [(attrName, from_time), ...]. Given: {attrs}"
        ))
    };
    let items = attrs.as_array().ok_or_else(invalid)?;
    items
        .iter()
        .map(|item| match item.as_array().map(Vec::as_slice) {
            Some([name, from_time]) => match (name.as_str(), from_time.as_f64()) {
                (Some(name), Some(from_time)) => Ok((name.to_string(), from_time)),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        })
        .collect()
}

fn parse_value_list(attr: &str, value_list: &Value) -> PlatformResult<Vec<AttributeSample>> {
    let Some(points) = value_list.as_array() else {
        return Err(PlatformError::Protocol(format!(
            "Error in getting values for attribute {attr}. {value_list}"
        )));
    };

    let too_far = points
        .first()
        .and_then(|first| first.get(0))
        .and_then(Value::as_str)
        == Some(InvalidResponse::DATA_REQUEST_TOO_FAR_IN_PAST);
    if too_far {
        return Err(PlatformError::Protocol(format!(
            "Time requested for {attr} too far in the past"
        )));
    }

    points
        .iter()
        .map(|point| match point.as_array().map(Vec::as_slice) {
            Some([value, timestamp]) => timestamp
                .as_f64()
                .map(|timestamp| AttributeSample {
                    value: value.clone(),
                    timestamp,
                })
                .ok_or_else(|| {
                    PlatformError::Protocol(format!(
                        "Error in getting values for attribute {attr}: bad timestamp in {point}"
                    ))
                }),
            _ => Err(PlatformError::Protocol(format!(
                "Error in getting values for attribute {attr}: expected [value, timestamp], got {point}"
            ))),
        })
        .collect()
}

/// Attribute values as JSON: `{attr: [[value, timestamp], ...]}`.
pub fn attribute_values_to_json(values: &AttributeValues) -> Value {
    let map: Map<String, Value> = values
        .iter()
        .map(|(attr, samples)| {
            let points = samples
                .iter()
                .map(|s| Value::Array(vec![s.value.clone(), Value::from(s.timestamp)]))
                .collect();
            (attr.clone(), Value::Array(points))
        })
        .collect();
    Value::Object(map)
}

//! Translation between external port ids and OMS port control ids.

use crate::error::{PlatformError, PlatformResult};
use crate::node_config::{NodeConfiguration, OmsPortControlId};
use crate::platform::verifier::is_truthy;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Port table of one platform, read-only after construction.
#[derive(Debug, Clone)]
pub struct PortMapper {
    platform_id: String,
    ports: BTreeMap<String, OmsPortControlId>,
}

impl PortMapper {
    /// Build the table from the node configuration.
    pub fn new(node: &NodeConfiguration) -> Self {
        let ports = node
            .ports()
            .iter()
            .map(|(port_id, info)| (port_id.clone(), info.port_oms_port_cntl_id))
            .collect();
        Self {
            platform_id: node.platform_id().to_string(),
            ports,
        }
    }

    /// Control id for `port_id`.
    ///
    /// An unknown port is reported as a [`PlatformError::Connection`] naming `method`.
    pub fn external_to_internal(&self, port_id: &str, method: &str) -> PlatformResult<OmsPortControlId> {
        self.ports
            .get(port_id)
            .copied()
            .ok_or_else(|| PlatformError::Connection(format!("Cannot {method}: Invalid Port ID")))
    }

    /// Rewrite the control-id key of a port response back to `port_id`.
    ///
    /// The envelope is returned unchanged when the control id key is absent or
    /// falsy in the platform payload.
    pub fn translate_response_key(&self, port_id: &str, cntl_id: OmsPortControlId, envelope: Value) -> Value {
        let key = cntl_id.to_string();
        let ack = envelope
            .get(&self.platform_id)
            .and_then(|payload| payload.get(&key))
            .filter(|ack| is_truthy(ack))
            .cloned();

        match ack {
            Some(ack) => json!({ self.platform_id.as_str(): { port_id: ack } }),
            None => envelope,
        }
    }
}

//! Static per-node configuration.
//!
//! A node file describes one platform node: its metadata, the controllable power
//! ports and their OMS control ids, and the engineering streams to poll.
//!
//! ```yaml
//! node_meta_data:
//!   reference_designator: RS01SLBS-LJ01A
//!   oms_sample_rate: 60
//!   nms_source: 1
//! port_info:
//!   J01: { port_oms_port_cntl_id: 1 }
//! node_streams:
//!   lj01a_eng:
//!     "00":
//!       sec_node_temp: { scale_factor: 0.1, ion_parameter_name: temperature }
//! ```
//!
//! The file is read once when the driver is configured; every table is read-only
//! afterwards.

use crate::error::{PlatformError, PlatformResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// The OMS's internal numeric key for a power-controllable port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OmsPortControlId(pub u32);

impl fmt::Display for OmsPortControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetaData {
    /// Reference designator used to qualify emitted sample ids
    pub reference_designator: String,
    /// Telemetry poll period in seconds
    pub oms_sample_rate: f64,
    /// Source identifier reported by the network management system
    #[serde(default)]
    pub nms_source: Option<serde_json::Value>,
    /// Any additional metadata, passed through to `get_metadata`
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Configuration of one power port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortInfo {
    /// OMS control id addressed by port commands
    pub port_oms_port_cntl_id: OmsPortControlId,
}

/// Unit conversion for one OMS attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    /// Factor applied to raw OMS values
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    /// Externally visible parameter name
    pub ion_parameter_name: String,
}

fn default_scale_factor() -> f64 {
    1.0
}

/// Attributes of one stream instance, keyed by OMS attribute id.
pub type StreamInstance = BTreeMap<String, AttributeDefinition>;

/// A named telemetry stream and its instances.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDefinition {
    /// Stream name, used as the sample type tag
    pub name: String,
    /// Instances keyed by instance name
    pub instances: BTreeMap<String, StreamInstance>,
}

#[derive(Debug, Deserialize)]
struct NodeFile {
    node_meta_data: NodeMetaData,
    #[serde(default)]
    port_info: BTreeMap<String, PortInfo>,
    #[serde(default)]
    node_streams: BTreeMap<String, BTreeMap<String, StreamInstance>>,
}

/// Parsed node configuration for one platform.
#[derive(Debug, Clone)]
pub struct NodeConfiguration {
    platform_id: String,
    meta: NodeMetaData,
    ports: BTreeMap<String, PortInfo>,
    streams: Vec<StreamDefinition>,
}

impl NodeConfiguration {
    /// Read and validate the node file for `platform_id`.
    pub fn open(platform_id: &str, path: impl AsRef<Path>) -> PlatformResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let node = Self::from_yaml(platform_id, &text)?;
        tracing::debug!(platform_id, path = %path.display(), "node configuration loaded");
        Ok(node)
    }

    /// Parse a node configuration from YAML text.
    pub fn from_yaml(platform_id: &str, text: &str) -> PlatformResult<Self> {
        let file: NodeFile = serde_yaml::from_str(text)?;
        let streams = file
            .node_streams
            .into_iter()
            .map(|(name, instances)| StreamDefinition { name, instances })
            .collect();

        let node = Self {
            platform_id: platform_id.to_string(),
            meta: file.node_meta_data,
            ports: file.port_info,
            streams,
        };
        node.validate()?;
        Ok(node)
    }

    fn validate(&self) -> PlatformResult<()> {
        if !(self.meta.oms_sample_rate > 0.0) {
            return Err(PlatformError::Configuration(format!(
                "{}: oms_sample_rate must be positive, got {}",
                self.platform_id, self.meta.oms_sample_rate
            )));
        }
        self.poll_period()?;
        for stream in &self.streams {
            for (instance, attrs) in &stream.instances {
                if let Some((attr, _)) = attrs
                    .iter()
                    .find(|(_, def)| def.ion_parameter_name.trim().is_empty())
                {
                    return Err(PlatformError::Configuration(format!(
                        "{}: attribute {attr} of {}/{instance} has no ion_parameter_name",
                        self.platform_id, stream.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Platform identity this configuration was opened for.
    pub fn platform_id(&self) -> &str {
        &self.platform_id
    }

    /// Poll period in seconds.
    pub fn sample_rate(&self) -> f64 {
        self.meta.oms_sample_rate
    }

    /// Scheduler period. Fails unless the sample rate is a non-zero `Duration`.
    pub fn poll_period(&self) -> PlatformResult<Duration> {
        let rate = self.meta.oms_sample_rate;
        match Duration::try_from_secs_f64(rate) {
            Ok(period) if !period.is_zero() => Ok(period),
            Ok(_) => Err(PlatformError::Configuration(format!(
                "{}: oms_sample_rate {rate} rounds to a zero period",
                self.platform_id
            ))),
            Err(e) => Err(PlatformError::Configuration(format!(
                "{}: invalid oms_sample_rate {rate}: {e}",
                self.platform_id
            ))),
        }
    }

    /// Reference designator used in sample instance ids.
    pub fn reference_designator(&self) -> &str {
        &self.meta.reference_designator
    }

    /// Port table keyed by external port id.
    pub fn ports(&self) -> &BTreeMap<String, PortInfo> {
        &self.ports
    }

    /// Configured telemetry streams.
    pub fn streams(&self) -> &[StreamDefinition] {
        &self.streams
    }

    /// Node metadata as a JSON object.
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::to_value(&self.meta).unwrap_or(serde_json::Value::Null)
    }

    /// Log a summary of the node (ports and streams) at info level.
    pub fn log_summary(&self) {
        tracing::info!(
            platform_id = %self.platform_id,
            reference_designator = %self.meta.reference_designator,
            sample_rate = self.meta.oms_sample_rate,
            ports = self.ports.len(),
            streams = self.streams.len(),
            "node configuration"
        );
        for (port_id, info) in &self.ports {
            tracing::debug!(port_id = %port_id, cntl_id = %info.port_oms_port_cntl_id, "port");
        }
        for stream in &self.streams {
            for (instance, attrs) in &stream.instances {
                tracing::debug!(stream = %stream.name, instance = %instance, attributes = attrs.len(), "stream");
            }
        }
    }
}

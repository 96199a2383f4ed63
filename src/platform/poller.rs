//! Incremental telemetry polling.
//!
//! Each stream keeps a watermark: the latest OMS timestamp already emitted. A cycle
//! requests values strictly newer than the watermark (`watermark + 0.1`), groups the
//! answer by timestamp and emits one sample per distinct timestamp.
//!
//! The watermark is clamped to `now - 10 * sample_rate` before every request so a
//! long outage never turns into an unbounded backlog fetch.

use crate::error::{PlatformError, PlatformResult};
use crate::node_config::{NodeConfiguration, StreamDefinition, StreamInstance};
use crate::platform::events::{EmittedSample, SampleValue};
use crate::platform::executor::{AttributeValues, CommandExecutor};
use crate::platform::verifier::is_truthy;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;

/// Offset added to a watermark so the last emitted sample is not delivered again.
pub const WATERMARK_EPSILON: f64 = 0.1;

/// Number of sample periods the poller may look back.
pub const MAX_LOOKBACK_PERIODS: f64 = 10.0;

/// What one poll cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollSummary {
    /// Samples handed to the sink
    pub emitted: usize,
    /// Streams skipped after a protocol error
    pub skipped_streams: Vec<String>,
}

/// Per-stream watermark state.
#[derive(Debug, Default)]
pub struct TelemetryPoller {
    watermarks: HashMap<String, f64>,
}

impl TelemetryPoller {
    /// Poller with no watermarks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current watermark of `stream`.
    pub fn watermark(&self, stream: &str) -> Option<f64> {
        self.watermarks.get(stream).copied()
    }

    /// Forget every watermark; the next cycle starts from the lookback floor.
    pub fn reset(&mut self) {
        self.watermarks.clear();
    }

    /// Run one cycle over every stream of `node`.
    ///
    /// A connection error aborts the cycle and is returned. A protocol error skips
    /// the rest of that stream and the cycle continues with the next stream.
    pub async fn poll_cycle(
        &mut self,
        executor: &CommandExecutor,
        node: &NodeConfiguration,
        now_ntp: f64,
        sink: &mut (dyn FnMut(EmittedSample) + Send),
    ) -> PlatformResult<PollSummary> {
        let max_lookback = now_ntp - node.sample_rate() * MAX_LOOKBACK_PERIODS;
        let mut summary = PollSummary::default();

        for stream in node.streams() {
            tracing::debug!(platform_id = %executor.platform_id(), stream = %stream.name, "polling stream");
            let watermark = self
                .watermarks
                .get(&stream.name)
                .copied()
                .unwrap_or(max_lookback)
                .max(max_lookback);
            self.watermarks.insert(stream.name.clone(), watermark);

            let result = self
                .poll_stream(executor, node.reference_designator(), stream, watermark, sink, &mut summary)
                .await;

            match result {
                Ok(()) => {}
                Err(PlatformError::Connection(reason)) => {
                    return Err(PlatformError::Connection(reason));
                }
                Err(e) => {
                    tracing::warn!(
                        platform_id = %executor.platform_id(),
                        stream = %stream.name,
                        error = %e,
                        "skipping stream for this poll cycle"
                    );
                    summary.skipped_streams.push(stream.name.clone());
                }
            }
        }

        Ok(summary)
    }

    async fn poll_stream(
        &mut self,
        executor: &CommandExecutor,
        reference_designator: &str,
        stream: &StreamDefinition,
        watermark: f64,
        sink: &mut (dyn FnMut(EmittedSample) + Send),
        summary: &mut PollSummary,
    ) -> PlatformResult<()> {
        let from_time = watermark + WATERMARK_EPSILON;

        for (instance, attrs) in &stream.instances {
            let request: Vec<(String, f64)> = attrs.keys().map(|attr| (attr.clone(), from_time)).collect();
            if request.is_empty() {
                continue;
            }

            let values = executor.fetch_attribute_values(&request).await?;
            let grouped = group_by_timestamp(&values);
            if grouped.is_empty() {
                continue;
            }

            if let Some(latest) = grouped.iter().map(|(ts, _)| *ts).reduce(f64::max) {
                self.advance(&stream.name, latest);
            }

            for (timestamp, raw) in grouped {
                let sample = EmittedSample {
                    stream: stream.name.clone(),
                    timestamp,
                    values: convert_attrs(attrs, raw),
                    instance: format!("{reference_designator}-{instance}"),
                    time: Utc::now(),
                };
                sink(sample);
                summary.emitted += 1;
            }
        }
        Ok(())
    }

    fn advance(&mut self, stream: &str, latest: f64) {
        let watermark = self.watermarks.entry(stream.to_string()).or_insert(latest);
        if latest > *watermark {
            *watermark = latest;
        }
    }
}

/// Group attribute values by timestamp, ascending.
///
/// Every attribute sharing a timestamp ends up in the same group.
pub fn group_by_timestamp(values: &AttributeValues) -> Vec<(f64, Vec<(String, Value)>)> {
    let mut groups: Vec<(f64, Vec<(String, Value)>)> = Vec::new();
    for (attr, samples) in values {
        for sample in samples {
            let entry = (attr.clone(), sample.value.clone());
            match groups.iter_mut().find(|(ts, _)| *ts == sample.timestamp) {
                Some((_, group)) => group.push(entry),
                None => groups.push((sample.timestamp, vec![entry])),
            }
        }
    }
    groups.sort_by(|a, b| a.0.total_cmp(&b.0));
    groups
}

/// Rename attributes to their parameter names and apply scale factors.
///
/// Falsy values (zero, null, empty) and non-numeric values pass through unscaled.
/// Attributes with no definition in the instance are dropped.
pub fn convert_attrs(instance: &StreamInstance, attrs: Vec<(String, Value)>) -> Vec<SampleValue> {
    attrs
        .into_iter()
        .filter_map(|(attr, value)| {
            let Some(def) = instance.get(&attr) else {
                tracing::warn!(attr = %attr, "OMS returned an attribute with no stream definition");
                return None;
            };
            let value = match value.as_f64() {
                Some(raw) if is_truthy(&value) => Value::from(raw * def.scale_factor),
                _ => value,
            };
            Some(SampleValue {
                value_id: def.ion_parameter_name.clone(),
                value,
            })
        })
        .collect()
}

//! Response envelope verification.
//!
//! Every OMS response is a mapping keyed by platform id. These checks only raise;
//! they never swallow an error.

use crate::error::{PlatformError, PlatformResult};
use crate::oms::InvalidResponse;
use serde_json::Value;

/// Unwrap the per-platform payload of `envelope`.
///
/// Fails with [`PlatformError::Protocol`] if the platform key is absent or the
/// payload is the invalid-platform sentinel.
pub fn verify_platform_id(envelope: Value, platform_id: &str) -> PlatformResult<Value> {
    let payload = match envelope {
        Value::Object(mut map) => map.remove(platform_id),
        _ => None,
    };

    match payload {
        None => {
            let msg = format!("unexpected: response does not contain entry for '{platform_id}'");
            tracing::error!(platform_id, "{msg}");
            Err(PlatformError::Protocol(msg))
        }
        Some(Value::String(s)) if s == InvalidResponse::PLATFORM_ID => {
            let msg = format!("response reports invalid platform_id for '{platform_id}'");
            tracing::error!(platform_id, "{msg}");
            Err(PlatformError::Protocol(msg))
        }
        Some(payload) => Ok(payload),
    }
}

/// Check an acknowledgment.
///
/// With a `key` the acknowledgment is `payload[key]`, otherwise the payload itself.
/// It must be a string starting with `"OK"`.
pub fn verify_status(payload: &Value, key: Option<&str>, purpose: &str) -> PlatformResult<()> {
    let ack = match key {
        Some(key) => payload.get(key).ok_or_else(|| {
            PlatformError::Protocol(format!("Error in {purpose} response: missing key {key} in {payload}"))
        })?,
        None => payload,
    };

    match ack.as_str() {
        Some(s) if s.starts_with("OK") => Ok(()),
        _ => Err(PlatformError::Protocol(format!(
            "Error in {purpose} for key {}: {ack}",
            key.unwrap_or("<none>")
        ))),
    }
}

/// Whether a JSON value counts as present: not null, false, zero or empty.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwraps_own_payload() -> anyhow::Result<()> {
        let envelope = json!({"LJ01D": {"J01": "OK: port turned on"}, "other": 1});
        let payload = verify_platform_id(envelope, "LJ01D")?;
        assert_eq!(payload, json!({"J01": "OK: port turned on"}));
        Ok(())
    }

    #[test]
    fn test_missing_platform_key() {
        for envelope in [json!({"LV01A": "OK"}), json!({}), json!("OK"), json!(null)] {
            assert!(matches!(
                verify_platform_id(envelope, "LJ01D"),
                Err(PlatformError::Protocol(_))
            ));
        }
    }

    #[test]
    fn test_invalid_platform_sentinel() {
        let envelope = json!({"LJ01D": "INVALID_PLATFORM_ID"});
        assert!(matches!(
            verify_platform_id(envelope, "LJ01D"),
            Err(PlatformError::Protocol(msg)) if msg.contains("invalid platform_id")
        ));
    }

    #[test]
    fn test_ok_prefix_accepted() {
        for ack in ["OK", "OK: done", "OKAY"] {
            assert!(verify_status(&json!({"J01": ack}), Some("J01"), "turn on port").is_ok());
        }
        assert!(verify_status(&json!("OK: mission stopped"), None, "stopping profiler").is_ok());
    }

    #[test]
    fn test_non_ok_status_rejected() {
        for ack in [json!("ERROR: busy"), json!("ok"), json!(" OK"), json!(1), json!(null)] {
            let payload = json!({"J01": ack});
            assert!(matches!(
                verify_status(&payload, Some("J01"), "turn on port"),
                Err(PlatformError::Protocol(msg)) if msg.contains("J01") && msg.contains("turn on port")
            ));
        }
    }

    #[test]
    fn test_missing_status_key() {
        let payload = json!({"12": "OK"});
        assert!(matches!(
            verify_status(&payload, Some("J01"), "setting overcurrent"),
            Err(PlatformError::Protocol(msg))
                if msg.contains("setting overcurrent") && msg.contains("missing key J01")
        ));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!(-1.5)));
        assert!(is_truthy(&json!("OK")));
    }
}

//! Shared timestamp/id helpers for records, audit events and envelopes.

use serde_json::{Map, Value as JsonValue};
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Audit and envelope timestamp: unix-epoch seconds with a `Z` suffix.
pub fn now_epoch_z() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

/// Unix-epoch milliseconds. Record timestamps use this resolution.
pub fn now_epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Record ids are ULIDs: opaque, unique, and roughly creation-ordered.
pub fn new_record_id() -> String {
    Ulid::new().to_string()
}

/// JSON envelope wrapped around every `--format json` CLI response. Keys of
/// `payload` are merged in at the top level.
pub fn command_envelope(cmd: &str, status: &str, payload: JsonValue) -> JsonValue {
    let mut envelope = Map::new();
    envelope.insert("envelope_version".into(), JsonValue::from("1.0.0"));
    envelope.insert("engine".into(), JsonValue::from(env!("CARGO_PKG_NAME")));
    envelope.insert("ts".into(), JsonValue::from(now_epoch_z()));
    envelope.insert("event_id".into(), JsonValue::from(new_event_id()));
    envelope.insert("cmd".into(), JsonValue::from(cmd));
    envelope.insert("status".into(), JsonValue::from(status));
    if let JsonValue::Object(extra) = payload {
        envelope.extend(extra);
    }
    JsonValue::Object(envelope)
}

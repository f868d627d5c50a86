use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const SPEC_VERSION: &str = "1.0";

/// Stamp an outbound envelope: fresh id, fresh UTC time, and the produced
/// data under `data` or `data_base64`.
pub fn finalize(envelope: &mut Map<String, Value>, data: Value, is_base64: bool) {
    let data_label = if is_base64 { "data_base64" } else { "data" };

    envelope.insert(
        "time".to_owned(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
    );
    envelope.insert(
        "id".to_owned(),
        Value::String(Uuid::new_v4().to_string()),
    );
    envelope.insert(data_label.to_owned(), data);
}

/// `specversion` must be present and `"1.0"` for any payload claiming to be a
/// CloudEvent.
pub fn check_spec_version(payload: &Value) -> bool {
    matches!(
        payload.get("specversion").and_then(Value::as_str),
        Some(SPEC_VERSION)
    )
}

/*!
 * Shared primitive types and value helpers.
 *
 * Payloads crossing the device boundary (command parameters, state bags,
 * metadata) are plain JSON values so they can be carried in envelopes
 * unchanged.
 */
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use uuid::Uuid;

pub use serde_json::Value;

/// A JSON object used for parameters, attributes and metadata
pub type Params = serde_json::Map<String, Value>;

/// Identifier of a registered device
pub type DeviceId = String;

/// Generate a fresh random identifier
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Interpret a JSON value as a number.
///
/// Numbers pass through, booleans become `1.0`/`0.0` and numeric strings
/// are parsed. Everything else yields `None`.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Interpret a JSON value as a boolean switch (`true`, `"on"`, non-zero)
pub fn as_switch(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "on" | "true" | "1" | "yes" => Some(true),
            "off" | "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Render a value the way a human would type it (strings unquoted)
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truncate a timestamp to the start of its minute
pub fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::minutes(1)).unwrap_or(ts)
}

/// Build a [`Params`] map from key/value pairs
#[macro_export]
macro_rules! params {
    () => { $crate::types::Params::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::types::Params::new();
        $( map.insert($key.to_string(), $crate::deps::serde_json::json!($value)); )+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_as_number() {
        assert_eq!(as_number(&json!(42)), Some(42.0));
        assert_eq!(as_number(&json!(2.5)), Some(2.5));
        assert_eq!(as_number(&json!(true)), Some(1.0));
        assert_eq!(as_number(&json!(" 17.25 ")), Some(17.25));
        assert_eq!(as_number(&json!("warm")), None);
        assert_eq!(as_number(&json!(null)), None);
        assert_eq!(as_number(&json!([1, 2])), None);
    }

    #[test]
    fn test_as_switch() {
        assert_eq!(as_switch(&json!(true)), Some(true));
        assert_eq!(as_switch(&json!("OFF")), Some(false));
        assert_eq!(as_switch(&json!(0)), Some(false));
        assert_eq!(as_switch(&json!(3)), Some(true));
        assert_eq!(as_switch(&json!("maybe")), None);
    }

    #[test]
    fn test_truncate_to_minute() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 34, 56).unwrap();
        let truncated = truncate_to_minute(ts);
        assert_eq!(truncated, Utc.with_ymd_and_hms(2024, 3, 1, 12, 34, 0).unwrap());
    }

    #[test]
    fn test_params_macro() {
        let p = params! { "level" => 80, "color" => "red" };
        assert_eq!(p.get("level"), Some(&json!(80)));
        assert_eq!(p.get("color"), Some(&json!("red")));
        assert!(params!().is_empty());
    }

    #[test]
    fn test_new_id_is_unique() {
        assert_ne!(new_id(), new_id());
    }
}

//! # normalize
//!
//! Inbound telemetry validation.
//!
//! MQTT payloads and HTTP poll bodies arrive as arbitrary JSON. This module is
//! the only way to obtain a `TelemetryFrame`: either all four numeric leaves
//! are present and finite, or the whole payload is rejected. A half-filled
//! frame would render stale values next to fresh ones.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::{DrivetrainReading, TagReading, TelemetryFrame};

/// Validate and coerce an untyped payload. Returns `None` for anything that
/// is not a complete, finite telemetry message.
pub fn normalize_telemetry(input: &Value) -> Option<TelemetryFrame> {
    let obj = input.as_object()?;

    let tag = obj.get("tag")?;
    let drivetrain = obj.get("drivetrain")?;

    let distance_mm = numeric_leaf(tag, "distance_mm")?;
    let angle_deg = numeric_leaf(tag, "angle_deg")?;
    let front_left = numeric_leaf(drivetrain, "front_left_axis_mm_per_s")?;
    let front_right = numeric_leaf(drivetrain, "front_right_axis_mm_per_s")?;

    if distance_mm < 0.0 {
        return None;
    }

    Some(TelemetryFrame {
        timestamp: normalize_timestamp(obj.get("timestamp")),
        tag: TagReading { distance_mm, angle_deg },
        drivetrain: DrivetrainReading {
            front_left_axis_mm_per_s: front_left,
            front_right_axis_mm_per_s: front_right,
        },
    })
}

/// Number or numeric string → finite f64
fn numeric_leaf(parent: &Value, key: &str) -> Option<f64> {
    let v = match parent.get(key)? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

/// String → passthrough; epoch milliseconds → RFC 3339; anything else → now.
fn normalize_timestamp(raw: Option<&Value>) -> String {
    match raw {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|ms| ms.is_finite())
            .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms as i64))
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(now_iso),
        _ => now_iso(),
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "timestamp": "2024-05-01T12:00:00.000Z",
            "tag": { "distance_mm": 2000.5, "angle_deg": -12.25 },
            "drivetrain": { "front_left_axis_mm_per_s": 200, "front_right_axis_mm_per_s": 180.5 }
        })
    }

    #[test]
    fn well_formed_payload_keeps_every_leaf() {
        let frame = normalize_telemetry(&sample()).expect("valid frame");
        assert_eq!(frame.timestamp, "2024-05-01T12:00:00.000Z");
        assert_eq!(frame.tag.distance_mm, 2000.5);
        assert_eq!(frame.tag.angle_deg, -12.25);
        assert_eq!(frame.drivetrain.front_left_axis_mm_per_s, 200.0);
        assert_eq!(frame.drivetrain.front_right_axis_mm_per_s, 180.5);
    }

    #[test]
    fn missing_any_leaf_rejects_whole_frame() {
        for (section, key) in [
            ("tag", "distance_mm"),
            ("tag", "angle_deg"),
            ("drivetrain", "front_left_axis_mm_per_s"),
            ("drivetrain", "front_right_axis_mm_per_s"),
        ] {
            let mut payload = sample();
            payload[section].as_object_mut().unwrap().remove(key);
            assert!(normalize_telemetry(&payload).is_none(), "accepted without {section}.{key}");
        }
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let payload = json!({
            "tag": { "distance_mm": " 1500 ", "angle_deg": "45.5" },
            "drivetrain": { "front_left_axis_mm_per_s": "0", "front_right_axis_mm_per_s": -10 }
        });
        let frame = normalize_telemetry(&payload).unwrap();
        assert_eq!(frame.tag.distance_mm, 1500.0);
        assert_eq!(frame.tag.angle_deg, 45.5);
        assert_eq!(frame.drivetrain.front_right_axis_mm_per_s, -10.0);
    }

    #[test]
    fn garbage_values_are_rejected() {
        let mut payload = sample();
        payload["tag"]["angle_deg"] = json!("north");
        assert!(normalize_telemetry(&payload).is_none());

        let mut payload = sample();
        payload["drivetrain"]["front_left_axis_mm_per_s"] = json!("inf");
        assert!(normalize_telemetry(&payload).is_none());

        let mut payload = sample();
        payload["tag"]["distance_mm"] = json!(-1.0);
        assert!(normalize_telemetry(&payload).is_none());

        assert!(normalize_telemetry(&json!(null)).is_none());
        assert!(normalize_telemetry(&json!([1, 2, 3])).is_none());
        assert!(normalize_telemetry(&json!({ "tag": 5, "drivetrain": {} })).is_none());
    }

    #[test]
    fn epoch_millis_become_iso() {
        let mut payload = sample();
        payload["timestamp"] = json!(1_700_000_000_000_i64);
        let frame = normalize_telemetry(&payload).unwrap();
        assert_eq!(frame.timestamp, "2023-11-14T22:13:20.000Z");
    }

    #[test]
    fn missing_timestamp_defaults_to_now() {
        let mut payload = sample();
        payload.as_object_mut().unwrap().remove("timestamp");
        let frame = normalize_telemetry(&payload).unwrap();
        let parsed = DateTime::parse_from_rfc3339(&frame.timestamp).unwrap();
        let age = Utc::now().signed_duration_since(parsed.with_timezone(&Utc));
        assert!(age.num_seconds().abs() < 5);
    }
}

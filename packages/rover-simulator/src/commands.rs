//! # commands
//!
//! Control-channel message validation.
//!
//! Control messages are untrusted JSON of the form `{ "type": "<kind>", ... }`.
//! Each kind has its own validator; a message either becomes a typed
//! `SimCommand` or is rejected whole with a `CommandError`.

use std::time::Duration;

use rover_link::RetryPolicy;
use rover_types::{AnchorId, PointMM};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum SimCommand {
    /// Only the anchors present and valid in the message
    SetAnchors(Vec<(AnchorId, PointMM)>),
    SetTag(PointMM),
    SetAutoSend { enabled: Option<bool>, interval_ms: Option<f64> },
    /// Already clamped to ≥ 0; noise is enabled iff sigma > 0
    SetNoise { sigma_mm: f64 },
    SendOnce,
    ResetAnchors,
    ResetTag,
    SetSnapToGrid(bool),
    SetHttpSettings(HttpSettings),
    SetMqttSettings(MqttSettings),
}

/// Partial HTTP sink settings; absent fields keep their current value.
/// An empty `url` disables the HTTP leg.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpSettings {
    pub url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retry_count: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

impl HttpSettings {
    pub fn touches_retry(&self) -> bool {
        self.timeout_ms.is_some() || self.retry_count.is_some() || self.retry_delay_ms.is_some()
    }

    pub fn merge_into(&self, current: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            timeout: self.timeout_ms.map_or(current.timeout, Duration::from_millis),
            retry_count: self.retry_count.unwrap_or(current.retry_count),
            retry_delay: self.retry_delay_ms.map_or(current.retry_delay, Duration::from_millis),
        }
    }
}

/// Partial MQTT settings. An empty `broker_url` disables the MQTT leg.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MqttSettings {
    pub broker_url: Option<String>,
    pub topic_prefix: Option<String>,
    pub retain: Option<bool>,
}

impl MqttSettings {
    /// Broker or retain flag changed, so the publisher must be rebuilt
    pub fn needs_reconnect(&self) -> bool {
        self.broker_url.is_some() || self.retain.is_some()
    }
}

impl SimCommand {
    /// Commands that edit the scene (anchors, tag, noise)
    pub fn mutates_scene(&self) -> bool {
        matches!(
            self,
            SimCommand::SetAnchors(_)
                | SimCommand::SetTag(_)
                | SimCommand::SetNoise { .. }
                | SimCommand::ResetAnchors
                | SimCommand::ResetTag
        )
    }

    /// Commands that change snapping or transport settings
    pub fn edits_settings(&self) -> bool {
        matches!(
            self,
            SimCommand::SetSnapToGrid(_) | SimCommand::SetHttpSettings(_) | SimCommand::SetMqttSettings(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("control message must be a JSON object")]
    NotAnObject,
    #[error("control message has no type")]
    MissingType,
    #[error("unknown control message type: {0}")]
    UnknownType(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: &'static str },
    #[error("simulator is read-only")]
    ReadOnly,
}

fn invalid(field: &'static str, reason: &'static str) -> CommandError {
    CommandError::Invalid { field, reason }
}

pub fn parse_command(raw: &Value) -> Result<SimCommand, CommandError> {
    let obj = raw.as_object().ok_or(CommandError::NotAnObject)?;
    let kind = obj.get("type").and_then(Value::as_str).ok_or(CommandError::MissingType)?;
    match kind {
        "setAnchors" => parse_set_anchors(obj),
        "setTag" => parse_set_tag(obj),
        "setAutoSend" => parse_set_auto_send(obj),
        "setNoise" => parse_set_noise(obj),
        "sendOnce" => Ok(SimCommand::SendOnce),
        "resetAnchors" => Ok(SimCommand::ResetAnchors),
        "resetTag" => Ok(SimCommand::ResetTag),
        "setSnapToGrid" => parse_set_snap_to_grid(obj),
        "setHttpSettings" => parse_set_http_settings(obj),
        "setMqttSettings" => parse_set_mqtt_settings(obj),
        other => Err(CommandError::UnknownType(other.to_string())),
    }
}

/// `{x, y}` with both finite JSON numbers
fn point(value: &Value) -> Option<PointMM> {
    let x = value.get("x")?.as_f64()?;
    let y = value.get("y")?.as_f64()?;
    let p = PointMM::new(x, y);
    p.is_finite().then_some(p)
}

/// Number, or a string that parses as one
fn loose_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_set_anchors(obj: &Map<String, Value>) -> Result<SimCommand, CommandError> {
    let anchors = obj
        .get("anchors")
        .and_then(Value::as_object)
        .ok_or(invalid("anchors", "expected an object keyed by anchor id"))?;
    let updates: Vec<(AnchorId, PointMM)> = AnchorId::ALL
        .iter()
        .filter_map(|id| Some((*id, point(anchors.get(id.as_str())?)?)))
        .collect();
    if updates.is_empty() {
        return Err(invalid("anchors", "no valid anchor positions"));
    }
    Ok(SimCommand::SetAnchors(updates))
}

fn parse_set_tag(obj: &Map<String, Value>) -> Result<SimCommand, CommandError> {
    obj.get("tag")
        .and_then(point)
        .map(SimCommand::SetTag)
        .ok_or(invalid("tag", "expected finite {x, y}"))
}

fn parse_set_auto_send(obj: &Map<String, Value>) -> Result<SimCommand, CommandError> {
    let body = obj
        .get("autoSend")
        .and_then(Value::as_object)
        .ok_or(invalid("autoSend", "expected an object"))?;
    let enabled = body.get("enabled").and_then(Value::as_bool);
    let interval_ms = body
        .get("interval_ms")
        .and_then(loose_number)
        .filter(|ms| ms.is_finite() && *ms > 0.0);
    if enabled.is_none() && interval_ms.is_none() {
        return Err(invalid("autoSend", "needs a boolean enabled or a positive interval_ms"));
    }
    Ok(SimCommand::SetAutoSend { enabled, interval_ms })
}

fn parse_set_noise(obj: &Map<String, Value>) -> Result<SimCommand, CommandError> {
    let sigma = obj
        .get("noise")
        .and_then(|n| n.get("sigma_mm"))
        .and_then(loose_number)
        .filter(|s| s.is_finite())
        .ok_or(invalid("noise", "expected finite sigma_mm"))?;
    Ok(SimCommand::SetNoise { sigma_mm: sigma.max(0.0) })
}

fn parse_set_snap_to_grid(obj: &Map<String, Value>) -> Result<SimCommand, CommandError> {
    obj.get("snapToGrid")
        .and_then(Value::as_bool)
        .map(SimCommand::SetSnapToGrid)
        .ok_or(invalid("snapToGrid", "expected a boolean"))
}

/// Absent or null → `Ok(None)`; present but not a string → error
fn optional_string(body: &Map<String, Value>, field: &'static str) -> Result<Option<String>, CommandError> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(invalid(field, "expected a string")),
    }
}

/// Whole non-negative milliseconds or counts, loosely typed
fn optional_count(body: &Map<String, Value>, field: &'static str) -> Result<Option<u64>, CommandError> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => loose_number(v)
            .filter(|n| n.is_finite() && *n >= 0.0 && n.fract() == 0.0 && *n <= u32::MAX as f64)
            .map(|n| Some(n as u64))
            .ok_or(invalid(field, "expected a non-negative integer")),
    }
}

fn parse_set_http_settings(obj: &Map<String, Value>) -> Result<SimCommand, CommandError> {
    let body = obj
        .get("http")
        .and_then(Value::as_object)
        .ok_or(invalid("http", "expected an object"))?;
    let timeout_ms = optional_count(body, "timeout_ms")?;
    if timeout_ms == Some(0) {
        return Err(invalid("timeout_ms", "must be positive"));
    }
    let settings = HttpSettings {
        url: optional_string(body, "url")?,
        timeout_ms,
        // Bounded by `optional_count`.
        retry_count: optional_count(body, "retry_count")?.map(|n| n as u32),
        retry_delay_ms: optional_count(body, "retry_delay_ms")?,
    };
    if settings == HttpSettings::default() {
        return Err(invalid("http", "no settings to apply"));
    }
    Ok(SimCommand::SetHttpSettings(settings))
}

fn parse_set_mqtt_settings(obj: &Map<String, Value>) -> Result<SimCommand, CommandError> {
    let body = obj
        .get("mqtt")
        .and_then(Value::as_object)
        .ok_or(invalid("mqtt", "expected an object"))?;
    let topic_prefix = optional_string(body, "topic_prefix")?;
    if topic_prefix.as_deref() == Some("") {
        return Err(invalid("topic_prefix", "must not be empty"));
    }
    let retain = match body.get("retain") {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => return Err(invalid("retain", "expected a boolean")),
    };
    let settings = MqttSettings { broker_url: optional_string(body, "broker_url")?, topic_prefix, retain };
    if settings == MqttSettings::default() {
        return Err(invalid("mqtt", "no settings to apply"));
    }
    Ok(SimCommand::SetMqttSettings(settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_non_objects_and_unknown_kinds() {
        assert_eq!(parse_command(&json!("setTag")), Err(CommandError::NotAnObject));
        assert_eq!(parse_command(&json!({ "tag": { "x": 1, "y": 2 } })), Err(CommandError::MissingType));
        assert_eq!(
            parse_command(&json!({ "type": "explode" })),
            Err(CommandError::UnknownType("explode".into()))
        );
    }

    #[test]
    fn set_anchors_keeps_only_valid_entries() {
        let cmd = parse_command(&json!({
            "type": "setAnchors",
            "anchors": { "A": { "x": 100, "y": 200 }, "B": { "x": "1", "y": 2 }, "D": { "x": 0, "y": 0 } }
        }))
        .unwrap();
        assert_eq!(cmd, SimCommand::SetAnchors(vec![(AnchorId::A, PointMM::new(100.0, 200.0))]));

        let err = parse_command(&json!({ "type": "setAnchors", "anchors": { "C": { "x": null, "y": 1 } } }));
        assert!(matches!(err, Err(CommandError::Invalid { field: "anchors", .. })));
    }

    #[test]
    fn set_tag_requires_finite_numbers() {
        assert_eq!(
            parse_command(&json!({ "type": "setTag", "tag": { "x": -250.5, "y": 30 } })).unwrap(),
            SimCommand::SetTag(PointMM::new(-250.5, 30.0))
        );
        assert!(parse_command(&json!({ "type": "setTag", "tag": { "x": 1 } })).is_err());
        assert!(parse_command(&json!({ "type": "setTag" })).is_err());
    }

    #[test]
    fn set_auto_send_accepts_either_field() {
        assert_eq!(
            parse_command(&json!({ "type": "setAutoSend", "autoSend": { "enabled": true } })).unwrap(),
            SimCommand::SetAutoSend { enabled: Some(true), interval_ms: None }
        );
        assert_eq!(
            parse_command(&json!({ "type": "setAutoSend", "autoSend": { "interval_ms": "250" } })).unwrap(),
            SimCommand::SetAutoSend { enabled: None, interval_ms: Some(250.0) }
        );
        // A bad interval alone leaves nothing to apply.
        assert!(parse_command(&json!({ "type": "setAutoSend", "autoSend": { "interval_ms": -5 } })).is_err());
        assert_eq!(
            parse_command(&json!({ "type": "setAutoSend", "autoSend": { "enabled": false, "interval_ms": 0 } })).unwrap(),
            SimCommand::SetAutoSend { enabled: Some(false), interval_ms: None }
        );
    }

    #[test]
    fn set_noise_clamps_negative_sigma() {
        assert_eq!(
            parse_command(&json!({ "type": "setNoise", "noise": { "sigma_mm": -4 } })).unwrap(),
            SimCommand::SetNoise { sigma_mm: 0.0 }
        );
        assert_eq!(
            parse_command(&json!({ "type": "setNoise", "noise": { "sigma_mm": "12.5" } })).unwrap(),
            SimCommand::SetNoise { sigma_mm: 12.5 }
        );
        assert!(parse_command(&json!({ "type": "setNoise", "noise": { "sigma_mm": "loud" } })).is_err());
    }

    #[test]
    fn scene_mutations_are_flagged() {
        assert!(SimCommand::ResetTag.mutates_scene());
        assert!(!SimCommand::SendOnce.mutates_scene());
        assert!(!SimCommand::SetAutoSend { enabled: Some(true), interval_ms: None }.mutates_scene());
    }

    #[test]
    fn snap_to_grid_needs_a_boolean() {
        assert_eq!(
            parse_command(&json!({ "type": "setSnapToGrid", "snapToGrid": true })).unwrap(),
            SimCommand::SetSnapToGrid(true)
        );
        assert!(parse_command(&json!({ "type": "setSnapToGrid", "snapToGrid": "yes" })).is_err());
    }

    #[test]
    fn http_settings_are_partial_and_strict() {
        let cmd = parse_command(&json!({
            "type": "setHttpSettings",
            "http": { "url": " http://nr:1880/uwb/sim ", "retry_count": "3" }
        }))
        .unwrap();
        let SimCommand::SetHttpSettings(settings) = cmd else { panic!("unexpected command") };
        assert_eq!(settings.url.as_deref(), Some("http://nr:1880/uwb/sim"));
        assert_eq!(settings.retry_count, Some(3));
        assert!(settings.timeout_ms.is_none());

        let current = RetryPolicy::default();
        let merged = settings.merge_into(current);
        assert_eq!(merged.retry_count, 3);
        assert_eq!(merged.timeout, current.timeout);

        // An empty url is a valid way to switch the leg off.
        assert!(parse_command(&json!({ "type": "setHttpSettings", "http": { "url": "" } })).is_ok());

        for http in [
            json!({}),
            json!({ "timeout_ms": 0 }),
            json!({ "retry_count": -1 }),
            json!({ "retry_delay_ms": 2.5 }),
            json!({ "url": 5 }),
        ] {
            assert!(parse_command(&json!({ "type": "setHttpSettings", "http": http })).is_err(), "{http}");
        }
    }

    #[test]
    fn mqtt_settings_validation() {
        let cmd = parse_command(&json!({
            "type": "setMqttSettings",
            "mqtt": { "topic_prefix": "uwb/lab", "retain": true }
        }))
        .unwrap();
        let SimCommand::SetMqttSettings(settings) = cmd else { panic!("unexpected command") };
        assert_eq!(settings.topic_prefix.as_deref(), Some("uwb/lab"));
        assert!(settings.needs_reconnect());

        let prefix_only = MqttSettings { topic_prefix: Some("uwb".into()), ..Default::default() };
        assert!(!prefix_only.needs_reconnect());

        for mqtt in [json!({}), json!({ "topic_prefix": "  " }), json!({ "retain": "no" })] {
            assert!(parse_command(&json!({ "type": "setMqttSettings", "mqtt": mqtt })).is_err(), "{mqtt}");
        }
    }

    #[test]
    fn settings_commands_are_flagged() {
        assert!(SimCommand::SetSnapToGrid(false).edits_settings());
        assert!(!SimCommand::SetSnapToGrid(false).mutates_scene());
        assert!(!SimCommand::SendOnce.edits_settings());
    }
}

//! # control
//!
//! Validation of partial control updates.
//!
//! A POST body becomes a `ControlUpdate` or is rejected whole; the current
//! `ControlState` is never touched by an invalid body.

use rover_types::{ControlState, Stick};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("Body must be valid JSON")]
    InvalidJson,
    #[error("Body must be a JSON object")]
    NotAnObject,
    #[error("mode must be a non-empty string")]
    InvalidMode,
    #[error("stick must be an object with finite numeric x and y")]
    InvalidStick,
    #[error("Body must contain mode or stick")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ControlUpdate {
    pub mode: Option<String>,
    pub stick: Option<Stick>,
}

impl ControlUpdate {
    pub fn from_bytes(body: &[u8]) -> Result<Self, ControlError> {
        let value: Value = serde_json::from_slice(body).map_err(|_| ControlError::InvalidJson)?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Self, ControlError> {
        let obj = value.as_object().ok_or(ControlError::NotAnObject)?;

        let mode = match obj.get("mode") {
            None => None,
            Some(Value::String(m)) if !m.trim().is_empty() => Some(m.trim().to_string()),
            Some(_) => return Err(ControlError::InvalidMode),
        };

        let stick = match obj.get("stick") {
            None => None,
            Some(s) => {
                let x = s.get("x").and_then(Value::as_f64).filter(|v| v.is_finite());
                let y = s.get("y").and_then(Value::as_f64).filter(|v| v.is_finite());
                match (x, y) {
                    (Some(x), Some(y)) => Some(Stick { x, y }),
                    _ => return Err(ControlError::InvalidStick),
                }
            }
        };

        if mode.is_none() && stick.is_none() {
            return Err(ControlError::Empty);
        }
        Ok(Self { mode, stick })
    }

    /// Merge into `state`, stamping time and source
    pub fn apply(self, state: &mut ControlState, source: &str) {
        if let Some(mode) = self.mode {
            state.mode = mode;
        }
        if let Some(stick) = self.stick {
            state.stick = stick;
        }
        state.ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        state.source = source.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validation_table() {
        let cases: Vec<(&str, Result<ControlUpdate, ControlError>)> = vec![
            ("not json", Err(ControlError::InvalidJson)),
            ("[1, 2]", Err(ControlError::NotAnObject)),
            ("{}", Err(ControlError::Empty)),
            (r#"{"mode": ""}"#, Err(ControlError::InvalidMode)),
            (r#"{"mode": 3}"#, Err(ControlError::InvalidMode)),
            (r#"{"stick": {"x": 1}}"#, Err(ControlError::InvalidStick)),
            (r#"{"stick": {"x": "1", "y": 0}}"#, Err(ControlError::InvalidStick)),
            (r#"{"mode": "auto"}"#, Ok(ControlUpdate { mode: Some("auto".into()), stick: None })),
            (
                r#"{"stick": {"x": -0.5, "y": 1}}"#,
                Ok(ControlUpdate { mode: None, stick: Some(Stick { x: -0.5, y: 1.0 }) }),
            ),
        ];
        for (body, expected) in cases {
            assert_eq!(ControlUpdate::from_bytes(body.as_bytes()), expected, "{body}");
        }
    }

    #[test]
    fn invalid_stick_rejects_the_whole_update() {
        let err = ControlUpdate::from_json(&json!({ "mode": "auto", "stick": null }));
        assert_eq!(err, Err(ControlError::InvalidStick));
    }

    #[test]
    fn apply_merges_only_present_fields() {
        let mut state = ControlState::default();
        ControlUpdate { mode: None, stick: Some(Stick { x: 0.25, y: -1.0 }) }.apply(&mut state, "api");
        assert_eq!(state.mode, "manual");
        assert_eq!(state.stick, Stick { x: 0.25, y: -1.0 });
        assert_eq!(state.source, "api");

        ControlUpdate { mode: Some("auto".into()), stick: None }.apply(&mut state, "api");
        assert_eq!(state.mode, "auto");
        assert_eq!(state.stick, Stick { x: 0.25, y: -1.0 });
    }
}

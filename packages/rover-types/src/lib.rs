//! # rover-types
//!
//! Shared telemetry structures for the Rover UWB suite.
//!
//! These types are used by:
//! - `rover-simulator`: building outbound `SimulationFrame`s from tag/anchor state
//! - `rover-link`: decoding inbound telemetry into `TelemetryFrame`s
//! - `backend-rust`: relaying control state to the Node-RED flow
//!
//! ## Coordinate Conventions
//!
//! - **Plane frame**: millimetres, X to the right, Y up, origin at the rover centre
//! - **Angles**: degrees, 0° = +X, counter-clockwise positive
//!
//! ## Invariants
//! - An `AnchorRecord` always holds exactly the anchors A, B and C
//! - A `DistanceRecord` is derived from tag + anchors and never edited directly
//! - A `TelemetryFrame` is either fully valid (four finite leaves) or absent

pub mod geometry;
pub mod normalize;

use serde::{Deserialize, Serialize};

pub use geometry::{compute_distances, distance_mm, snap_to_grid, to_simulation_frame};
pub use normalize::normalize_telemetry;

// ── Plane Point ───────────────────────────────────────────────────────────────

/// 2D point in millimetres
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PointMM {
    pub x: f64,
    pub y: f64,
}

impl PointMM {
    pub const ORIGIN: PointMM = PointMM { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

// ── Anchors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnchorId {
    A,
    B,
    C,
}

impl AnchorId {
    pub const ALL: [AnchorId; 3] = [AnchorId::A, AnchorId::B, AnchorId::C];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorId::A => "A",
            AnchorId::B => "B",
            AnchorId::C => "C",
        }
    }
}

impl std::fmt::Display for AnchorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fixed UWB anchor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorState {
    pub id: AnchorId,
    pub position: PointMM,
    /// Display colour (CSS hex) for the rendering layer
    pub color: String,
}

/// The three anchors, keyed by id. Fixed fields make a missing anchor unrepresentable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorRecord {
    #[serde(rename = "A")]
    pub a: AnchorState,
    #[serde(rename = "B")]
    pub b: AnchorState,
    #[serde(rename = "C")]
    pub c: AnchorState,
}

impl AnchorRecord {
    pub fn get_mut(&mut self, id: AnchorId) -> &mut AnchorState {
        match id {
            AnchorId::A => &mut self.a,
            AnchorId::B => &mut self.b,
            AnchorId::C => &mut self.c,
        }
    }
}

impl Default for AnchorRecord {
    fn default() -> Self {
        Self {
            a: AnchorState { id: AnchorId::A, position: PointMM::new(600.0, 400.0), color: "#ef4444".into() },
            b: AnchorState { id: AnchorId::B, position: PointMM::new(600.0, -400.0), color: "#22c55e".into() },
            c: AnchorState { id: AnchorId::C, position: PointMM::new(-600.0, 0.0), color: "#3b82f6".into() },
        }
    }
}

// ── Distances ─────────────────────────────────────────────────────────────────

/// Tag-to-anchor distances in millimetres, one per anchor
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DistanceRecord {
    #[serde(rename = "A")]
    pub a: f64,
    #[serde(rename = "B")]
    pub b: f64,
    #[serde(rename = "C")]
    pub c: f64,
}

impl DistanceRecord {
    /// Apply `f` to each distance, preserving anchor order A, B, C
    pub fn map(&self, mut f: impl FnMut(f64) -> f64) -> Self {
        let a = f(self.a);
        let b = f(self.b);
        let c = f(self.c);
        Self { a, b, c }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NoiseSettings {
    /// Standard deviation of the ranging noise, millimetres
    pub sigma: f64,
    pub enabled: bool,
}

// ── Inbound Telemetry (canonical) ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TagReading {
    /// Range from rover to tag, ≥ 0
    pub distance_mm: f64,
    pub angle_deg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrivetrainReading {
    pub front_left_axis_mm_per_s: f64,
    pub front_right_axis_mm_per_s: f64,
}

/// Normalized rover telemetry. Only produced by [`normalize_telemetry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// ISO-8601 timestamp
    pub timestamp: String,
    pub tag: TagReading,
    pub drivetrain: DrivetrainReading,
}

// ── Outbound Simulation Frame ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanePosition {
    pub x_mm: f64,
    pub y_mm: f64,
}

impl From<PointMM> for PlanePosition {
    fn from(p: PointMM) -> Self {
        Self { x_mm: p.x, y_mm: p.y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorPositions {
    #[serde(rename = "A")]
    pub a: PlanePosition,
    #[serde(rename = "B")]
    pub b: PlanePosition,
    #[serde(rename = "C")]
    pub c: PlanePosition,
}

/// One simulated measurement snapshot, as POSTed to Node-RED and published over MQTT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationFrame {
    pub timestamp: String,
    pub tag: PlanePosition,
    pub anchors: AnchorPositions,
    /// Rounded to 0.1 mm
    pub distances_mm: DistanceRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distances_simulated_mm: Option<DistanceRecord>,
}

// ── Connection Status ─────────────────────────────────────────────────────────

/// Lifecycle of the inbound MQTT telemetry subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Never connected and gave up. Consumers should stop expecting data.
    Failed,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkStatus::Disconnected => "disconnected",
            LinkStatus::Connecting => "connecting",
            LinkStatus::Connected => "connected",
            LinkStatus::Reconnecting => "reconnecting",
            LinkStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpSendState {
    #[default]
    Idle,
    Sending,
    Success,
    Error,
}

/// Outbound MQTT publisher state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LegStatus<S> {
    pub state: S,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<S> LegStatus<S> {
    pub fn new(state: S) -> Self {
        Self { state, message: None }
    }

    pub fn with_message(state: S, message: impl Into<String>) -> Self {
        Self { state, message: Some(message.into()) }
    }
}

/// Per-transport status of the outbound send path
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SendStatus {
    pub http: LegStatus<HttpSendState>,
    pub mqtt: LegStatus<PublishState>,
}

// ── Control Relay ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Stick {
    pub x: f64,
    pub y: f64,
}

/// Operator control state held by the backend and pushed to Node-RED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlState {
    pub mode: String,
    pub stick: Stick,
    /// ISO-8601 time of the last accepted update
    pub ts: String,
    /// Who made the last update (e.g. "api", "init")
    pub source: String,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            mode: "manual".into(),
            stick: Stick::default(),
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            source: "init".into(),
        }
    }
}

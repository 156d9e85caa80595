//! # sim_state
//!
//! The simulator's single source of truth.
//!
//! ## Invariants
//! - `distances` always equals `compute_distances(tag, anchors)`
//! - `simulated` is re-derived whenever distances or noise change, and is
//!   `None` exactly when noise is off
//! - `auto_send_interval_ms >= MIN_AUTO_SEND_INTERVAL_MS`
//! - In read-only mode neither the scene (anchors, tag, noise) nor the
//!   snapping and transport settings can change

use rover_types::{
    compute_distances, geometry::GRID_MINOR_STEP_MM, snap_to_grid, to_simulation_frame, AnchorId, AnchorRecord,
    DistanceRecord, NoiseSettings, PointMM, SimulationFrame,
};
use serde::Serialize;

use crate::commands::{CommandError, SimCommand};
use crate::noise::{apply_noise, RandomSource};

pub const MIN_AUTO_SEND_INTERVAL_MS: u64 = 50;

/// What the caller must do after a command was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    SceneChanged,
    AutoSendChanged,
    SendNow,
    /// HTTP or MQTT settings for the sender to pick up
    TransportChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OrbitSettings {
    pub enabled: bool,
    pub radius_mm: f64,
    pub period_s: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimState {
    pub anchors: AnchorRecord,
    pub tag: PointMM,
    pub distances: DistanceRecord,
    pub simulated: Option<DistanceRecord>,
    pub noise: NoiseSettings,
    pub snap_to_grid: bool,
    pub auto_send_enabled: bool,
    pub auto_send_interval_ms: u64,
    pub read_only: bool,
    pub orbit: OrbitSettings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSendSnapshot {
    pub enabled: bool,
    pub interval_ms: u64,
}

/// Broadcast to control-channel clients after every change
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub frame: SimulationFrame,
    pub auto_send: AutoSendSnapshot,
    pub noise: NoiseSettings,
    pub snap_to_grid: bool,
    pub read_only: bool,
    pub orbit: OrbitSettings,
}

impl Default for SimState {
    fn default() -> Self {
        let anchors = AnchorRecord::default();
        let tag = PointMM::ORIGIN;
        Self {
            distances: compute_distances(tag, &anchors),
            anchors,
            tag,
            simulated: None,
            noise: NoiseSettings { sigma: 0.0, enabled: false },
            snap_to_grid: false,
            auto_send_enabled: false,
            auto_send_interval_ms: 500,
            read_only: false,
            orbit: OrbitSettings { enabled: false, radius_mm: 400.0, period_s: 20.0 },
        }
    }
}

impl SimState {
    fn recompute(&mut self, rng: &mut impl RandomSource) {
        self.distances = compute_distances(self.tag, &self.anchors);
        self.simulated = apply_noise(&self.distances, &self.noise, rng);
    }

    pub fn set_anchor(&mut self, id: AnchorId, position: PointMM, rng: &mut impl RandomSource) {
        self.anchors.get_mut(id).position = position;
        self.recompute(rng);
    }

    /// Snaps to the minor grid when snapping is on
    pub fn set_tag(&mut self, position: PointMM, rng: &mut impl RandomSource) {
        self.tag = if self.snap_to_grid { snap_to_grid(position, GRID_MINOR_STEP_MM) } else { position };
        self.recompute(rng);
    }

    pub fn set_noise_sigma(&mut self, sigma_mm: f64, rng: &mut impl RandomSource) {
        let sigma = sigma_mm.max(0.0);
        self.noise = NoiseSettings { sigma, enabled: sigma > 0.0 };
        self.simulated = apply_noise(&self.distances, &self.noise, rng);
    }

    pub fn set_auto_send_interval(&mut self, interval_ms: f64) {
        // Float → int `as` saturates; non-finite values never reach here.
        self.auto_send_interval_ms = (interval_ms.round() as u64).max(MIN_AUTO_SEND_INTERVAL_MS);
    }

    pub fn reset_anchors(&mut self, rng: &mut impl RandomSource) {
        self.anchors = AnchorRecord::default();
        self.recompute(rng);
    }

    pub fn reset_tag(&mut self, rng: &mut impl RandomSource) {
        self.tag = PointMM::ORIGIN;
        self.recompute(rng);
    }

    /// Place the tag on its scripted circle around the origin
    pub fn advance_orbit(&mut self, elapsed_s: f64, rng: &mut impl RandomSource) -> bool {
        if !self.orbit.enabled || self.orbit.period_s <= 0.0 {
            return false;
        }
        let phase = std::f64::consts::TAU * (elapsed_s / self.orbit.period_s);
        let (sin, cos) = phase.sin_cos();
        let position = PointMM::new(self.orbit.radius_mm * cos, self.orbit.radius_mm * sin);
        self.set_tag(position, rng);
        true
    }

    pub fn apply(&mut self, command: &SimCommand, rng: &mut impl RandomSource) -> Result<Effect, CommandError> {
        if self.read_only && (command.mutates_scene() || command.edits_settings()) {
            return Err(CommandError::ReadOnly);
        }
        let effect = match command {
            SimCommand::SetAnchors(updates) => {
                for (id, position) in updates {
                    self.set_anchor(*id, *position, rng);
                }
                Effect::SceneChanged
            }
            SimCommand::SetTag(position) => {
                self.set_tag(*position, rng);
                Effect::SceneChanged
            }
            SimCommand::SetNoise { sigma_mm } => {
                self.set_noise_sigma(*sigma_mm, rng);
                Effect::SceneChanged
            }
            SimCommand::SetAutoSend { enabled, interval_ms } => {
                if let Some(enabled) = enabled {
                    self.auto_send_enabled = *enabled;
                }
                if let Some(ms) = interval_ms {
                    self.set_auto_send_interval(*ms);
                }
                Effect::AutoSendChanged
            }
            SimCommand::ResetAnchors => {
                self.reset_anchors(rng);
                Effect::SceneChanged
            }
            SimCommand::ResetTag => {
                self.reset_tag(rng);
                Effect::SceneChanged
            }
            SimCommand::SetSnapToGrid(enabled) => {
                self.snap_to_grid = *enabled;
                Effect::SceneChanged
            }
            SimCommand::SendOnce => Effect::SendNow,
            SimCommand::SetHttpSettings(_) | SimCommand::SetMqttSettings(_) => Effect::TransportChanged,
        };
        Ok(effect)
    }

    pub fn frame(&self) -> SimulationFrame {
        to_simulation_frame(self.tag, &self.anchors, &self.distances, self.simulated.as_ref())
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            kind: "state",
            frame: self.frame(),
            auto_send: AutoSendSnapshot { enabled: self.auto_send_enabled, interval_ms: self.auto_send_interval_ms },
            noise: self.noise,
            snap_to_grid: self.snap_to_grid,
            read_only: self.read_only,
            orbit: self.orbit,
        }
    }
}

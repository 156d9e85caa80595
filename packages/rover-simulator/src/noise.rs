//! # noise
//!
//! Gaussian ranging noise.
//!
//! Box–Muller over an injectable uniform source so tests can pin every draw.
//! Each anchor gets its own draw; errors between anchors are uncorrelated.

use rand::Rng;
use rand_distr::Open01;
use rover_types::{DistanceRecord, NoiseSettings};

/// Uniform samples in the open interval (0, 1)
pub trait RandomSource {
    fn next_uniform(&mut self) -> f64;
}

impl<R: Rng + ?Sized> RandomSource for R {
    fn next_uniform(&mut self) -> f64 {
        self.sample(Open01)
    }
}

/// Adapts a closure into a `RandomSource`
pub struct FnSource<F>(pub F);

impl<F: FnMut() -> f64> RandomSource for FnSource<F> {
    fn next_uniform(&mut self) -> f64 {
        (self.0)()
    }
}

/// One N(0, sigma²) sample. `sigma == 0` returns 0 without drawing.
pub fn gaussian_noise(sigma: f64, rng: &mut impl RandomSource) -> f64 {
    if sigma == 0.0 {
        return 0.0;
    }
    let mut u1 = 0.0;
    while u1 == 0.0 {
        u1 = rng.next_uniform();
    }
    let u2 = rng.next_uniform();
    let magnitude = (-2.0 * u1.ln()).sqrt();
    magnitude * (std::f64::consts::TAU * u2).cos() * sigma
}

/// Simulated distances, or `None` when noise is off. `None` means "no
/// overlay", which is not the same as a zero perturbation.
pub fn apply_noise(
    distances: &DistanceRecord,
    settings: &NoiseSettings,
    rng: &mut impl RandomSource,
) -> Option<DistanceRecord> {
    if !settings.enabled || settings.sigma <= 0.0 {
        return None;
    }
    Some(distances.map(|d| d + gaussian_noise(settings.sigma, rng)))
}

pub fn should_auto_send(enabled: bool, interval_ms: f64) -> bool {
    enabled && interval_ms.is_finite() && interval_ms > 0.0
}

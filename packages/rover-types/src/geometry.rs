//! # geometry
//!
//! Plane geometry for the tag/anchor view.
//!
//! Pure functions only. Distances are always recomputed from positions;
//! nothing here caches across mutations.

use crate::{AnchorPositions, AnchorRecord, DistanceRecord, PointMM, SimulationFrame};

pub const GRID_MINOR_STEP_MM: f64 = 10.0;

// ── Distances ─────────────────────────────────────────────────────────────────

/// Euclidean distance between two points, millimetres
pub fn distance_mm(a: PointMM, b: PointMM) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    (dx * dx + dy * dy).sqrt()
}

pub fn compute_distances(tag: PointMM, anchors: &AnchorRecord) -> DistanceRecord {
    DistanceRecord {
        a: distance_mm(tag, anchors.a.position),
        b: distance_mm(tag, anchors.b.position),
        c: distance_mm(tag, anchors.c.position),
    }
}

// ── Grid / transforms ─────────────────────────────────────────────────────────

/// Round each axis to the nearest multiple of `step` (ties away from zero).
/// A non-positive or non-finite step leaves the point unchanged.
pub fn snap_to_grid(point: PointMM, step: f64) -> PointMM {
    if !(step.is_finite() && step > 0.0) {
        return point;
    }
    PointMM {
        x: (point.x / step).round() * step,
        y: (point.y / step).round() * step,
    }
}

pub fn rotate_point(point: PointMM, angle_rad: f64) -> PointMM {
    let (sin, cos) = angle_rad.sin_cos();
    PointMM {
        x: point.x * cos - point.y * sin,
        y: point.x * sin + point.y * cos,
    }
}

pub fn translate_point(point: PointMM, delta: PointMM) -> PointMM {
    PointMM { x: point.x + delta.x, y: point.y + delta.y }
}

pub fn points_equal(a: PointMM, b: PointMM, tolerance: f64) -> bool {
    (a.x - b.x).abs() < tolerance && (a.y - b.y).abs() < tolerance
}

/// Polar telemetry (range + bearing) to pixel offsets at `mm_per_px`.
/// 0° points along +x, angles grow counter-clockwise.
pub fn polar_to_cartesian(distance_mm: f64, angle_deg: f64, mm_per_px: f64) -> PointMM {
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    let radius_px = distance_mm / mm_per_px;
    PointMM { x: cos * radius_px, y: sin * radius_px }
}

pub fn clamp_scale(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

/// Wrap an angle into (-180, 180]
pub fn normalize_angle(angle_deg: f64) -> f64 {
    let mut normalized = angle_deg % 360.0;
    if normalized > 180.0 {
        normalized -= 360.0;
    } else if normalized <= -180.0 {
        normalized += 360.0;
    }
    normalized
}

// ── Labels ────────────────────────────────────────────────────────────────────

pub fn format_millimetres(value: f64, digits: usize) -> String {
    format!("{value:.digits$}")
}

/// Below one metre: whole millimetres. Otherwise metres with two decimals.
pub fn calculate_distance_label(distance_mm: f64) -> String {
    if !distance_mm.is_finite() {
        return "—".to_string();
    }
    if distance_mm >= 1000.0 {
        format!("{:.2} m", distance_mm / 1000.0)
    } else {
        format!("{distance_mm:.0} mm")
    }
}

pub fn calculate_angle_label(angle_deg: f64) -> String {
    if !angle_deg.is_finite() {
        return "—".to_string();
    }
    format!("{angle_deg:.1}°")
}

// ── Frames ────────────────────────────────────────────────────────────────────

fn round_tenth(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Snapshot the current tag/anchor state into an outbound frame stamped "now".
pub fn to_simulation_frame(
    tag: PointMM,
    anchors: &AnchorRecord,
    distances: &DistanceRecord,
    simulated: Option<&DistanceRecord>,
) -> SimulationFrame {
    SimulationFrame {
        timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        tag: tag.into(),
        anchors: AnchorPositions {
            a: anchors.a.position.into(),
            b: anchors.b.position.into(),
            c: anchors.c.position.into(),
        },
        distances_mm: distances.map(round_tenth),
        distances_simulated_mm: simulated.map(|d| d.map(round_tenth)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PlanePosition;

    #[test]
    fn distance_is_three_four_five() {
        let d = distance_mm(PointMM::new(0.0, 0.0), PointMM::new(300.0, 400.0));
        assert_eq!(d, 500.0);
        assert_eq!(distance_mm(PointMM::new(300.0, 400.0), PointMM::ORIGIN), d);
    }

    #[test]
    fn distances_follow_default_anchor_layout() {
        let anchors = AnchorRecord::default();
        let d = compute_distances(PointMM::new(600.0, 0.0), &anchors);
        assert!((d.a - 400.0).abs() < 1e-9);
        assert!((d.b - 400.0).abs() < 1e-9);
        assert!((d.c - 1200.0).abs() < 1e-9);
    }

    #[test]
    fn distances_recompute_after_anchor_move() {
        let mut anchors = AnchorRecord::default();
        let tag = PointMM::ORIGIN;
        let before = compute_distances(tag, &anchors);
        anchors.c.position = PointMM::new(-300.0, 0.0);
        let after = compute_distances(tag, &anchors);
        assert_eq!(before.a, after.a);
        assert!((after.c - 300.0).abs() < 1e-9);
    }

    #[test]
    fn snaps_to_nearest_grid_line() {
        let snapped = snap_to_grid(PointMM::new(23.0, -47.0), GRID_MINOR_STEP_MM);
        assert_eq!(snapped, PointMM::new(20.0, -50.0));
        assert_eq!(snap_to_grid(PointMM::new(15.0, -15.0), 10.0), PointMM::new(20.0, -20.0));
        assert_eq!(snap_to_grid(PointMM::new(3.0, 4.0), 0.0), PointMM::new(3.0, 4.0));
    }

    #[test]
    fn distance_label_switches_to_metres() {
        assert_eq!(calculate_distance_label(999.4), "999 mm");
        assert_eq!(calculate_distance_label(1000.0), "1.00 m");
        assert_eq!(calculate_distance_label(2346.0), "2.35 m");
        assert_eq!(calculate_distance_label(f64::NAN), "—");
        assert_eq!(calculate_angle_label(12.345), "12.3°");
        assert_eq!(format_millimetres(12.346, 2), "12.35");
    }

    #[test]
    fn polar_zero_degrees_is_positive_x() {
        let p = polar_to_cartesian(2000.0, 0.0, 2.0);
        assert!((p.x - 1000.0).abs() < 1e-9);
        assert!(p.y.abs() < 1e-9);

        let q = polar_to_cartesian(2000.0, 90.0, 2.0);
        assert!(q.x.abs() < 1e-9);
        assert!((q.y - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn angle_wraps_into_half_open_range() {
        assert_eq!(normalize_angle(190.0), -170.0);
        assert_eq!(normalize_angle(-180.0), 180.0);
        assert_eq!(normalize_angle(540.0), 180.0);
        assert_eq!(clamp_scale(9.0, 0.5, 5.0), 5.0);
    }

    #[test]
    fn rotation_quarter_turn() {
        let p = rotate_point(PointMM::new(1.0, 0.0), std::f64::consts::FRAC_PI_2);
        assert!(points_equal(p, PointMM::new(0.0, 1.0), 1e-9));
        assert_eq!(translate_point(p, PointMM::new(1.0, 1.0)).x.round(), 1.0);
    }

    #[test]
    fn frame_rounds_distances_to_one_decimal() {
        let anchors = AnchorRecord::default();
        let tag = PointMM::new(100.0, 200.0);
        let distances = compute_distances(tag, &anchors);
        let frame = to_simulation_frame(tag, &anchors, &distances, None);
        assert_eq!(frame.tag, PlanePosition { x_mm: 100.0, y_mm: 200.0 });
        // |(100,200) - (600,400)| = 538.516…
        assert_eq!(frame.distances_mm.a, 538.5);
        assert!(frame.distances_simulated_mm.is_none());
        assert!(chrono::DateTime::parse_from_rfc3339(&frame.timestamp).is_ok());

        let noisy = DistanceRecord { a: 1.26, b: 2.0, c: 3.04 };
        let frame = to_simulation_frame(tag, &anchors, &distances, Some(&noisy));
        assert_eq!(frame.distances_simulated_mm, Some(DistanceRecord { a: 1.3, b: 2.0, c: 3.0 }));
    }
}

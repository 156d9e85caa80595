//! # rover-monitor
//!
//! Headless telemetry viewer.
//!
//! Subscribes to rover telemetry over MQTT and/or HTTP polling and logs each
//! accepted frame with the same labels the dashboard renders.

use anyhow::Result;
use rover_link::{FeedConfig, TelemetryFeed};
use rover_types::geometry::{calculate_angle_label, calculate_distance_label, clamp_scale, polar_to_cartesian};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rover_link=info,rover_monitor=info".into()),
        )
        .init();

    let config = FeedConfig::default();
    let mm_per_px = clamp_scale(
        std::env::var("MONITOR_MM_PER_PX").ok().and_then(|v| v.parse().ok()).unwrap_or(5.0),
        0.5,
        50.0,
    );

    info!(
        "📡 Rover monitor starting: mqtt={} poll={}",
        config.mqtt_url.as_deref().unwrap_or("off"),
        config.poll_url.as_deref().unwrap_or("off"),
    );

    let mut feed = TelemetryFeed::start(&config);
    let mut frames = feed.frames();
    let mut statuses = feed.statuses();

    loop {
        tokio::select! {
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(frame) = frames.borrow_and_update().clone() else { continue };
                let px = polar_to_cartesian(frame.tag.distance_mm, frame.tag.angle_deg, mm_per_px);
                info!(
                    "{} tag {} @ {} (px {:.0},{:.0}) wheels L={:.0} R={:.0} mm/s",
                    frame.timestamp,
                    calculate_distance_label(frame.tag.distance_mm),
                    calculate_angle_label(frame.tag.angle_deg),
                    px.x,
                    px.y,
                    frame.drivetrain.front_left_axis_mm_per_s,
                    frame.drivetrain.front_right_axis_mm_per_s,
                );
            }
            changed = statuses.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *statuses.borrow_and_update();
                info!("MQTT: status {status}");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    feed.shutdown();
    Ok(())
}

mod config;
mod control;
mod handlers;
mod push;
mod telemetry_proxy;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use config::BackendConfig;
use handlers::{router, AppState};
use push::{PushCoordinator, ReqwestSink};
use telemetry_proxy::{run_upstream_poll, TelemetryCache};

// ─── CORS ─────────────────────────────────────────────────────────────────────

fn cors_layer(allowed: Option<&[String]>) -> CorsLayer {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    let Some(origins) = allowed else {
        return base.allow_origin(Any);
    };
    let values: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid origin in ALLOWED_ORIGINS: {o}");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(values))
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rover_backend=info,tower_http=warn".into()),
        )
        .init();

    info!("🤖 Rover UWB backend starting...");

    let config = BackendConfig::default();

    let control_url = config.control_url();
    match &control_url {
        Some(url) => info!("🎮 Relaying control state to {url}"),
        None => warn!("NODE_RED_BASE_URL is not defined; control state stays local"),
    }
    let push = PushCoordinator::new(ReqwestSink::new(), control_url, config.push);

    let telemetry = Arc::new(TelemetryCache::new(config.node_red_base.is_some()));
    match config.telemetry_url() {
        Some(url) => {
            tokio::spawn(run_upstream_poll(
                telemetry.clone(),
                url,
                config.telemetry_poll_interval,
                config.telemetry_timeout,
            ));
        }
        None => warn!("NODE_RED_BASE_URL is not defined; /api/telemetry will respond with 503"),
    }

    let app = router(AppState { push, telemetry }).layer(cors_layer(config.allowed_origins.as_deref()));

    let addr = format!("0.0.0.0:{}", config.port);
    info!("🚀 Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}

//! # handlers
//!
//! HTTP surface of the backend.
//!
//! - `GET  /api/control`   → current ControlState
//! - `POST /api/control`   → validated partial update, returns the new state
//! - `GET  /api/telemetry` → last Node-RED telemetry body, verbatim
//! - `GET  /health`        → liveness

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, warn};

use crate::control::ControlUpdate;
use crate::push::{ControlSink, PushCoordinator};
use crate::telemetry_proxy::TelemetryCache;

pub struct AppState<S: ControlSink> {
    pub push: Arc<PushCoordinator<S>>,
    pub telemetry: Arc<TelemetryCache>,
}

impl<S: ControlSink> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self { push: self.push.clone(), telemetry: self.telemetry.clone() }
    }
}

pub fn router<S: ControlSink>(state: AppState<S>) -> Router {
    Router::new()
        .route(
            "/api/control",
            get(get_control::<S>).post(post_control::<S>).fallback(method_not_allowed),
        )
        .route("/api/telemetry", get(get_telemetry::<S>))
        .route("/health", get(|| async { "rover-backend ok" }))
        .with_state(state)
}

async fn get_control<S: ControlSink>(State(state): State<AppState<S>>) -> Response {
    Json(state.push.control()).into_response()
}

async fn post_control<S: ControlSink>(State(state): State<AppState<S>>, body: Bytes) -> Response {
    match ControlUpdate::from_bytes(&body) {
        Ok(update) => {
            let control = state.push.update(update);
            debug!("Control: mode={} stick=({:.2}, {:.2})", control.mode, control.stick.x, control.stick.y);
            Json(control).into_response()
        }
        Err(e) => {
            warn!("Control: rejected update: {e}");
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "GET, POST")],
        Json(json!({ "error": "Method not allowed" })),
    )
        .into_response()
}

async fn get_telemetry<S: ControlSink>(State(state): State<AppState<S>>) -> Response {
    state.telemetry.response()
}

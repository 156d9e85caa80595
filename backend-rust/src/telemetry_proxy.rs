//! # telemetry_proxy
//!
//! Polls Node-RED and serves the last body verbatim.
//!
//! The upstream loop is sequential: the next fetch is scheduled only after
//! the previous one settles. A failed fetch never evicts the cached body.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct CacheState {
    latest: Option<String>,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct TelemetryCache {
    configured: bool,
    state: Mutex<CacheState>,
}

impl TelemetryCache {
    pub fn new(configured: bool) -> Self {
        Self { configured, state: Mutex::default() }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_body(&self, body: String) {
        let mut st = self.lock();
        st.latest = Some(body);
        st.last_error = None;
    }

    pub fn record_error(&self, error: impl Into<String>) {
        self.lock().last_error = Some(error.into());
    }

    /// HTTP response for `GET /api/telemetry`
    pub fn response(&self) -> Response {
        if !self.configured {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "NODE_RED_BASE_URL is not configured on the server");
        }
        let st = self.lock();
        match (&st.latest, &st.last_error) {
            (Some(body), _) => (
                [(header::CACHE_CONTROL, "no-store"), (header::CONTENT_TYPE, "application/json")],
                body.clone(),
            )
                .into_response(),
            (None, Some(error)) => error_response(StatusCode::BAD_GATEWAY, error),
            (None, None) => error_response(StatusCode::SERVICE_UNAVAILABLE, "Telemetry not yet available"),
        }
    }
}

fn error_response(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "error": error }))).into_response()
}

async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String, String> {
    let response = client
        .get(url)
        .header(header::CACHE_CONTROL, "no-store")
        .send()
        .await
        .map_err(|e| format!("Failed to fetch telemetry from Node-RED: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("Unexpected status {}", response.status().as_u16()));
    }
    response.text().await.map_err(|e| format!("Failed to read telemetry body: {e}"))
}

/// Upstream loop; runs until the task is aborted.
pub async fn run_upstream_poll(cache: std::sync::Arc<TelemetryCache>, url: String, interval: Duration, fetch_timeout: Duration) {
    let client = match reqwest::Client::builder().timeout(fetch_timeout).build() {
        Ok(c) => c,
        Err(e) => {
            warn!("Telemetry: cannot build HTTP client: {e}");
            return;
        }
    };
    info!("📡 Proxying Node-RED telemetry from {url}");

    loop {
        match fetch_text(&client, &url).await {
            Ok(body) => cache.record_body(body),
            Err(e) => {
                warn!("Telemetry: fetch failed: {e}");
                cache.record_error(e);
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(response: Response) -> (StatusCode, String, Option<String>) {
        let status = response.status();
        let cache = response
            .headers()
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap(), cache)
    }

    #[tokio::test]
    async fn unconfigured_upstream_is_unavailable() {
        let (status, body, _) = body_of(TelemetryCache::new(false).response()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("NODE_RED_BASE_URL"));
    }

    #[tokio::test]
    async fn nothing_fetched_yet_is_unavailable() {
        let (status, body, _) = body_of(TelemetryCache::new(true).response()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, r#"{"error":"Telemetry not yet available"}"#);
    }

    #[tokio::test]
    async fn failed_first_fetch_is_bad_gateway() {
        let cache = TelemetryCache::new(true);
        cache.record_error("Unexpected status 500");
        let (status, body, _) = body_of(cache.response()).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body.contains("Unexpected status 500"));
    }

    #[tokio::test]
    async fn cached_body_survives_later_failures() {
        let cache = TelemetryCache::new(true);
        let raw = r#"{"timestamp": 1, "tag": {"distance_mm": 1200}}"#;
        cache.record_body(raw.to_string());
        cache.record_error("Unexpected status 502");

        let (status, body, cache_control) = body_of(cache.response()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, raw);
        assert_eq!(cache_control.as_deref(), Some("no-store"));
    }
}

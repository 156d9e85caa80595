//! # config
//!
//! Backend settings, read from the environment with defaults.

use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_ms(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(key, default))
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// HTTP listen port (default 5000)
    pub port: u16,
    /// Node-RED base URL; unset disables both relay targets
    pub node_red_base: Option<String>,
    pub telemetry_path: String,
    pub control_path: String,
    pub telemetry_poll_interval: Duration,
    pub telemetry_timeout: Duration,
    pub push: PushConfig,
    /// `None` means any origin
    pub allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConfig {
    /// Minimum spacing between push attempt starts (default 100 ms)
    pub min_interval: Duration,
    /// Suppression window after a failed push (default 5 s)
    pub cooldown: Duration,
    /// Per-push deadline (default 2 s)
    pub timeout: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            min_interval: env_ms("CONTROL_PUSH_MIN_INTERVAL_MS", 100),
            cooldown: env_ms("CONTROL_PUSH_COOLDOWN_MS", 5000),
            timeout: env_ms("CONTROL_PUSH_TIMEOUT_MS", 2000),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            port: env_parse("PORT", 5000),
            node_red_base: std::env::var("NODE_RED_BASE_URL").ok().filter(|v| !v.trim().is_empty()),
            telemetry_path: std::env::var("NODE_RED_TELEMETRY_PATH")
                .unwrap_or_else(|_| "/uwb/rover/telemetry".to_string()),
            control_path: std::env::var("NODE_RED_CONTROL_PATH")
                .unwrap_or_else(|_| "/uwb/rover/control".to_string()),
            telemetry_poll_interval: env_ms("TELEMETRY_POLL_INTERVAL_MS", 500),
            telemetry_timeout: env_ms("TELEMETRY_FETCH_TIMEOUT_MS", 2000),
            push: PushConfig::default(),
            allowed_origins: parse_origins(&std::env::var("ALLOWED_ORIGINS").unwrap_or_default()),
        }
    }
}

impl BackendConfig {
    pub fn telemetry_url(&self) -> Option<String> {
        self.node_red_base.as_deref().map(|base| join_url(base, &self.telemetry_path))
    }

    pub fn control_url(&self) -> Option<String> {
        self.node_red_base.as_deref().map(|base| join_url(base, &self.control_path))
    }
}

/// Base and path joined with exactly one slash between them
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Comma-separated origin list; empty or `*` allows any origin
pub fn parse_origins(raw: &str) -> Option<Vec<String>> {
    let origins: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect();
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        None
    } else {
        Some(origins)
    }
}

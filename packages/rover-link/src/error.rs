use thiserror::Error;

/// Pub/sub (MQTT) link failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("invalid broker url: {0}")]
    InvalidUrl(String),
    #[error("MQTT client is not connected")]
    NotConnected,
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

/// HTTP telemetry poll failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    /// Request never produced a response (DNS, refused, TLS, timeout)
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP poll failed: {0}")]
    Status(u16),
    #[error("invalid telemetry body: {0}")]
    Decode(String),
}

impl PollError {
    /// Only network-level failures qualify for the https → http downgrade
    pub fn is_network(&self) -> bool {
        matches!(self, PollError::Network(_))
    }
}

impl From<reqwest::Error> for PollError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PollError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            PollError::Status(status.as_u16())
        } else {
            PollError::Network(err.to_string())
        }
    }
}

/// Outbound HTTP POST failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("request timed out")]
    Timeout,
    #[error("connection error: {0}")]
    Network(String),
    #[error("HTTP {status} {reason}")]
    Status { status: u16, reason: String },
    #[error("could not encode payload: {0}")]
    Encode(String),
}

impl From<reqwest::Error> for SendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SendError::Timeout
        } else {
            SendError::Network(err.to_string())
        }
    }
}

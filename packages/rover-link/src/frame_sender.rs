//! # frame_sender
//!
//! Fan one `SimulationFrame` out to HTTP and MQTT.
//!
//! Both legs run concurrently and are settled independently. A send counts
//! when at least one enabled leg succeeded.
//!
//! ## Invariants
//! - During an HTTP cooldown, automatic sends skip the HTTP leg entirely;
//!   manual sends always attempt it
//! - Changing the HTTP target or retry policy clears the cooldown
//! - Replacing the publisher affects sends that start afterwards; a send in
//!   flight keeps the publisher it started with
//! - A failing leg never masks the other leg's result

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rover_types::{HttpSendState, LegStatus, PublishState, SendStatus, SimulationFrame};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{LinkError, SendError};
use crate::http_client::{HttpClient, PostTransport, RetryPolicy};
use crate::mqtt::FramePublisher;

pub const HTTP_ERROR_COOLDOWN: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Timer-driven; subject to the HTTP cooldown
    Auto,
    /// Operator-triggered; always attempts every enabled leg
    Manual,
}

#[derive(Debug, Default)]
pub struct SendOutcome {
    /// `None` when the leg was disabled or skipped
    pub http: Option<Result<(), SendError>>,
    pub mqtt: Option<Result<(), LinkError>>,
    pub counted: bool,
}

/// `<prefix>/<suffix>`, dropping one trailing slash from the prefix
pub fn build_topic(prefix: &str, suffix: &str) -> String {
    let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
    format!("{prefix}/{suffix}")
}

/// Frame on `<prefix>/frame`, then per-anchor distances and the tag position.
pub async fn publish_frame<P: FramePublisher>(
    publisher: &P,
    prefix: &str,
    frame: &SimulationFrame,
) -> Result<(), LinkError> {
    let encode = |e: serde_json::Error| LinkError::Publish(e.to_string());
    let body = serde_json::to_vec(frame).map_err(encode)?;
    let tag = serde_json::to_vec(&frame.tag).map_err(encode)?;
    let d = frame.distances_mm;

    publisher.publish(build_topic(prefix, "frame"), body).await?;
    tokio::try_join!(
        publisher.publish(build_topic(prefix, "A/distance_mm"), d.a.to_string().into_bytes()),
        publisher.publish(build_topic(prefix, "B/distance_mm"), d.b.to_string().into_bytes()),
        publisher.publish(build_topic(prefix, "C/distance_mm"), d.c.to_string().into_bytes()),
        publisher.publish(build_topic(prefix, "tag"), tag),
    )?;
    Ok(())
}

struct SenderState<P> {
    status: SendStatus,
    retry: RetryPolicy,
    http_url: Option<String>,
    topic_prefix: String,
    publisher: Option<Arc<P>>,
    cooldown_until: Option<Instant>,
    send_counter: u64,
    last_sent_at: Option<String>,
}

pub struct FrameSender<T: PostTransport, P: FramePublisher> {
    http: HttpClient<T>,
    cooldown: Duration,
    state: Mutex<SenderState<P>>,
}

impl<T: PostTransport, P: FramePublisher> FrameSender<T, P> {
    /// An empty or absent `http_url` disables the HTTP leg; no publisher
    /// disables the MQTT leg.
    pub fn new(http: HttpClient<T>, http_url: Option<String>, publisher: Option<P>, topic_prefix: impl Into<String>) -> Self {
        let state = SenderState {
            status: SendStatus::default(),
            retry: http.policy(),
            http_url: http_url.filter(|u| !u.trim().is_empty()),
            topic_prefix: topic_prefix.into(),
            publisher: publisher.map(Arc::new),
            cooldown_until: None,
            send_counter: 0,
            last_sent_at: None,
        };
        Self { http, cooldown: HTTP_ERROR_COOLDOWN, state: Mutex::new(state) }
    }

    fn lock(&self) -> MutexGuard<'_, SenderState<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> SendStatus {
        self.lock().status.clone()
    }

    pub fn send_counter(&self) -> u64 {
        self.lock().send_counter
    }

    pub fn last_sent_at(&self) -> Option<String> {
        self.lock().last_sent_at.clone()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.lock().retry
    }

    pub fn publisher(&self) -> Option<Arc<P>> {
        self.lock().publisher.clone()
    }

    /// Swap the MQTT leg, returning the previous publisher so the caller can
    /// shut it down. `None` disables the leg.
    pub fn replace_publisher(&self, publisher: Option<P>) -> Option<Arc<P>> {
        let mut st = self.lock();
        st.status.mqtt = LegStatus::default();
        std::mem::replace(&mut st.publisher, publisher.map(Arc::new))
    }

    pub fn http_target(&self) -> Option<String> {
        self.lock().http_url.clone()
    }

    pub fn topic_prefix(&self) -> String {
        self.lock().topic_prefix.clone()
    }

    pub fn set_http_target(&self, url: Option<String>) {
        let mut st = self.lock();
        st.http_url = url.filter(|u| !u.trim().is_empty());
        st.cooldown_until = None;
        st.status.http = LegStatus::new(HttpSendState::Idle);
    }

    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        let mut st = self.lock();
        st.retry = policy;
        st.cooldown_until = None;
    }

    pub fn set_topic_prefix(&self, prefix: impl Into<String>) {
        self.lock().topic_prefix = prefix.into();
    }

    /// Publisher connection changes reported outside a send
    pub fn set_mqtt_status(&self, status: LegStatus<PublishState>) {
        self.lock().status.mqtt = status;
    }

    pub async fn send(&self, frame: &SimulationFrame, mode: SendMode) -> SendOutcome {
        let (http_target, prefix, retry, publisher) = {
            let mut st = self.lock();
            let cooling = mode == SendMode::Auto && st.cooldown_until.is_some_and(|until| Instant::now() < until);
            let target = if cooling { None } else { st.http_url.clone() };
            if target.is_some() {
                st.status.http = LegStatus::new(HttpSendState::Sending);
            } else if cooling {
                debug!("HTTP: auto send skipped during cooldown");
            }
            (target, st.topic_prefix.clone(), st.retry, st.publisher.clone())
        };

        let http_leg = async {
            match &http_target {
                Some(url) => Some(self.http.post_with(retry, url, frame).await),
                None => None,
            }
        };
        let mqtt_leg = async {
            match &publisher {
                Some(publisher) => Some(publish_frame(publisher.as_ref(), &prefix, frame).await),
                None => None,
            }
        };
        let (http, mqtt) = tokio::join!(http_leg, mqtt_leg);

        let mut st = self.lock();
        match &http {
            Some(Ok(())) => {
                st.cooldown_until = None;
                st.status.http = LegStatus::with_message(HttpSendState::Success, "Delivered");
            }
            Some(Err(err)) => {
                warn!("HTTP: frame delivery failed: {err}");
                let message = if mode == SendMode::Auto {
                    st.cooldown_until = Some(Instant::now() + self.cooldown);
                    format!("{err}, retrying in {} s", self.cooldown.as_secs())
                } else {
                    err.to_string()
                };
                st.status.http = LegStatus::with_message(HttpSendState::Error, message);
            }
            None => {}
        }
        match &mqtt {
            Some(Ok(())) => st.status.mqtt = LegStatus::new(PublishState::Connected),
            Some(Err(err)) => {
                warn!("MQTT: frame publish failed: {err}");
                st.status.mqtt = LegStatus::with_message(PublishState::Error, err.to_string());
            }
            None => {}
        }

        let counted = matches!(http, Some(Ok(()))) || matches!(mqtt, Some(Ok(())));
        if counted {
            st.send_counter += 1;
            st.last_sent_at = Some(frame.timestamp.clone());
        }
        SendOutcome { http, mqtt, counted }
    }
}

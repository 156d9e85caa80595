//! # feed
//!
//! Latest-frame store fed by the subscriber and the poller.
//!
//! Both sources deliver raw JSON. Only payloads that normalize into a full
//! `TelemetryFrame` replace the current one; anything else is dropped and
//! the previous frame stays visible.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use rover_types::{normalize_telemetry, LinkStatus, TelemetryFrame};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::mqtt::{MqttConnector, PubSubConnector};
use crate::poller::{HttpPoller, ReqwestFetcher, TelemetryFetcher};
use crate::subscriber::{BackoffPolicy, SubscriberConfig, TelemetrySubscriber};

fn env_ms(key: &str, default: u64) -> Duration {
    Duration::from_millis(std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default))
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub mqtt_url: Option<String>,
    pub mqtt_topic: Option<String>,
    pub backoff: BackoffPolicy,
    pub poll_url: Option<String>,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            mqtt_url: env_opt("MQTT_WS_URL"),
            mqtt_topic: env_opt("MQTT_TOPIC"),
            backoff: BackoffPolicy {
                initial: env_ms("MQTT_BACKOFF_INITIAL_MS", 500),
                max: env_ms("MQTT_BACKOFF_MAX_MS", 8000),
            },
            poll_url: env_opt("HTTP_POLL_URL"),
            poll_interval: env_ms("HTTP_POLL_INTERVAL_MS", 250),
            poll_timeout: Duration::from_secs(2),
        }
    }
}

struct FeedInner {
    frames: watch::Sender<Option<TelemetryFrame>>,
    status: watch::Sender<LinkStatus>,
}

impl FeedInner {
    fn ingest(&self, raw: Value) -> bool {
        match normalize_telemetry(&raw) {
            Some(frame) => {
                self.frames.send_replace(Some(frame));
                true
            }
            None => {
                debug!("Feed: discarded invalid telemetry payload");
                false
            }
        }
    }
}

pub struct TelemetryFeed {
    inner: Arc<FeedInner>,
    subscriber: Option<TelemetrySubscriber>,
    poller: Option<HttpPoller<ReqwestFetcher>>,
}

impl TelemetryFeed {
    /// No sources attached; status stays `disconnected` until one is.
    pub fn new() -> Self {
        let (frames, _) = watch::channel(None);
        let (status, _) = watch::channel(LinkStatus::Disconnected);
        Self { inner: Arc::new(FeedInner { frames, status }), subscriber: None, poller: None }
    }

    /// Build and start every source the config names.
    pub fn start(config: &FeedConfig) -> Self {
        let mut feed = Self::new();

        match (&config.mqtt_url, &config.mqtt_topic) {
            (Some(url), Some(topic)) => {
                let subscriber_config = SubscriberConfig {
                    url: url.clone(),
                    topic: topic.clone(),
                    backoff: config.backoff,
                };
                feed.attach_subscriber(subscriber_config, Arc::new(MqttConnector::default()));
            }
            _ => {
                warn!("Feed: MQTT_WS_URL / MQTT_TOPIC not set, pub/sub telemetry disabled");
                feed.inner.status.send_replace(LinkStatus::Failed);
            }
        }

        if let Some(raw) = &config.poll_url {
            match (Url::parse(raw), ReqwestFetcher::new(config.poll_timeout)) {
                (Ok(url), Ok(fetcher)) => {
                    let poller = feed.build_poller(fetcher, url, config.poll_interval);
                    poller.start();
                    feed.poller = Some(poller);
                }
                (Err(e), _) => warn!("Feed: invalid HTTP_POLL_URL {raw}: {e}"),
                (_, Err(e)) => warn!("Feed: cannot build HTTP client: {e}"),
            }
        }

        feed
    }

    pub fn attach_subscriber(&mut self, config: SubscriberConfig, connector: Arc<dyn PubSubConnector>) {
        info!("Feed: subscribing to {} on {}", config.topic, config.url);
        let ingest = self.inner.clone();
        let subscriber = TelemetrySubscriber::new(config, connector, move |raw| {
            ingest.ingest(raw);
        });
        let status = self.inner.clone();
        subscriber.add_status_listener(move |s| {
            status.status.send_replace(s);
        });
        subscriber.connect();
        self.subscriber = Some(subscriber);
    }

    pub fn build_poller<F: TelemetryFetcher>(&self, fetcher: F, url: Url, interval: Duration) -> HttpPoller<F> {
        info!("Feed: polling {url} every {} ms", interval.as_millis());
        let ingest = self.inner.clone();
        HttpPoller::new(fetcher, url, interval, move |raw| {
            ingest.ingest(raw);
        })
    }

    /// Normalize and store one raw payload. Returns whether it was accepted.
    pub fn ingest(&self, raw: Value) -> bool {
        self.inner.ingest(raw)
    }

    pub fn latest(&self) -> Option<TelemetryFrame> {
        self.inner.frames.borrow().clone()
    }

    pub fn status(&self) -> LinkStatus {
        *self.inner.status.borrow()
    }

    pub fn frames(&self) -> watch::Receiver<Option<TelemetryFrame>> {
        self.inner.frames.subscribe()
    }

    pub fn statuses(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    pub fn shutdown(&mut self) {
        if let Some(subscriber) = self.subscriber.take() {
            subscriber.disconnect();
        }
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
    }
}

impl Default for TelemetryFeed {
    fn default() -> Self {
        Self::new()
    }
}

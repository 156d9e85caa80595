//! # mqtt
//!
//! Pub/sub transport over rumqttc.
//!
//! Two halves:
//! - `PubSubConnector`/`PubSubLink`: the inbound side. A connector opens a
//!   single-shot link; its event stream ends after the first drop. Reconnect
//!   policy lives in `TelemetrySubscriber`, never in the transport.
//! - `MqttPublisher`: the outbound side used by the simulator. It keeps its
//!   own fixed-period reconnect loop and reports `PublishState` to listeners.
//!
//! ## Invariants
//! - A link emits `Connected` at most once, and `Closed` exactly once as its
//!   last event (unless it was shut down locally first)
//! - `Error` is only emitted before `Closed`

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use reqwest::Url;
use rover_types::{LegStatus, PublishState};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::LinkError;

// ── Inbound link abstraction ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Message(Bytes),
    Error(String),
    Closed,
}

pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

pub trait PubSubLink: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<(), LinkError>;
    /// Close the link locally. No further events are delivered.
    fn shutdown(&self);
}

pub trait PubSubConnector: Send + Sync + 'static {
    fn open(&self, url: &str) -> Result<(Box<dyn PubSubLink>, LinkEvents), LinkError>;
}

// ── Options ───────────────────────────────────────────────────────────────────

/// Build client options from a broker URL (`ws`, `wss`, `mqtt`, `mqtts`).
/// WebSocket transports take the full URL as broker address, path included.
pub fn mqtt_options(url: &str, client_id: &str, keep_alive: Duration) -> Result<MqttOptions, LinkError> {
    let parsed = Url::parse(url).map_err(|e| LinkError::InvalidUrl(format!("{url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| LinkError::InvalidUrl(format!("{url}: missing host")))?
        .to_string();

    let (address, port, transport) = match parsed.scheme() {
        "mqtt" | "tcp" => (host, parsed.port().unwrap_or(1883), Transport::Tcp),
        "mqtts" | "ssl" => (host, parsed.port().unwrap_or(8883), Transport::tls_with_default_config()),
        "ws" => (url.to_string(), parsed.port().unwrap_or(80), Transport::Ws),
        "wss" => (url.to_string(), parsed.port().unwrap_or(443), Transport::wss_with_default_config()),
        other => return Err(LinkError::InvalidUrl(format!("{url}: unsupported scheme {other}"))),
    };

    let mut options = MqttOptions::new(client_id, address, port);
    options
        .set_transport(transport)
        .set_keep_alive(keep_alive)
        .set_clean_session(true);
    if !parsed.username().is_empty() {
        options.set_credentials(parsed.username(), parsed.password().unwrap_or(""));
    }
    Ok(options)
}

pub fn random_client_id(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &id[..8])
}

// ── rumqttc connector ─────────────────────────────────────────────────────────

pub struct MqttConnector {
    pub client_prefix: String,
    pub keep_alive: Duration,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self { client_prefix: "uwb-monitor".into(), keep_alive: Duration::from_secs(10) }
    }
}

impl PubSubConnector for MqttConnector {
    fn open(&self, url: &str) -> Result<(Box<dyn PubSubLink>, LinkEvents), LinkError> {
        let options = mqtt_options(url, &random_client_id(&self.client_prefix), self.keep_alive)?;
        let (client, eventloop) = AsyncClient::new(options, 16);
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_events(eventloop, tx));
        Ok((Box::new(MqttLink { client, pump }), rx))
    }
}

struct MqttLink {
    client: AsyncClient,
    pump: JoinHandle<()>,
}

impl PubSubLink for MqttLink {
    fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| LinkError::Subscribe(e.to_string()))
    }

    fn shutdown(&self) {
        let _ = self.client.try_disconnect();
        self.pump.abort();
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Drive one connection to completion. rumqttc would reconnect on the next
/// `poll()`, so the pump stops at the first error instead.
async fn pump_events(mut eventloop: EventLoop, tx: mpsc::UnboundedSender<LinkEvent>) {
    let mut connected = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected = true;
                let _ = tx.send(LinkEvent::Connected);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let _ = tx.send(LinkEvent::Message(publish.payload));
            }
            Ok(_) => {}
            Err(e) => {
                debug!("MQTT: event loop ended: {e}");
                if !connected {
                    let _ = tx.send(LinkEvent::Error(e.to_string()));
                }
                let _ = tx.send(LinkEvent::Closed);
                return;
            }
        }
    }
}

// ── Outbound publisher ────────────────────────────────────────────────────────

/// Anything that can publish a payload on a topic. Implemented by
/// `MqttPublisher` and by test doubles.
pub trait FramePublisher: Send + Sync + 'static {
    fn publish(&self, topic: String, payload: Vec<u8>) -> impl Future<Output = Result<(), LinkError>> + Send;
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub broker_url: String,
    pub client_id: String,
    pub retain: bool,
    pub keep_alive: Duration,
    pub reconnect_period: Duration,
}

impl PublisherConfig {
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            client_id: random_client_id("uwb-sim"),
            retain: false,
            keep_alive: Duration::from_secs(30),
            reconnect_period: Duration::from_secs(2),
        }
    }
}

type PublishListener = Arc<dyn Fn(&LegStatus<PublishState>) + Send + Sync>;

#[derive(Default)]
struct PublisherStatus {
    current: LegStatus<PublishState>,
    listeners: Vec<(u64, PublishListener)>,
    next_listener_id: u64,
}

pub struct MqttPublisher {
    client: AsyncClient,
    retain: bool,
    status: Arc<Mutex<PublisherStatus>>,
    task: JoinHandle<()>,
}

impl MqttPublisher {
    pub fn connect(config: &PublisherConfig) -> Result<Self, LinkError> {
        let options = mqtt_options(&config.broker_url, &config.client_id, config.keep_alive)?;
        let (client, eventloop) = AsyncClient::new(options, 64);
        let status = Arc::new(Mutex::new(PublisherStatus {
            current: LegStatus::new(PublishState::Connecting),
            ..Default::default()
        }));
        info!("MQTT: publishing to {} as {}", config.broker_url, config.client_id);
        let task = tokio::spawn(drive_publisher(eventloop, status.clone(), config.reconnect_period));
        Ok(Self { client, retain: config.retain, status, task })
    }

    pub fn status(&self) -> LegStatus<PublishState> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).current.clone()
    }

    /// Register a listener; it is called immediately with the current status.
    pub fn add_status_listener(&self, listener: impl Fn(&LegStatus<PublishState>) + Send + Sync + 'static) -> u64 {
        let listener: PublishListener = Arc::new(listener);
        let (id, current) = {
            let mut st = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            let id = st.next_listener_id;
            st.next_listener_id += 1;
            st.listeners.push((id, listener.clone()));
            (id, st.current.clone())
        };
        listener(&current);
        id
    }

    pub fn remove_status_listener(&self, id: u64) {
        let mut st = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        st.listeners.retain(|(lid, _)| *lid != id);
    }

    pub fn disconnect(&self) {
        let _ = self.client.try_disconnect();
        self.task.abort();
        set_publish_status(&self.status, LegStatus::new(PublishState::Disconnected));
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FramePublisher for MqttPublisher {
    async fn publish(&self, topic: String, payload: Vec<u8>) -> Result<(), LinkError> {
        if self.status().state != PublishState::Connected {
            return Err(LinkError::NotConnected);
        }
        self.client
            .publish(topic, QoS::AtMostOnce, self.retain, payload)
            .await
            .map_err(|e| LinkError::Publish(e.to_string()))
    }
}

fn set_publish_status(status: &Mutex<PublisherStatus>, next: LegStatus<PublishState>) {
    let listeners: Vec<PublishListener> = {
        let mut st = status.lock().unwrap_or_else(PoisonError::into_inner);
        if st.current == next {
            return;
        }
        st.current = next.clone();
        st.listeners.iter().map(|(_, l)| l.clone()).collect()
    };
    for listener in listeners {
        listener(&next);
    }
}

async fn drive_publisher(mut eventloop: EventLoop, status: Arc<Mutex<PublisherStatus>>, reconnect_period: Duration) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT: publisher connected");
                set_publish_status(&status, LegStatus::new(PublishState::Connected));
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT: publisher connection error: {e}");
                set_publish_status(&status, LegStatus::with_message(PublishState::Error, e.to_string()));
                tokio::time::sleep(reconnect_period).await;
                set_publish_status(&status, LegStatus::new(PublishState::Connecting));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_keeps_path_in_broker_address() {
        let options = mqtt_options("ws://broker.local:9001/mqtt", "c1", Duration::from_secs(10)).unwrap();
        let (addr, port) = options.broker_address();
        assert_eq!(addr, "ws://broker.local:9001/mqtt");
        assert_eq!(port, 9001);
        assert_eq!(options.client_id(), "c1");
    }

    #[test]
    fn tcp_url_uses_bare_host() {
        let options = mqtt_options("mqtt://10.0.0.5", "c2", Duration::from_secs(10)).unwrap();
        assert_eq!(options.broker_address(), ("10.0.0.5".to_string(), 1883));
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let err = mqtt_options("ftp://host/", "c3", Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, LinkError::InvalidUrl(_)));
        assert!(mqtt_options("not a url", "c4", Duration::from_secs(10)).is_err());
    }

    #[test]
    fn client_ids_carry_prefix() {
        let id = random_client_id("uwb-sim");
        assert!(id.starts_with("uwb-sim-"));
        assert_eq!(id.len(), "uwb-sim-".len() + 8);
        assert_ne!(id, random_client_id("uwb-sim"));
    }
}

//! # subscriber
//!
//! Inbound telemetry subscription with owned reconnect policy.
//!
//! The transport never reconnects on its own; every drop is turned into a
//! scheduled retry here, with exponential backoff capped at `max`.
//!
//! ## Invariants
//! - Status listeners see every transition, in order, and never the same
//!   status twice in a row
//! - At most one reconnect timer is pending at any time
//! - `disconnect()` is final until the next `connect()`: no timer survives it
//! - Events from a link that has since been replaced are ignored
//! - `Failed` is terminal: reached only without ever having connected, and
//!   only left through an explicit `connect()`

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use rover_types::LinkStatus;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::mqtt::{LinkEvent, LinkEvents, PubSubConnector, PubSubLink};

// ── Backoff ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { initial: Duration::from_millis(500), max: Duration::from_millis(8000) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    /// Reconnects scheduled since the last successful connect
    pub attempt: u32,
    /// Delay used by the most recent scheduled reconnect
    pub delay: Duration,
}

impl BackoffState {
    pub fn initial(policy: &BackoffPolicy) -> Self {
        Self { attempt: 0, delay: policy.initial }
    }

    /// State for the next scheduled reconnect: `initial`, then doubling, capped.
    pub fn next(self, policy: &BackoffPolicy) -> Self {
        let attempt = self.attempt + 1;
        let delay = if attempt == 1 { policy.initial } else { self.delay.saturating_mul(2) };
        Self { attempt, delay: delay.min(policy.max) }
    }
}

// ── Subscriber ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub url: String,
    pub topic: String,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;
type StatusListener = Arc<dyn Fn(LinkStatus) + Send + Sync>;

pub struct TelemetrySubscriber {
    shared: Arc<Shared>,
}

struct Shared {
    config: SubscriberConfig,
    connector: Arc<dyn PubSubConnector>,
    on_message: MessageHandler,
    state: Mutex<SubscriberState>,
}

struct SubscriberState {
    status: LinkStatus,
    backoff: BackoffState,
    has_ever_connected: bool,
    /// Bumped whenever the current link is torn down
    generation: u64,
    link: Option<Box<dyn PubSubLink>>,
    pump: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    timer_seq: u64,
    listeners: Vec<(ListenerId, StatusListener)>,
    next_listener_id: u64,
    /// Transitions not yet delivered to listeners
    pending: Vec<LinkStatus>,
}

impl SubscriberState {
    fn set_status(&mut self, next: LinkStatus) {
        if self.status != next {
            self.status = next;
            self.pending.push(next);
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn teardown_link(&mut self) {
        self.generation += 1;
        if let Some(link) = self.link.take() {
            link.shutdown();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    fn take_notices(&mut self) -> Notices {
        if self.pending.is_empty() {
            return Notices::default();
        }
        Notices {
            statuses: std::mem::take(&mut self.pending),
            listeners: self.listeners.iter().map(|(_, l)| l.clone()).collect(),
        }
    }
}

/// Transitions collected under the lock, delivered after it is released
#[derive(Default)]
struct Notices {
    statuses: Vec<LinkStatus>,
    listeners: Vec<StatusListener>,
}

impl Notices {
    fn deliver(self) {
        for status in self.statuses {
            for listener in &self.listeners {
                listener(status);
            }
        }
    }
}

impl TelemetrySubscriber {
    /// `on_message` receives every payload that parses as JSON; validation is
    /// the caller's concern.
    pub fn new(
        config: SubscriberConfig,
        connector: Arc<dyn PubSubConnector>,
        on_message: impl Fn(Value) + Send + Sync + 'static,
    ) -> Self {
        let backoff = BackoffState::initial(&config.backoff);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                on_message: Arc::new(on_message),
                state: Mutex::new(SubscriberState {
                    status: LinkStatus::Disconnected,
                    backoff,
                    has_ever_connected: false,
                    generation: 0,
                    link: None,
                    pump: None,
                    reconnect_timer: None,
                    timer_seq: 0,
                    listeners: Vec::new(),
                    next_listener_id: 0,
                    pending: Vec::new(),
                }),
            }),
        }
    }

    /// Open a link now. From `Disconnected` or `Failed` this also resets backoff.
    pub fn connect(&self) {
        let notices = {
            let mut st = self.shared.lock();
            if matches!(st.status, LinkStatus::Disconnected | LinkStatus::Failed) {
                st.backoff = BackoffState::initial(&self.shared.config.backoff);
            }
            self.shared.open_link(&mut st);
            st.take_notices()
        };
        notices.deliver();
    }

    pub fn disconnect(&self) {
        let notices = {
            let mut st = self.shared.lock();
            st.set_status(LinkStatus::Disconnected);
            st.cancel_timer();
            st.teardown_link();
            st.take_notices()
        };
        notices.deliver();
    }

    pub fn status(&self) -> LinkStatus {
        self.shared.lock().status
    }

    pub fn backoff(&self) -> BackoffState {
        self.shared.lock().backoff
    }

    pub fn add_status_listener(&self, listener: impl Fn(LinkStatus) + Send + Sync + 'static) -> ListenerId {
        let mut st = self.shared.lock();
        let id = ListenerId(st.next_listener_id);
        st.next_listener_id += 1;
        st.listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn remove_status_listener(&self, id: ListenerId) {
        self.shared.lock().listeners.retain(|(lid, _)| *lid != id);
    }
}

impl Drop for TelemetrySubscriber {
    fn drop(&mut self) {
        let mut st = self.shared.lock();
        st.cancel_timer();
        st.teardown_link();
        st.listeners.clear();
        st.pending.clear();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SubscriberState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_link(self: &Arc<Self>, st: &mut SubscriberState) {
        st.cancel_timer();
        st.teardown_link();
        st.set_status(if st.has_ever_connected { LinkStatus::Reconnecting } else { LinkStatus::Connecting });

        let generation = st.generation;
        match self.connector.open(&self.config.url) {
            Ok((link, events)) => {
                st.link = Some(link);
                st.pump = Some(self.spawn_pump(generation, events));
            }
            Err(e) => {
                error!("MQTT: cannot open {}: {e}", self.config.url);
                if st.has_ever_connected {
                    self.schedule_reconnect(st);
                } else {
                    st.set_status(LinkStatus::Failed);
                }
            }
        }
    }

    fn spawn_pump(self: &Arc<Self>, generation: u64, mut events: LinkEvents) -> JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(shared) = weak.upgrade() else { break };
                shared.handle_event(generation, event);
            }
        })
    }

    fn handle_event(self: &Arc<Self>, generation: u64, event: LinkEvent) {
        let event = match event {
            LinkEvent::Message(payload) => {
                if self.lock().generation == generation {
                    self.dispatch_message(&payload);
                }
                return;
            }
            other => other,
        };

        let notices = {
            let mut st = self.lock();
            if st.generation != generation {
                return;
            }
            match event {
                LinkEvent::Connected => {
                    info!("MQTT: connected to {}", self.config.url);
                    st.has_ever_connected = true;
                    st.backoff = BackoffState::initial(&self.config.backoff);
                    st.cancel_timer();
                    st.set_status(LinkStatus::Connected);
                    if let Some(link) = &st.link {
                        if let Err(e) = link.subscribe(&self.config.topic) {
                            warn!("MQTT: subscribe to {} failed: {e}", self.config.topic);
                        }
                    }
                }
                LinkEvent::Error(msg) => {
                    error!("MQTT: connection error: {msg}");
                    if !st.has_ever_connected {
                        st.cancel_timer();
                        st.teardown_link();
                        st.set_status(LinkStatus::Failed);
                    }
                }
                LinkEvent::Closed => {
                    if st.status != LinkStatus::Disconnected {
                        self.schedule_reconnect(&mut st);
                    }
                }
                LinkEvent::Message(_) => {}
            }
            st.take_notices()
        };
        notices.deliver();
    }

    fn dispatch_message(&self, payload: &[u8]) {
        match serde_json::from_slice::<Value>(payload) {
            Ok(value) => (self.on_message)(value),
            Err(e) => warn!("MQTT: failed to parse telemetry payload: {e}"),
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, st: &mut SubscriberState) {
        let policy = self.config.backoff;
        st.backoff = st.backoff.next(&policy);
        st.cancel_timer();

        if !st.has_ever_connected && st.backoff.delay >= policy.max {
            warn!("MQTT: giving up after {} attempts without a connection", st.backoff.attempt);
            st.teardown_link();
            st.set_status(LinkStatus::Failed);
            return;
        }

        st.set_status(LinkStatus::Reconnecting);
        st.timer_seq += 1;
        let seq = st.timer_seq;
        let delay = st.backoff.delay;
        info!("MQTT: reconnecting in {} ms (attempt {})", delay.as_millis(), st.backoff.attempt);

        let weak = Arc::downgrade(self);
        st.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.reconnect_due(seq);
            }
        }));
    }

    fn reconnect_due(self: &Arc<Self>, seq: u64) {
        let notices = {
            let mut st = self.lock();
            if st.timer_seq != seq || st.reconnect_timer.is_none() {
                return;
            }
            // Detach rather than abort: this is the timer task itself.
            st.reconnect_timer = None;
            self.open_link(&mut st);
            st.take_notices()
        };
        notices.deliver();
    }
}

//! # main
//!
//! Rover UWB tag/anchor simulator entry point.
//!
//! Runs three concurrent pieces:
//!   1. Auto-send scheduler: pushes the current frame to Node-RED (HTTP) and
//!      the MQTT topic tree at a fixed interval
//!   2. Orbit loop: optionally moves the tag along a scripted circle
//!   3. WebSocket server: control channel for anchors, tag, noise,
//!      auto-send and transport settings, plus a state stream for panels
//!
//! ## Invariants
//! - All scene state lives in one `SimState` behind one mutex, never held
//!   across an await
//! - The scheduler runs iff auto-send is enabled with a positive interval
//! - Invalid control messages are logged and dropped; state is untouched

mod commands;
mod noise;
mod scheduler;
mod sim_state;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use clap::Parser;
use rover_link::{
    FrameSender, HttpClient, MqttPublisher, PublisherConfig, ReqwestTransport, RetryPolicy, SendMode,
};
use rover_types::PointMM;
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval, Instant};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use commands::{parse_command, MqttSettings, SimCommand};
use noise::should_auto_send;
use scheduler::AutoSendScheduler;
use sim_state::{Effect, OrbitSettings, SimState};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "rover-sim", about = "Rover UWB tag/anchor ranging simulator")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Control panel WebSocket port
    #[arg(long)]
    ctrl_port: Option<u16>,
    /// Node-RED HTTP endpoint receiving frames
    #[arg(long)]
    http_url: Option<String>,
    /// MQTT broker URL (ws://, wss://, mqtt://, mqtts://)
    #[arg(long)]
    mqtt_url: Option<String>,
    #[arg(long)]
    topic_prefix: Option<String>,
    /// Start with auto-send enabled
    #[arg(long)]
    auto_send: bool,
    #[arg(long)]
    interval_ms: Option<u64>,
    /// Ranging noise standard deviation, millimetres
    #[arg(long)]
    sigma_mm: Option<f64>,
    /// Move the tag along a circle around the rover
    #[arg(long)]
    orbit: bool,
    /// Reject scene and settings edits from the control channel
    #[arg(long)]
    read_only: bool,
}

// ── Config structs ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FullConfig {
    simulation: SimulationSection,
    tag: TagSection,
    noise: NoiseSection,
    auto_send: AutoSendSection,
    http: HttpSection,
    mqtt: MqttSection,
    orbit: OrbitSection,
}

#[derive(Debug, Deserialize)]
struct SimulationSection {
    ctrl_port: u16,
    tick_hz: f64,
    snap_to_grid: bool,
    read_only: bool,
}

#[derive(Debug, Deserialize)]
struct TagSection {
    x_mm: f64,
    y_mm: f64,
}

#[derive(Debug, Deserialize)]
struct NoiseSection {
    sigma_mm: f64,
}

#[derive(Debug, Deserialize)]
struct AutoSendSection {
    enabled: bool,
    interval_ms: u64,
}

#[derive(Debug, Deserialize)]
struct HttpSection {
    url: String,
    timeout_ms: u64,
    retry_count: u32,
    retry_delay_ms: u64,
}

#[derive(Debug, Deserialize)]
struct MqttSection {
    broker_url: String,
    topic_prefix: String,
    retain: bool,
}

#[derive(Debug, Deserialize)]
struct OrbitSection {
    enabled: bool,
    radius_mm: f64,
    period_s: f64,
}

// ── Shared state ──────────────────────────────────────────────────────────────

type Sender = FrameSender<ReqwestTransport, MqttPublisher>;

/// Settings the current publisher was built from
struct MqttLeg {
    broker_url: String,
    retain: bool,
    listener: Option<u64>,
}

impl MqttLeg {
    fn connect(&self) -> Option<MqttPublisher> {
        let url = self.broker_url.trim();
        if url.is_empty() {
            return None;
        }
        let mut config = PublisherConfig::new(url);
        config.retain = self.retain;
        match MqttPublisher::connect(&config) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("MQTT: publisher disabled: {e}");
                None
            }
        }
    }
}

struct Simulator {
    state: Mutex<SimState>,
    sender: Sender,
    mqtt: Mutex<MqttLeg>,
    scheduler: Mutex<AutoSendScheduler>,
    /// Serialized state snapshots and send reports for control clients
    updates: broadcast::Sender<String>,
}

impl Simulator {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn send(&self, mode: SendMode) {
        let frame = self.state().frame();
        let outcome = self.sender.send(&frame, mode).await;
        if outcome.http.is_none() && outcome.mqtt.is_none() {
            debug!("Send: no transport attempted");
            return;
        }
        let report = serde_json::json!({
            "type": "sendStatus",
            "counted": outcome.counted,
            "status": self.sender.status(),
            "sendCounter": self.sender.send_counter(),
            "lastSentAt": self.sender.last_sent_at(),
        });
        let _ = self.updates.send(report.to_string());
    }

    fn mqtt(&self) -> MutexGuard<'_, MqttLeg> {
        self.mqtt.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transport_report(&self) -> String {
        let retry = self.sender.retry_policy();
        let (broker_url, retain) = {
            let leg = self.mqtt();
            (leg.broker_url.clone(), leg.retain)
        };
        serde_json::json!({
            "type": "transport",
            "http": {
                "url": self.sender.http_target().unwrap_or_default(),
                "timeoutMs": retry.timeout.as_millis() as u64,
                "retryCount": retry.retry_count,
                "retryDelayMs": retry.retry_delay.as_millis() as u64,
            },
            "mqtt": {
                "brokerUrl": broker_url,
                "topicPrefix": self.sender.topic_prefix(),
                "retain": retain,
            },
            "status": self.sender.status(),
        })
        .to_string()
    }

    /// Mirror the current publisher's connection status into the send status.
    fn watch_publisher(self: &Arc<Self>) -> Option<u64> {
        let publisher = self.sender.publisher()?;
        let weak = Arc::downgrade(self);
        Some(publisher.add_status_listener(move |status| {
            if let Some(sim) = weak.upgrade() {
                sim.sender.set_mqtt_status(status.clone());
            }
        }))
    }

    fn reconnect_publisher(self: &Arc<Self>, settings: &MqttSettings) {
        let mut leg = self.mqtt();
        if let Some(url) = &settings.broker_url {
            leg.broker_url = url.clone();
        }
        if let Some(retain) = settings.retain {
            leg.retain = retain;
        }
        if let Some(old) = self.sender.replace_publisher(leg.connect()) {
            if let Some(id) = leg.listener.take() {
                old.remove_status_listener(id);
            }
            old.disconnect();
        }
        leg.listener = self.watch_publisher();
        info!(
            "MQTT: publisher {} (retain={})",
            if leg.broker_url.is_empty() { "off" } else { leg.broker_url.as_str() },
            leg.retain
        );
    }

    fn apply_transport(self: &Arc<Self>, command: &SimCommand) {
        match command {
            SimCommand::SetHttpSettings(settings) => {
                if let Some(url) = &settings.url {
                    self.sender.set_http_target(Some(url.clone()));
                    info!("HTTP: frames go to {}", if url.is_empty() { "off" } else { url.as_str() });
                }
                if settings.touches_retry() {
                    self.sender.set_retry_policy(settings.merge_into(self.sender.retry_policy()));
                }
            }
            SimCommand::SetMqttSettings(settings) => {
                if let Some(prefix) = &settings.topic_prefix {
                    self.sender.set_topic_prefix(prefix.clone());
                }
                if settings.needs_reconnect() {
                    self.reconnect_publisher(settings);
                }
            }
            _ => {}
        }
        let _ = self.updates.send(self.transport_report());
    }

    fn broadcast_state(&self) {
        let snapshot = self.state().snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(text) => {
                let _ = self.updates.send(text);
            }
            Err(e) => warn!("Snapshot encoding failed: {e}"),
        }
    }

    /// Start, retune or stop the scheduler to match the auto-send settings.
    fn sync_scheduler(&self) {
        let (enabled, interval_ms) = {
            let s = self.state();
            (s.auto_send_enabled, s.auto_send_interval_ms)
        };
        let mut scheduler = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
        if !should_auto_send(enabled, interval_ms as f64) {
            if scheduler.is_running() {
                scheduler.stop();
                info!("⏸ Auto-send stopped");
            }
            return;
        }
        let interval = Duration::from_millis(interval_ms);
        if !scheduler.is_running() {
            scheduler.start(Some(interval));
            info!("▶ Auto-send every {interval_ms} ms");
        } else if scheduler.interval() != interval {
            scheduler.update_interval(interval);
            info!("⚡ Auto-send interval set to {interval_ms} ms");
        }
    }

    fn handle_command(self: &Arc<Self>, raw: &str) {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!("Control: ignoring non-JSON message: {e}");
                return;
            }
        };
        let command = match parse_command(&value) {
            Ok(c) => c,
            Err(e) => {
                warn!("Control: rejected message: {e}");
                return;
            }
        };
        let applied = self.state().apply(&command, &mut rand::thread_rng());
        match applied {
            Ok(Effect::SceneChanged) => self.broadcast_state(),
            Ok(Effect::AutoSendChanged) => {
                self.sync_scheduler();
                self.broadcast_state();
            }
            Ok(Effect::SendNow) => {
                let sim = self.clone();
                tokio::spawn(async move { sim.send(SendMode::Manual).await });
            }
            Ok(Effect::TransportChanged) => self.apply_transport(&command),
            Err(e) => warn!("Control: {e}"),
        }
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rover_sim=info,rover_link=info".into()),
        )
        .init();

    let args = Args::parse();

    // Load config
    let config_str = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../config.toml").to_string());
    let cfg: FullConfig = toml::from_str(&config_str).context("invalid config.toml")?;

    let state = initial_state(&args, &cfg);
    let http_url = args.http_url.clone().unwrap_or_else(|| cfg.http.url.clone());
    let broker_url = args.mqtt_url.clone().unwrap_or_else(|| cfg.mqtt.broker_url.clone());
    let topic_prefix = args.topic_prefix.clone().unwrap_or_else(|| cfg.mqtt.topic_prefix.clone());

    info!(
        "🛰  Rover simulator starting: http={} mqtt={} prefix={topic_prefix}",
        if http_url.is_empty() { "off" } else { &http_url },
        if broker_url.is_empty() { "off" } else { &broker_url },
    );

    let mqtt = MqttLeg { broker_url, retain: cfg.mqtt.retain, listener: None };
    let publisher = mqtt.connect();

    let retry = RetryPolicy {
        timeout: Duration::from_millis(cfg.http.timeout_ms),
        retry_count: cfg.http.retry_count,
        retry_delay: Duration::from_millis(cfg.http.retry_delay_ms),
    };
    let sender = FrameSender::new(
        HttpClient::new(ReqwestTransport::new(), retry),
        Some(http_url),
        publisher,
        topic_prefix,
    );

    let (updates, _) = broadcast::channel::<String>(64);
    let interval = Duration::from_millis(state.auto_send_interval_ms);
    let sim = Arc::new_cyclic(|weak: &Weak<Simulator>| {
        let weak = weak.clone();
        let scheduler = AutoSendScheduler::new(interval, move || {
            if let Some(sim) = weak.upgrade() {
                tokio::spawn(async move { sim.send(SendMode::Auto).await });
            }
        });
        Simulator {
            state: Mutex::new(state),
            sender,
            mqtt: Mutex::new(mqtt),
            scheduler: Mutex::new(scheduler),
            updates,
        }
    });

    let listener = sim.watch_publisher();
    sim.mqtt().listener = listener;

    sim.sync_scheduler();

    let tick_hz = cfg.simulation.tick_hz;
    if sim.state().orbit.enabled {
        tokio::spawn(orbit_loop(sim.clone(), tick_hz));
    }

    // Control WebSocket server
    let ctrl_port = args.ctrl_port.unwrap_or(cfg.simulation.ctrl_port);
    let ctrl_addr = format!("0.0.0.0:{ctrl_port}");
    info!("🖥  Control channel at ws://{ctrl_addr}/ws");

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "rover-sim ok" }))
        .with_state(sim.clone())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let listener = tokio::net::TcpListener::bind(&ctrl_addr)
        .await
        .with_context(|| format!("cannot bind {ctrl_addr}"))?;
    axum::serve(listener, app).await.context("control server failed")?;
    Ok(())
}

fn initial_state(args: &Args, cfg: &FullConfig) -> SimState {
    let mut state = SimState {
        snap_to_grid: cfg.simulation.snap_to_grid,
        read_only: args.read_only || cfg.simulation.read_only,
        auto_send_enabled: args.auto_send || cfg.auto_send.enabled,
        orbit: OrbitSettings {
            enabled: args.orbit || cfg.orbit.enabled,
            radius_mm: cfg.orbit.radius_mm,
            period_s: cfg.orbit.period_s,
        },
        ..SimState::default()
    };
    let mut rng = rand::thread_rng();
    state.set_auto_send_interval(args.interval_ms.unwrap_or(cfg.auto_send.interval_ms) as f64);
    state.set_tag(PointMM::new(cfg.tag.x_mm, cfg.tag.y_mm), &mut rng);
    state.set_noise_sigma(args.sigma_mm.unwrap_or(cfg.noise.sigma_mm), &mut rng);
    state
}

// ── Orbit loop ────────────────────────────────────────────────────────────────

async fn orbit_loop(sim: Arc<Simulator>, tick_hz: f64) {
    let period_ms = (1000.0 / tick_hz.max(0.1)) as u64;
    let mut ticker = interval(Duration::from_millis(period_ms.max(1)));
    let started = Instant::now();
    info!("🔄 Orbit loop running at {tick_hz} Hz");

    loop {
        ticker.tick().await;
        let moved = sim.state().advance_orbit(started.elapsed().as_secs_f64(), &mut rand::thread_rng());
        if moved {
            sim.broadcast_state();
        }
    }
}

// ── WebSocket control handler ─────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(sim): State<Arc<Simulator>>) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, sim))
}

async fn handle_ws(mut socket: WebSocket, sim: Arc<Simulator>) {
    let mut updates = sim.updates.subscribe();

    // Send current state and transport settings immediately on connect
    let snapshot = serde_json::to_string(&sim.state().snapshot());
    if let Ok(text) = snapshot {
        if socket.send(Message::Text(text)).await.is_err() {
            return;
        }
    }
    if socket.send(Message::Text(sim.transport_report())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            // Relay state and send reports to the client
            update = updates.recv() => match update {
                Ok(msg) => {
                    if socket.send(Message::Text(msg)).await.is_err() { break; }
                }
                Err(RecvError::Lagged(skipped)) => debug!("Control: client lagged, {skipped} updates dropped"),
                Err(RecvError::Closed) => break,
            },
            // Handle commands from the panel
            incoming = socket.recv() => match Inbound::from(incoming) {
                Inbound::Command(cmd) => sim.handle_command(&cmd),
                Inbound::Ignore => {}
                Inbound::Disconnect => break,
            },
        }
    }
    debug!("Control: client disconnected");
}

#[derive(Debug, PartialEq)]
enum Inbound {
    Command(String),
    Ignore,
    Disconnect,
}

impl From<Option<Result<Message, axum::Error>>> for Inbound {
    fn from(incoming: Option<Result<Message, axum::Error>>) -> Self {
        match incoming {
            Some(Ok(Message::Text(cmd))) => Inbound::Command(cmd),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => Inbound::Disconnect,
            // Pings are answered by axum; binary frames are not part of the protocol
            Some(Ok(_)) => Inbound::Ignore,
        }
    }
}

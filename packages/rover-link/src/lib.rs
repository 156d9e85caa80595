//! # rover-link
//!
//! Telemetry transports for the Rover UWB suite.
//!
//! - Inbound: `TelemetrySubscriber` (MQTT, owned backoff) and `HttpPoller`
//!   (fixed interval, one-time https → http downgrade), combined by
//!   `TelemetryFeed` into a single latest-frame store
//! - Outbound: `FrameSender` fans a `SimulationFrame` out to an HTTP sink
//!   (retrying `HttpClient`) and an MQTT topic tree (`MqttPublisher`)
//!
//! Every I/O boundary is a trait (`PubSubConnector`, `TelemetryFetcher`,
//! `PostTransport`, `FramePublisher`) with one production implementation.

pub mod error;
pub mod feed;
pub mod frame_sender;
pub mod http_client;
pub mod mqtt;
pub mod poller;
pub mod subscriber;

pub use error::{LinkError, PollError, SendError};
pub use feed::{FeedConfig, TelemetryFeed};
pub use frame_sender::{build_topic, FrameSender, SendMode, SendOutcome};
pub use http_client::{HttpClient, PostTransport, ReqwestTransport, RetryPolicy};
pub use mqtt::{FramePublisher, MqttConnector, MqttPublisher, PublisherConfig};
pub use poller::{HttpPoller, ReqwestFetcher, TelemetryFetcher};
pub use subscriber::{BackoffPolicy, BackoffState, SubscriberConfig, TelemetrySubscriber};

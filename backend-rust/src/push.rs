//! # push
//!
//! Relays the operator `ControlState` to Node-RED.
//!
//! ## Behaviour
//! Single flight with coalescing: every accepted mutation marks the state
//! dirty and requests a push, but at most one push is in flight and at most
//! one timer is pending. Mutations that land while a push is running or
//! while the sink is cooling down collapse into one later push carrying the
//! latest state.
//!
//! ## Invariants
//! - `revision` only grows; a push clears `dirty` only if no mutation
//!   happened while it was in flight
//! - Pushes start at least `min_interval` apart (measured between starts)
//! - After a failure no push starts before `cooldown_until`
//! - The failure and cooldown logs fire once per failure episode; a
//!   successful push ends the episode

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use rover_types::ControlState;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::PushConfig;
use crate::control::ControlUpdate;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("push timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected status {0}")]
    Status(u16),
}

impl From<reqwest::Error> for PushError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PushError::Timeout
        } else if let Some(status) = e.status() {
            PushError::Status(status.as_u16())
        } else {
            PushError::Network(e.to_string())
        }
    }
}

/// Downstream receiver of control state
pub trait ControlSink: Send + Sync + 'static {
    fn push(&self, url: &str, state: &ControlState) -> impl Future<Output = Result<(), PushError>> + Send;
}

/// POSTs the state as JSON
#[derive(Debug, Clone, Default)]
pub struct ReqwestSink {
    client: reqwest::Client,
}

impl ReqwestSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ControlSink for ReqwestSink {
    async fn push(&self, url: &str, state: &ControlState) -> Result<(), PushError> {
        self.client.post(url).json(state).send().await?.error_for_status()?;
        Ok(())
    }
}

struct PushState {
    control: ControlState,
    dirty: bool,
    revision: u64,
    in_flight: bool,
    timer: Option<JoinHandle<()>>,
    last_push_started: Option<Instant>,
    cooldown_until: Option<Instant>,
    failure_logged: bool,
    cooldown_logged: bool,
    /// Failure episodes seen; each one logs once
    failure_episodes: u64,
    cooldown_notices: u64,
}

pub struct PushCoordinator<S: ControlSink> {
    sink: S,
    target: Option<String>,
    config: PushConfig,
    state: Mutex<PushState>,
    this: Weak<Self>,
}

impl<S: ControlSink> PushCoordinator<S> {
    /// `target` of `None` keeps state local; nothing is ever pushed.
    pub fn new(sink: S, target: Option<String>, config: PushConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            sink,
            target,
            config,
            state: Mutex::new(PushState {
                control: ControlState::default(),
                dirty: false,
                revision: 0,
                in_flight: false,
                timer: None,
                last_push_started: None,
                cooldown_until: None,
                failure_logged: false,
                cooldown_logged: false,
                failure_episodes: 0,
                cooldown_notices: 0,
            }),
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PushState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn control(&self) -> ControlState {
        self.lock().control.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    #[cfg(test)]
    fn logged_episodes(&self) -> (u64, u64) {
        let st = self.lock();
        (st.failure_episodes, st.cooldown_notices)
    }

    /// Apply a validated update and request a push. Returns the new state.
    pub fn update(&self, update: ControlUpdate) -> ControlState {
        let control = {
            let mut st = self.lock();
            update.apply(&mut st.control, "api");
            st.dirty = true;
            st.revision += 1;
            st.control.clone()
        };
        self.schedule_push();
        control
    }

    pub fn schedule_push(&self) {
        if self.target.is_none() {
            return;
        }
        let mut st = self.lock();
        if !st.dirty || st.timer.is_some() || st.in_flight {
            // An in-flight push re-arms on completion.
            return;
        }

        let now = Instant::now();
        let deadline = match st.cooldown_until {
            Some(until) if until > now => {
                if !st.cooldown_logged {
                    st.cooldown_logged = true;
                    st.cooldown_notices += 1;
                    info!("Push: cooling down, next attempt in {} ms", (until - now).as_millis());
                }
                until
            }
            _ => match st.last_push_started {
                Some(started) => (started + self.config.min_interval).max(now),
                None => now,
            },
        };

        let weak = self.this.clone();
        st.timer = Some(tokio::spawn(async move {
            sleep_until(deadline).await;
            let Some(this) = weak.upgrade() else { return };
            this.lock().timer = None;
            this.post_to_sink().await;
        }));
    }

    async fn post_to_sink(&self) {
        let Some(url) = self.target.as_deref() else { return };
        let (revision, payload) = {
            let mut st = self.lock();
            if st.in_flight || !st.dirty {
                return;
            }
            st.in_flight = true;
            st.last_push_started = Some(Instant::now());
            (st.revision, st.control.clone())
        };

        debug!("Push: sending revision {revision}");
        let result = match timeout(self.config.timeout, self.sink.push(url, &payload)).await {
            Ok(r) => r,
            Err(_) => Err(PushError::Timeout),
        };

        let again = {
            let mut st = self.lock();
            st.in_flight = false;
            match result {
                Ok(()) => {
                    if st.revision == revision {
                        st.dirty = false;
                    }
                    st.cooldown_until = None;
                    if st.failure_logged {
                        info!("✅ Push: Node-RED reachable again");
                    }
                    st.failure_logged = false;
                    st.cooldown_logged = false;
                }
                Err(e) => {
                    st.dirty = true;
                    st.cooldown_until = Some(Instant::now() + self.config.cooldown);
                    if !st.failure_logged {
                        st.failure_logged = true;
                        st.failure_episodes += 1;
                        warn!("Push: Node-RED push failed: {e}");
                    }
                }
            }
            st.dirty
        };

        if again {
            self.schedule_push();
        }
    }
}

impl<S: ControlSink> Drop for PushCoordinator<S> {
    fn drop(&mut self) {
        if let Some(timer) = self.lock().timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rover_types::Stick;
    use std::collections::VecDeque;
    use tokio::time::sleep;

    /// Replays scripted results after an optional delay; records payloads
    #[derive(Default)]
    struct ScriptedSink {
        results: Mutex<VecDeque<Result<(), PushError>>>,
        delay: Duration,
        pushed: Mutex<Vec<ControlState>>,
    }

    impl ScriptedSink {
        fn new(delay_ms: u64, results: Vec<Result<(), PushError>>) -> Arc<Self> {
            Arc::new(Self { results: Mutex::new(results.into()), delay: Duration::from_millis(delay_ms), ..Default::default() })
        }

        fn calls(&self) -> usize {
            self.pushed.lock().unwrap().len()
        }
    }

    impl ControlSink for Arc<ScriptedSink> {
        async fn push(&self, _url: &str, state: &ControlState) -> Result<(), PushError> {
            self.pushed.lock().unwrap().push(state.clone());
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn config() -> PushConfig {
        PushConfig {
            min_interval: Duration::from_millis(100),
            cooldown: Duration::from_millis(5000),
            timeout: Duration::from_millis(2000),
        }
    }

    fn coordinator(sink: &Arc<ScriptedSink>) -> Arc<PushCoordinator<Arc<ScriptedSink>>> {
        PushCoordinator::new(sink.clone(), Some("http://node-red/uwb/rover/control".into()), config())
    }

    fn stick(x: f64) -> ControlUpdate {
        ControlUpdate { mode: None, stick: Some(Stick { x, y: 0.0 }) }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_during_flight_coalesces_into_one_push() {
        let sink = ScriptedSink::new(50, vec![]);
        let push = coordinator(&sink);

        push.update(stick(0.1));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.calls(), 1);

        push.update(stick(0.2));
        push.update(stick(0.3));
        push.update(stick(0.4));
        sleep(Duration::from_millis(1000)).await;

        let pushed = sink.pushed.lock().unwrap().clone();
        assert_eq!(pushed.len(), 2);
        assert_eq!(pushed[1].stick.x, 0.4);
        assert!(!push.is_dirty());
        assert_eq!(push.revision(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn pushes_are_throttled_between_starts() {
        let sink = ScriptedSink::new(0, vec![]);
        let push = coordinator(&sink);

        push.update(stick(0.1));
        sleep(Duration::from_millis(30)).await;
        assert_eq!(sink.calls(), 1);

        push.update(stick(0.2));
        sleep(Duration::from_millis(60)).await;
        assert_eq!(sink.calls(), 1, "second push must wait for min interval");
        sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_defers_next_push_until_cooldown_expires() {
        let sink = ScriptedSink::new(0, vec![Err(PushError::Status(500))]);
        let push = coordinator(&sink);

        push.update(stick(0.1));
        sleep(Duration::from_millis(1000)).await;
        assert_eq!(sink.calls(), 1);
        assert!(push.is_dirty());

        // Updates inside the cooldown ride along with the deferred push.
        push.update(stick(0.7));
        sleep(Duration::from_millis(3990)).await;
        assert_eq!(sink.calls(), 1);

        sleep(Duration::from_millis(20)).await;
        let pushed = sink.pushed.lock().unwrap().clone();
        assert_eq!(pushed.len(), 2);
        assert_eq!(pushed[1].stick.x, 0.7);
        assert!(!push.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sink_counts_as_failure() {
        let sink = ScriptedSink::new(3000, vec![]);
        let push = coordinator(&sink);

        push.update(stick(0.1));
        sleep(Duration::from_millis(2100)).await;
        assert!(push.is_dirty());
        assert_eq!(sink.calls(), 1);

        // Cooldown opened at t=2000, so the retry starts at t=7000.
        sleep(Duration::from_millis(4800)).await;
        assert_eq!(sink.calls(), 1);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_logs_once_per_episode() {
        let fail = || -> Result<(), PushError> { Err(PushError::Network("connection refused".into())) };
        let sink = ScriptedSink::new(0, vec![fail(), fail(), fail(), Ok(()), fail()]);
        let push = coordinator(&sink);

        // Attempts at t=0, 5000 and 10000 all fail: one episode.
        push.update(stick(0.1));
        sleep(Duration::from_millis(14_000)).await;
        assert_eq!(sink.calls(), 3);
        assert_eq!(push.logged_episodes(), (1, 1));

        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(sink.calls(), 4);
        assert!(!push.is_dirty());

        // Success closed the episode, so the next failure logs again.
        push.update(stick(0.2));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.calls(), 5);
        assert_eq!(push.logged_episodes(), (2, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn no_target_keeps_state_local() {
        let sink = ScriptedSink::new(0, vec![]);
        let push = PushCoordinator::new(sink.clone(), None, config());

        let state = push.update(ControlUpdate { mode: Some("auto".into()), stick: None });
        assert_eq!(state.mode, "auto");
        sleep(Duration::from_millis(500)).await;
        assert_eq!(sink.calls(), 0);
        assert!(push.is_dirty());
    }
}

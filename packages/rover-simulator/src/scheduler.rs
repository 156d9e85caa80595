//! # scheduler
//!
//! Periodic auto-send timer.
//!
//! ## Invariants
//! - At most one timer task exists; `task.is_some()` ⇔ running
//! - After `stop()` returns the callback is not running and never fires again
//! - `update_interval` while running restarts the phase from "now"

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

type Callback = Arc<dyn Fn() + Send + Sync>;

pub struct AutoSendScheduler {
    interval: Duration,
    callback: Callback,
    task: Option<JoinHandle<()>>,
    /// Run gate, held across the check and the callback
    running: Arc<Mutex<bool>>,
}

impl AutoSendScheduler {
    pub fn new(interval: Duration, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            interval,
            callback: Arc::new(callback),
            task: None,
            running: Arc::new(Mutex::new(false)),
        }
    }

    /// No-op while already running (a new interval is only stored).
    pub fn start(&mut self, interval: Option<Duration>) {
        if let Some(interval) = interval {
            self.interval = interval;
        }
        if self.task.is_some() {
            return;
        }

        // Fresh gate per run: a stopped task never observes `true` again.
        let running = Arc::new(Mutex::new(true));
        self.running = running.clone();
        let callback = self.callback.clone();
        let period = self.interval;
        let first = Instant::now() + period;

        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let gate = running.lock().unwrap_or_else(PoisonError::into_inner);
                if !*gate {
                    break;
                }
                callback();
            }
        }));
    }

    /// Waits out a callback already in progress.
    pub fn stop(&mut self) {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = false;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn update_interval(&mut self, interval: Duration) {
        self.interval = interval;
        if self.task.is_some() {
            self.stop();
            self.start(None);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for AutoSendScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

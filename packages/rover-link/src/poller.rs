//! # poller
//!
//! Fixed-interval HTTP telemetry polling.
//!
//! Polls are strictly sequential: the interval is measured from the end of
//! one poll to the start of the next, so a slow upstream never stacks
//! requests.
//!
//! ## Invariants
//! - No data callback fires after `stop()`
//! - The https → http downgrade is attempted at most once per poller, and
//!   only for a network-level failure on an https URL
//! - A successful downgrade sticks for all later polls

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::header::CACHE_CONTROL;
use reqwest::Url;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::PollError;

pub trait TelemetryFetcher: Send + Sync + 'static {
    fn fetch(&self, url: &Url) -> impl Future<Output = Result<Value, PollError>> + Send;
}

/// GET with `Cache-Control: no-store`; any non-2xx is an error
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, PollError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PollError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

impl TelemetryFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &Url) -> Result<Value, PollError> {
        let response = self
            .client
            .get(url.clone())
            .header(CACHE_CONTROL, "no-store")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Status(status.as_u16()));
        }
        response.json::<Value>().await.map_err(|e| PollError::Decode(e.to_string()))
    }
}

type DataHandler = Arc<dyn Fn(Value) + Send + Sync>;

pub struct HttpPoller<F: TelemetryFetcher> {
    shared: Arc<PollerShared<F>>,
}

struct PollerShared<F> {
    fetcher: F,
    interval: Duration,
    on_data: DataHandler,
    url: Mutex<Url>,
    aborted: AtomicBool,
    downgrade_attempted: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<F: TelemetryFetcher> HttpPoller<F> {
    pub fn new(fetcher: F, url: Url, interval: Duration, on_data: impl Fn(Value) + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(PollerShared {
                fetcher,
                interval,
                on_data: Arc::new(on_data),
                url: Mutex::new(url),
                aborted: AtomicBool::new(false),
                downgrade_attempted: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    /// First poll runs immediately. Restarting replaces the running loop.
    pub fn start(&self) {
        let mut task = self.shared.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = task.take() {
            previous.abort();
        }
        self.shared.aborted.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                shared.poll_once().await;
                if shared.aborted.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(shared.interval).await;
                if shared.aborted.load(Ordering::SeqCst) {
                    break;
                }
            }
        }));
    }

    pub fn stop(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
        let handle = self.shared.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// URL used by the next poll (reflects a completed downgrade)
    pub fn current_url(&self) -> Url {
        self.shared.current_url()
    }
}

impl<F: TelemetryFetcher> Drop for HttpPoller<F> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<F: TelemetryFetcher> PollerShared<F> {
    fn current_url(&self) -> Url {
        self.url.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn poll_once(&self) {
        let url = self.current_url();
        let err = match self.fetcher.fetch(&url).await {
            Ok(body) => return self.deliver(body),
            Err(err) => err,
        };

        let first_failure = !self.downgrade_attempted.swap(true, Ordering::SeqCst);
        if first_failure && err.is_network() && url.scheme() == "https" {
            if let Some(insecure) = insecure_variant(&url) {
                warn!("Poll: {url} unreachable ({err}), retrying over {insecure}");
                match self.fetcher.fetch(&insecure).await {
                    Ok(body) => {
                        info!("Poll: switched to {insecure}");
                        *self.url.lock().unwrap_or_else(PoisonError::into_inner) = insecure;
                        self.deliver(body);
                    }
                    Err(e) => warn!("Poll: fallback to {insecure} failed: {e}"),
                }
                return;
            }
        }
        warn!("Poll: {url} failed: {err}");
    }

    fn deliver(&self, body: Value) {
        if !self.aborted.load(Ordering::SeqCst) {
            (self.on_data)(body);
        }
    }
}

fn insecure_variant(url: &Url) -> Option<Url> {
    let mut insecure = url.clone();
    insecure.set_scheme("http").ok()?;
    Some(insecure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::time::sleep;

    #[derive(Default)]
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<Value, PollError>>>,
        calls: Mutex<Vec<String>>,
        latency: Duration,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<Value, PollError>>) -> Self {
            Self { script: Mutex::new(script.into()), ..Default::default() }
        }
    }

    impl TelemetryFetcher for Arc<ScriptedFetcher> {
        async fn fetch(&self, url: &Url) -> Result<Value, PollError> {
            self.calls.lock().unwrap().push(url.to_string());
            if !self.latency.is_zero() {
                sleep(self.latency).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(PollError::Status(500)))
        }
    }

    fn network() -> Result<Value, PollError> {
        Err(PollError::Network("connection refused".into()))
    }

    fn poller(fetcher: &Arc<ScriptedFetcher>, url: &str, interval_ms: u64) -> (HttpPoller<Arc<ScriptedFetcher>>, Arc<Mutex<Vec<Value>>>) {
        let data = Arc::new(Mutex::new(Vec::new()));
        let sink = data.clone();
        let poller = HttpPoller::new(
            fetcher.clone(),
            Url::parse(url).unwrap(),
            Duration::from_millis(interval_ms),
            move |v| sink.lock().unwrap().push(v),
        );
        (poller, data)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn https_network_failure_downgrades_to_http() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![network(), Ok(json!({ "n": 1 })), Ok(json!({ "n": 2 }))]));
        let (poller, data) = poller(&fetcher, "https://169.254.75.59:1880/uwb/rover/telemetry", 1000);

        poller.start();
        settle().await;
        assert_eq!(
            *fetcher.calls.lock().unwrap(),
            vec![
                "https://169.254.75.59:1880/uwb/rover/telemetry".to_string(),
                "http://169.254.75.59:1880/uwb/rover/telemetry".to_string(),
            ]
        );
        assert_eq!(*data.lock().unwrap(), vec![json!({ "n": 1 })]);
        assert_eq!(poller.current_url().scheme(), "http");

        sleep(Duration::from_millis(1001)).await;
        let calls = fetcher.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls[2].starts_with("http://"));
        assert_eq!(data.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn downgrade_is_only_tried_once() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![network(), network(), network(), network()]));
        let (poller, data) = poller(&fetcher, "https://node-red.local/telemetry", 500);

        poller.start();
        settle().await;
        sleep(Duration::from_millis(501)).await;

        let calls = fetcher.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("https://"));
        assert!(calls[1].starts_with("http://"));
        assert!(calls[2].starts_with("https://"));
        assert!(data.lock().unwrap().is_empty());
        assert_eq!(poller.current_url().scheme(), "https");
    }

    #[tokio::test(start_paused = true)]
    async fn status_errors_never_downgrade() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Err(PollError::Status(502)), network()]));
        let (poller, _data) = poller(&fetcher, "https://node-red.local/telemetry", 500);

        poller.start();
        settle().await;
        sleep(Duration::from_millis(501)).await;

        // The first failure consumed the one-shot downgrade.
        let calls = fetcher.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.starts_with("https://")));
    }

    #[tokio::test(start_paused = true)]
    async fn polls_are_sequential() {
        let fetcher = Arc::new(ScriptedFetcher {
            latency: Duration::from_millis(300),
            ..ScriptedFetcher::new(vec![Ok(json!(1)), Ok(json!(2)), Ok(json!(3))])
        });
        let (poller, data) = poller(&fetcher, "http://node-red.local/telemetry", 1000);

        poller.start();
        // Polls start at 0, 1300 and 2600.
        sleep(Duration::from_millis(2500)).await;
        assert_eq!(fetcher.calls.lock().unwrap().len(), 2);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(fetcher.calls.lock().unwrap().len(), 3);
        sleep(Duration::from_millis(300)).await;
        assert_eq!(data.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_polling_and_drops_in_flight_result() {
        let fetcher = Arc::new(ScriptedFetcher {
            latency: Duration::from_millis(100),
            ..ScriptedFetcher::new(vec![Ok(json!(1)), Ok(json!(2))])
        });
        let (poller, data) = poller(&fetcher, "http://node-red.local/telemetry", 250);

        poller.start();
        settle().await;
        poller.stop();
        sleep(Duration::from_secs(5)).await;

        assert_eq!(fetcher.calls.lock().unwrap().len(), 1);
        assert!(data.lock().unwrap().is_empty());
    }
}

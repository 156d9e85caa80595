//! # http_client
//!
//! JSON POST with per-attempt timeout and jittered retries.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tracing::debug;

use crate::error::SendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deadline for each individual attempt
    pub timeout: Duration,
    /// Extra attempts after the first
    pub retry_count: u32,
    /// Base delay between attempts, jittered to 75–125%
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            retry_count: 2,
            retry_delay: Duration::from_millis(500),
        }
    }
}

pub trait PostTransport: Send + Sync + 'static {
    fn post_json(&self, url: &str, body: Vec<u8>, timeout: Duration) -> impl Future<Output = Result<(), SendError>> + Send;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PostTransport for ReqwestTransport {
    async fn post_json(&self, url: &str, body: Vec<u8>, timeout: Duration) -> Result<(), SendError> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SendError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
            })
        }
    }
}

pub struct HttpClient<T: PostTransport = ReqwestTransport> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: PostTransport> HttpClient<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Up to `retry_count + 1` attempts. Returns the last error once exhausted.
    pub async fn post_with<B: Serialize + ?Sized>(
        &self,
        policy: RetryPolicy,
        url: &str,
        payload: &B,
    ) -> Result<(), SendError> {
        let body = serde_json::to_vec(payload).map_err(|e| SendError::Encode(e.to_string()))?;
        let attempts = policy.retry_count + 1;
        let mut attempt = 1;
        loop {
            match self.transport.post_json(url, body.clone(), policy.timeout).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    let jitter: f64 = rand::thread_rng().gen_range(0.75..1.25);
                    let delay = policy.retry_delay.mul_f64(jitter);
                    debug!("HTTP: attempt {attempt}/{attempts} to {url} failed ({err}), retrying in {} ms", delay.as_millis());
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fails the first `failures` calls, then succeeds
    struct FlakyTransport {
        failures: u32,
        calls: AtomicU32,
        bodies: Mutex<Vec<Vec<u8>>>,
    }

    impl FlakyTransport {
        fn new(failures: u32) -> Self {
            Self { failures, calls: AtomicU32::new(0), bodies: Mutex::new(Vec::new()) }
        }
    }

    impl PostTransport for FlakyTransport {
        async fn post_json(&self, _url: &str, body: Vec<u8>, _timeout: Duration) -> Result<(), SendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.bodies.lock().unwrap().push(body);
            if n < self.failures {
                Err(SendError::Network("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let client = HttpClient::new(FlakyTransport::new(2), RetryPolicy::default());
        client.post_with(client.policy(), "http://sink/frame", &serde_json::json!({ "x": 1 })).await.unwrap();
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 3);
        let bodies = client.transport.bodies.lock().unwrap();
        assert!(bodies.iter().all(|b| b.as_slice() == br#"{"x":1}"#));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retry_budget() {
        let policy = RetryPolicy { retry_count: 1, ..RetryPolicy::default() };
        let client = HttpClient::new(FlakyTransport::new(10), policy);
        let err = client.post_with(client.policy(), "http://sink/frame", &1).await.unwrap_err();
        assert_eq!(err, SendError::Network("connection refused".into()));
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_delay_is_jittered_within_bounds() {
        let policy = RetryPolicy { retry_count: 1, retry_delay: Duration::from_millis(1000), ..RetryPolicy::default() };
        let client = HttpClient::new(FlakyTransport::new(1), policy);
        let started = tokio::time::Instant::now();
        client.post_with(client.policy(), "http://sink/frame", &1).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(750), "{waited:?}");
        assert!(waited <= Duration::from_millis(1251), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_means_single_attempt() {
        let policy = RetryPolicy { retry_count: 0, ..RetryPolicy::default() };
        let client = HttpClient::new(FlakyTransport::new(1), policy);
        assert!(client.post_with(client.policy(), "http://sink/frame", &1).await.is_err());
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 1);
    }
}

//! Snapshot fetch and push-channel transport for the live match feed.
//!
//! [`HttpSnapshotClient`] serves the request/response side (full snapshot,
//! live-only snapshot, odds refresh) with retry and capped exponential
//! backoff. [`push`] holds the persistent update channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

pub mod push;

pub use push::{parse_push_frames, PushConfig, PushHub, PushListener, PushTransport};

pub const CRATE_NAME: &str = "matchfeed-transport";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable response body from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("push channel failure: {0}")]
    Channel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Which snapshot endpoint to hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotScope {
    All,
    LiveOnly,
}

/// Request/response side of the feed. Implemented over HTTP here and by
/// in-memory fakes in tests.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Raw snapshot body; ingestion happens at the caller.
    async fn fetch_snapshot(&self, scope: SnapshotScope) -> Result<JsonValue, TransportError>;

    /// Ask upstream to recompute odds before the next snapshot.
    async fn refresh_odds(&self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct SnapshotClientConfig {
    pub base_url: String,
    pub all_path: String,
    pub live_path: String,
    pub refresh_odds_path: String,
    /// `None` leaves requests unbounded.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for SnapshotClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            all_path: "/matches".to_string(),
            live_path: "/matches/live".to_string(),
            refresh_odds_path: "/odds/refresh".to_string(),
            timeout: None,
            user_agent: None,
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl SnapshotClientConfig {
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug)]
pub struct HttpSnapshotClient {
    client: reqwest::Client,
    config: SnapshotClientConfig,
    global_limit: Arc<Semaphore>,
}

pub(crate) fn build_http_client(
    timeout: Option<Duration>,
    user_agent: Option<&str>,
) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(user_agent) = user_agent {
        builder = builder.user_agent(user_agent.to_string());
    }
    builder.build().context("building reqwest client")
}

impl HttpSnapshotClient {
    pub fn new(config: SnapshotClientConfig) -> anyhow::Result<Self> {
        let client = build_http_client(config.timeout, config.user_agent.as_deref())?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            config,
        })
    }

    pub fn config(&self) -> &SnapshotClientConfig {
        &self.config
    }

    async fn execute(&self, method: Method, url: &str) -> Result<Vec<u8>, TransportError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| TransportError::Channel("snapshot limiter closed".to_string()))?;

        let span = info_span!("snapshot_http", %method, url);
        self.execute_with_retry(method, url).instrument(span).await
    }

    async fn execute_with_retry(
        &self,
        method: Method,
        url: &str,
    ) -> Result<Vec<u8>, TransportError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.config.backoff.max_retries;
            match self.client.request(method.clone(), url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(%status, attempt, "retrying snapshot request");
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(TransportError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %err, attempt, "retrying snapshot request");
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(TransportError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotClient {
    async fn fetch_snapshot(&self, scope: SnapshotScope) -> Result<JsonValue, TransportError> {
        let path = match scope {
            SnapshotScope::All => &self.config.all_path,
            SnapshotScope::LiveOnly => &self.config.live_path,
        };
        let url = self.config.url_for(path);
        let body = self.execute(Method::GET, &url).await?;
        serde_json::from_slice(&body).map_err(|e| TransportError::Decode {
            url,
            message: e.to_string(),
        })
    }

    async fn refresh_odds(&self) -> Result<(), TransportError> {
        let url = self.config.url_for(&self.config.refresh_odds_path);
        self.execute(Method::POST, &url).await.map(|_| ())
    }
}

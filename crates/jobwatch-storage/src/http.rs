//! Polite HTTP fetching for listing and detail pages.
//!
//! Every request goes through a per-source gate that caps concurrency and keeps
//! a minimum interval between consecutive requests to the same source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Exponential retry delays for throttled or failing requests.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// 429 and 5xx are worth another attempt; other statuses are final.
pub fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_language: String,
    pub max_concurrent_per_source: usize,
    /// Minimum spacing between two requests to the same source.
    pub min_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            accept_language: "da-DK,da;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
            max_concurrent_per_source: 1,
            min_interval: Duration::ZERO,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
struct SourceGate {
    permits: Semaphore,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl SourceGate {
    fn new(max_concurrent: usize, min_interval: Duration) -> Self {
        Self {
            permits: Semaphore::new(max_concurrent.max(1)),
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// Waits out the remainder of the interval since the previous request.
    async fn space(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

/// HTTP client shared by every page fetch of a run.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_concurrent_per_source: usize,
    min_interval: Duration,
    retry: RetryPolicy,
    gates: Mutex<HashMap<String, Arc<SourceGate>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&config.accept_language).context("invalid Accept-Language")?,
        );

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            max_concurrent_per_source: config.max_concurrent_per_source,
            min_interval: config.min_interval,
            retry: config.retry,
            gates: Mutex::new(HashMap::new()),
        })
    }

    async fn gate(&self, source_id: &str) -> Arc<SourceGate> {
        let mut gates = self.gates.lock().await;
        gates
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(SourceGate::new(self.max_concurrent_per_source, self.min_interval)))
            .clone()
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let gate = self.gate(source_id).await;
        let _permit = gate.permits.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(&gate, url).instrument(span).await
    }

    async fn fetch_with_retries(&self, gate: &SourceGate, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            gate.space().await;
            let retry_reason = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if !retryable_status(status) || attempt >= self.retry.max_retries {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    status.to_string()
                }
                Err(err) => {
                    if !retryable_error(&err) || attempt >= self.retry.max_retries {
                        return Err(FetchError::Request(err));
                    }
                    err.to_string()
                }
            };
            debug!(attempt, reason = %retry_reason, "retrying fetch");
            tokio::time::sleep(self.retry.delay(attempt)).await;
            attempt += 1;
        }
    }
}

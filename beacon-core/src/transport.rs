//! HTTP transport to the ingestion endpoint
//!
//! One flush attempt is one [`SignedBatch`]: the encoded body plus the
//! signature and timestamp computed over it. [`Transport::send`] POSTs it and
//! retries failures with exponential backoff, reusing the same body, signature
//! and timestamp on every retry.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

use crate::config::TrackerConfig;
use crate::error::{Error, Result};

/// Header carrying the hex HMAC-SHA-256 of the body
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Header carrying the signing time in unix seconds
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";

/// Header carrying the project id
pub const PROJECT_HEADER: &str = "X-Project-Id";

/// Retry delay schedule: `delay(n) = min(base * 2^n, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
        }
    }
}

impl Backoff {
    /// Delay before retry number `n` (0-based)
    pub fn delay(&self, n: u32) -> Duration {
        let factor = 2u32.checked_pow(n).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// A batch ready to go on the wire
#[derive(Debug, Clone)]
pub struct SignedBatch {
    /// Exact JSON body, `{"events": [...]}`
    pub body: String,
    /// Hex HMAC-SHA-256 of `body`
    pub signature: String,
    /// Unix seconds at signing time
    pub timestamp: i64,
    /// Number of events in `body`
    pub len: usize,
}

/// HTTP client for the ingestion endpoint
#[derive(Clone)]
pub struct Transport {
    http_client: reqwest::Client,
    endpoint: reqwest::Url,
    max_retries: usize,
    backoff: Backoff,
}

impl Transport {
    /// Create a transport from a validated tracker configuration
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        let endpoint = reqwest::Url::parse(&config.endpoint)
            .map_err(|e| Error::Config(format!("invalid tracker.endpoint: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            PROJECT_HEADER,
            HeaderValue::from_str(&config.project_id)
                .map_err(|e| Error::Config(format!("invalid project_id: {}", e)))?,
        );

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("beacon/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint,
            max_retries: config.max_retries,
            backoff: Backoff::default(),
        })
    }

    /// Replace the retry delay schedule
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn endpoint(&self) -> &reqwest::Url {
        &self.endpoint
    }

    /// Send a batch, retrying up to `max_retries` times
    ///
    /// The error of the last attempt is returned once retries are exhausted.
    pub async fn send(&self, batch: &SignedBatch) -> Result<()> {
        let mut attempt = 0usize;

        loop {
            match self.send_once(batch).await {
                Ok(()) => {
                    if attempt > 0 {
                        tracing::info!(attempt = attempt + 1, events = batch.len, "Batch delivered after retry");
                    }
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    let delay = self.backoff.delay(attempt as u32);
                    tracing::warn!(
                        error = %e,
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Batch delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        events = batch.len,
                        "Batch delivery failed, retries exhausted"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Issue a single POST
    async fn send_once(&self, batch: &SignedBatch) -> Result<()> {
        let response = self
            .http_client
            .post(self.endpoint.clone())
            .header(SIGNATURE_HEADER, &batch.signature)
            .header(TIMESTAMP_HEADER, batch.timestamp.to_string())
            .body(batch.body.clone())
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(status = status.as_u16(), events = batch.len, "Batch accepted");
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        Err(Error::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Check whether the endpoint's host answers at all
    ///
    /// Any HTTP response, whatever its status, counts as reachable.
    pub async fn health_check(&self) -> bool {
        self.http_client
            .head(self.endpoint.clone())
            .send()
            .await
            .is_ok()
    }
}

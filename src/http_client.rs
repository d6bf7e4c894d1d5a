//! HTTP Client Module
//!
//! Provides a robust HTTP client with:
//! - Semaphore-based concurrency limiting
//! - A global requests-per-minute ceiling shared by every source
//! - Per-source spacing through the [`RateLimiter`] before every attempt
//! - Exponential backoff with jitter for transient failures
//! - Response classification into the ingestion error taxonomy

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use governor::{DefaultDirectRateLimiter, Quota};
use hyper::body::Bytes;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{IngestionError, Result};
use crate::rate_limiter::RateLimiter;

/// Longest error body kept in an error message
const MAX_ERROR_BODY: usize = 200;

/// Configuration for the HTTP client
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Maximum concurrent requests across all sources
    pub max_concurrent_requests: usize,
    /// Request timeout
    pub request_timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Attempts per request, the first one included
    pub max_attempts: u32,
    /// Initial retry delay
    pub initial_retry_delay: Duration,
    /// Maximum retry delay
    pub max_retry_delay: Duration,
    /// Retry multiplier for exponential backoff
    pub retry_multiplier: f64,
    /// Requests per minute across all sources
    pub global_rate_limit_rpm: u32,
    /// User agent string
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_attempts: 3,
            initial_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
            global_rate_limit_rpm: 300,
            user_agent: format!("Piranha-Ingestion/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpClientConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_requests: config.max_concurrent_requests.max(1),
            request_timeout: Duration::from_secs(config.http_timeout_secs),
            max_attempts: config.http_max_attempts.max(1),
            initial_retry_delay: Duration::from_millis(config.http_initial_backoff_ms),
            global_rate_limit_rpm: config.global_rate_limit_rpm,
            ..Self::default()
        }
    }
}

/// Resilient HTTP client shared by every source
pub struct ResilientHttpClient {
    client: Client,
    semaphore: Arc<Semaphore>,
    global_limiter: DefaultDirectRateLimiter,
    config: HttpClientConfig,
}

impl ResilientHttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .gzip(true)
            .brotli(true)
            .build()?;

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests));
        let quota = Quota::per_minute(NonZeroU32::new(config.global_rate_limit_rpm).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client,
            semaphore,
            global_limiter: DefaultDirectRateLimiter::direct(quota),
            config,
        })
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Creates an exponential backoff with jitter
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_retry_delay)
            .with_max_interval(self.config.max_retry_delay)
            .with_multiplier(self.config.retry_multiplier)
            .with_randomization_factor(0.5) // Jitter: +/- 50%
            .with_max_elapsed_time(None)
            .build()
    }

    /// Sends one attempt, reads its whole body, and maps the outcome onto
    /// the error taxonomy. A body cut off mid-read is transient.
    async fn send_once(&self, request: RequestBuilder, source_id: &str) -> Result<Bytes> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| IngestionError::ShutdownRequested)?;
        self.global_limiter.until_ready().await;

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                return Err(IngestionError::TransientNetwork {
                    source_id: source_id.to_string(),
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(IngestionError::HttpError(e)),
        };

        let status = response.status();
        if status.is_success() {
            return response.bytes().await.map_err(|e| IngestionError::TransientNetwork {
                source_id: source_id.to_string(),
                message: format!("response body interrupted: {}", e),
            });
        }

        let mut body = response.text().await.unwrap_or_default();
        body.truncate(
            body.char_indices()
                .nth(MAX_ERROR_BODY)
                .map_or(body.len(), |(index, _)| index),
        );
        Err(Self::classify_status(status, source_id, body))
    }

    /// Maps a non-success status onto the error taxonomy
    fn classify_status(status: StatusCode, source_id: &str, body: String) -> IngestionError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                IngestionError::Authentication(format!("{} rejected credentials ({})", source_id, status))
            }
            s if Self::is_retryable_status(s) => IngestionError::TransientNetwork {
                source_id: source_id.to_string(),
                message: format!("{}: {}", status, body),
            },
            _ => IngestionError::ApiError {
                code: status.to_string(),
                message: body,
            },
        }
    }

    /// Checks if a status code should trigger a retry
    fn is_retryable_status(status: StatusCode) -> bool {
        matches!(
            status,
            StatusCode::TOO_MANY_REQUESTS |     // 429
            StatusCode::INTERNAL_SERVER_ERROR | // 500
            StatusCode::SERVICE_UNAVAILABLE |   // 503
            StatusCode::GATEWAY_TIMEOUT |       // 504
            StatusCode::BAD_GATEWAY |           // 502
            StatusCode::REQUEST_TIMEOUT         // 408
        )
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Source-specific HTTP client: per-source spacing, retries, cancellation
#[derive(Clone)]
pub struct SourceHttpClient {
    client: Arc<ResilientHttpClient>,
    rate_limiter: Arc<RateLimiter>,
    source_id: String,
    shutdown: CancellationToken,
}

impl SourceHttpClient {
    pub fn new(client: Arc<ResilientHttpClient>, rate_limiter: Arc<RateLimiter>, source_id: &str) -> Self {
        let shutdown = rate_limiter.shutdown_token().clone();
        Self {
            client,
            rate_limiter,
            source_id: source_id.to_string(),
            shutdown,
        }
    }

    /// GETs `url` and decodes the JSON body. Transient failures are retried
    /// up to the configured attempt count; every attempt waits for the
    /// source's rate limit slot first.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
    ) -> Result<T> {
        let max_attempts = self.client.config.max_attempts;
        let mut backoff = self.client.create_backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.rate_limiter.wait(&self.source_id).await?;

            let mut request = self.client.inner().get(url).query(query);
            for (name, value) in headers {
                request = request.header(*name, value);
            }

            debug!(source = %self.source_id, url = %url, attempt, "Executing HTTP request");

            let outcome = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(IngestionError::ShutdownRequested),
                outcome = self.client.send_once(request, &self.source_id) => outcome,
            };

            match outcome {
                Ok(body) => {
                    return serde_json::from_slice(&body).map_err(|e| {
                        IngestionError::ParseError(format!("{} returned an unexpected body: {}", self.source_id, e))
                    });
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = backoff.next_backoff().unwrap_or(self.client.config.max_retry_delay);
                    warn!(
                        source = %self.source_id,
                        error = %e,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Transient error, will retry"
                    );
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Err(IngestionError::ShutdownRequested),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

use crate::models::FetchError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Serializes outbound requests and enforces a minimum delay between any
/// two of them. Shared (behind an `Arc`) by every component that talks to
/// the same upstream endpoint, including concurrent runs.
pub struct RateLimiter {
    min_delay: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last_request: Mutex::new(None),
        }
    }

    /// A limiter that never waits. Used by tests.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Waits until at least `min_delay` has passed since the previous
    /// request, then stamps the current instant. The mutex is held across
    /// the sleep so concurrent callers queue up instead of bursting.
    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_delay {
                tokio::time::sleep(self.min_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Retry schedule for transient fetch failures: up to `max_attempts`
/// tries with a linearly growing pause between them. Pure data, so the
/// schedule is testable without a transport.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Pause before retry number `attempt` (1-based): linear backoff.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// One fetched search-results page. The final URL is surfaced because the
/// upstream site redirects out-of-range page numbers back to page 1,
/// which is how "past the last page" shows up.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub body: String,
}

impl FetchedPage {
    pub fn was_redirected(&self) -> bool {
        self.url != self.final_url
    }
}

/// Seam between the orchestrator and the network, so state-machine tests
/// can script page sequences.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// Production fetcher: rate-limited reqwest with retry on transient
/// failures (connect errors, timeouts, 5xx, 429).
pub struct HttpFetcher {
    client: reqwest::Client,
    limiter: std::sync::Arc<RateLimiter>,
    policy: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(
        client: reqwest::Client,
        limiter: std::sync::Arc<RateLimiter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            limiter,
            policy,
        }
    }

    fn is_retryable_status(status: reqwest::StatusCode) -> bool {
        status.is_server_error() || status.as_u16() == 429
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0u32;
        let mut last_reason = String::new();

        loop {
            attempt += 1;
            self.limiter.wait().await;

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let final_url = response.url().to_string();
                        match response.text().await {
                            Ok(body) => {
                                tracing::debug!(url, bytes = body.len(), "fetched page");
                                return Ok(FetchedPage {
                                    url: url.to_string(),
                                    final_url,
                                    body,
                                });
                            }
                            Err(e) => {
                                last_reason = format!("reading body: {}", e);
                            }
                        }
                    } else if Self::is_retryable_status(status) {
                        last_reason = format!("status {}", status.as_u16());
                    } else {
                        return Err(FetchError::Status {
                            url: url.to_string(),
                            status: status.as_u16(),
                        });
                    }
                }
                Err(e) => {
                    last_reason = e.to_string();
                }
            }

            if !self.policy.should_retry(attempt) {
                return Err(FetchError::Exhausted {
                    url: url.to_string(),
                    attempts: attempt,
                    reason: last_reason,
                });
            }

            let delay = self.policy.delay_for(attempt);
            tracing::warn!(
                url,
                attempt,
                reason = %last_reason,
                "fetch failed, retrying in {:?}",
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

//! HTTP fetching with exponential backoff retry logic.
//!
//! Every collaborator request (article index pages, article bodies, radio
//! transcript feeds) goes through this module.
//!
//! # Architecture
//!
//! - [`FetchAsync`]: core trait for fetching a URL as text
//! - [`HttpFetch`]: `reqwest` implementation
//! - [`RetryFetch`]: decorator that adds retry logic to any `FetchAsync`
//!
//! # Retry Strategy
//!
//! ```text
//! delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
//! ```

use rand::{Rng, rng};
use std::fmt;
use std::time::{Duration as StdDuration, Instant};
use tokio::time::sleep;
use tracing::{error, instrument, warn};

use crate::error::{AppError, AppResult};

/// Trait for fetching a document body.
pub trait FetchAsync {
    /// Fetch `url` and return the response body.
    ///
    /// # Arguments
    ///
    /// * `url` - Absolute URL of the page or feed
    ///
    /// # Returns
    ///
    /// The body as text, or an error if the request failed.
    async fn fetch(&self, url: &str) -> AppResult<String>;
}

/// Plain `reqwest` fetcher. Non-2xx responses are errors.
#[derive(Debug, Clone)]
pub struct HttpFetch {
    client: reqwest::Client,
}

impl HttpFetch {
    pub fn new(timeout: StdDuration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl FetchAsync for HttpFetch {
    async fn fetch(&self, url: &str) -> AppResult<String> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

/// Wrapper that adds exponential backoff retry logic to any [`FetchAsync`].
///
/// Validation errors (a malformed URL, for instance) are returned at once;
/// everything else is retried up to `max_retries` times.
pub struct RetryFetch<T> {
    /// The fetcher being wrapped.
    inner: T,
    /// Retries after the first attempt before giving up.
    max_retries: usize,
    /// Delay before the first retry (doubles with each attempt).
    base_delay: StdDuration,
    max_delay: StdDuration,
}

impl<T> RetryFetch<T>
where
    T: FetchAsync,
{
    /// Create a retry wrapper around an existing [`FetchAsync`] implementation.
    ///
    /// # Arguments
    ///
    /// * `inner` - The fetcher to wrap
    /// * `max_retries` - Retries after the first attempt (3 for scrapers)
    /// * `base_delay` - Delay before the first retry (1 second for scrapers)
    ///
    /// # Example
    ///
    /// ```ignore
    /// let http = HttpFetch::new(Duration::from_secs(20))?;
    /// let fetch = RetryFetch::new(http, 3, Duration::from_secs(1));
    /// let body = fetch.fetch("https://lite.cnn.com").await?;
    /// ```
    pub fn new(inner: T, max_retries: usize, base_delay: StdDuration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: StdDuration::from_secs(30),
        }
    }

    fn backoff(&self, attempt: usize) -> StdDuration {
        let shift = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX).min(16);
        let delay = self.base_delay.saturating_mul(1 << shift).min(self.max_delay);
        let jitter_ms: u64 = rng().random_range(0..=250);
        delay + StdDuration::from_millis(jitter_ms)
    }
}

impl<T> fmt::Debug for RetryFetch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryFetch")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl<T> FetchAsync for RetryFetch<T>
where
    T: FetchAsync,
{
    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, url: &str) -> AppResult<String> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            match self.inner.fetch(url).await {
                Ok(body) => return Ok(body),
                Err(e @ AppError::Validation(_)) => return Err(e),
                Err(e) => {
                    attempt += 1;
                    let total_dt = total_t0.elapsed();

                    if attempt > self.max_retries {
                        error!(
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_total = total_dt.as_millis(),
                            error = %e,
                            "fetch exhausted retries"
                        );
                        return Err(e);
                    }

                    let delay = self.backoff(attempt);
                    warn!(
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_total = total_dt.as_millis(),
                        ?delay,
                        error = %e,
                        "fetch attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Flaky {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new(failures: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl FetchAsync for Flaky {
        async fn fetch(&self, url: &str) -> AppResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if url.is_empty() {
                return Err(AppError::validation("empty url"));
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                Err(AppError::collaborator("503 Service Unavailable"))
            } else {
                Ok(format!("body of {url}"))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let fetch = RetryFetch::new(Flaky::new(2), 5, StdDuration::from_secs(1));
        let body = fetch.fetch("https://example.com").await.unwrap();

        assert_eq!(body, "body of https://example.com");
        assert_eq!(fetch.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let fetch = RetryFetch::new(Flaky::new(10), 2, StdDuration::from_secs(1));
        let err = fetch.fetch("https://example.com").await.unwrap_err();

        assert!(err.to_string().contains("503"));
        assert_eq!(fetch.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validation_errors_are_not_retried() {
        let fetch = RetryFetch::new(Flaky::new(0), 5, StdDuration::from_secs(1));
        assert!(fetch.fetch("").await.is_err());
        assert_eq!(fetch.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let fetch = RetryFetch::new(Flaky::new(0), 5, StdDuration::from_secs(1));
        assert!(fetch.backoff(1) >= StdDuration::from_secs(1));
        assert!(fetch.backoff(1) <= StdDuration::from_millis(1250));
        assert!(fetch.backoff(20) <= StdDuration::from_millis(30_250));
    }
}

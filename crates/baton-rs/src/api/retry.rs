//! Automatic retry with exponential backoff and jitter.
//!
//! Retries transient HTTP/API errors (429, 500, 502, 503, 504, network timeouts)
//! with configurable exponential backoff. Never retries 400 (bad request) or 401
//! (auth) errors.

use crate::Message;
use crate::api::{Completion, CompletionFuture};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = no retries, just fail immediately).
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Shorten each delay by a fixed per-attempt factor.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with the given number of retries.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter {
            // Deterministic factors; no rand dependency.
            let jitter_factor = match attempt % 4 {
                0 => 0.75,
                1 => 0.90,
                2 => 0.60,
                _ => 0.85,
            };
            Duration::from_secs_f64(capped * jitter_factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

/// Whether an error string indicates a transient (retryable) failure.
pub fn is_transient_error(error: &str) -> bool {
    let transient_statuses = ["429", "500", "502", "503", "504"];
    if transient_statuses
        .iter()
        .any(|s| error.contains(&format!("HTTP {s}")))
    {
        return true;
    }

    let lower = error.to_lowercase();
    [
        "request failed:",
        "connection reset",
        "connection refused",
        "timed out",
        "timeout",
        "broken pipe",
        "network",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

/// Whether an error is a permanent (non-retryable) failure.
pub fn is_permanent_error(error: &str) -> bool {
    [
        "HTTP 400",
        "HTTP 401",
        "HTTP 403",
        "HTTP 404",
        "HTTP 422",
        "invalid",
        "bad request",
        "unauthorized",
    ]
    .iter()
    .any(|p| error.contains(p))
}

/// Wraps a [`Completion`] and retries transient failures.
pub struct RetryingCompletion<C> {
    inner: C,
    config: RetryConfig,
}

impl<C: Completion> RetryingCompletion<C> {
    pub fn new(inner: C, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: Completion> Completion for RetryingCompletion<C> {
    fn complete<'a>(
        &'a self,
        system: &'a str,
        conversation: &'a [Message],
    ) -> CompletionFuture<'a> {
        Box::pin(async move {
            let mut attempt = 0;
            loop {
                match self.inner.complete(system, conversation).await {
                    Ok(reply) => return Ok(reply),
                    Err(e)
                        if attempt < self.config.max_retries
                            && is_transient_error(&e)
                            && !is_permanent_error(&e) =>
                    {
                        let delay = self.config.delay_for_attempt(attempt);
                        warn!(
                            "Transient completion error (attempt {}/{}), retrying in {:.1}s: {e}",
                            attempt + 1,
                            self.config.max_retries,
                            delay.as_secs_f64(),
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn default_config_no_retries() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 0);
    }

    #[test]
    fn delay_increases_exponentially() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::with_retries(5)
        };
        let d0 = config.delay_for_attempt(0);
        let d1 = config.delay_for_attempt(1);
        let d2 = config.delay_for_attempt(2);

        assert!(d1 > d0, "d1={d1:?} should be > d0={d0:?}");
        assert!(d2 > d1, "d2={d2:?} should be > d1={d1:?}");
    }

    #[test]
    fn delay_capped_at_max() {
        let config = RetryConfig {
            jitter: false,
            max_delay: Duration::from_secs(2),
            ..RetryConfig::with_retries(10)
        };
        assert!(config.delay_for_attempt(10) <= Duration::from_secs(2));
    }

    #[test]
    fn transient_errors_detected() {
        assert!(is_transient_error("OpenRouter API HTTP 429: rate limited"));
        assert!(is_transient_error("OpenRouter API HTTP 502: bad gateway"));
        assert!(is_transient_error("request failed: connection reset"));
        assert!(!is_transient_error("OpenRouter API HTTP 400: bad request"));
        assert!(!is_transient_error("some random error"));
    }

    #[test]
    fn permanent_errors_detected() {
        assert!(is_permanent_error("OpenRouter API HTTP 400: bad request"));
        assert!(is_permanent_error("OpenRouter API HTTP 401: unauthorized"));
    }

    /// Fails with the queued errors, then succeeds.
    struct Flaky {
        errors: Mutex<Vec<String>>,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(errors: &[&str]) -> Self {
            Self {
                errors: Mutex::new(errors.iter().rev().map(|e| e.to_string()).collect()),
                calls: AtomicU32::new(0),
            }
        }
    }

    impl Completion for Flaky {
        fn complete<'a>(&'a self, _: &'a str, _: &'a [Message]) -> CompletionFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.errors.lock().unwrap().pop();
            Box::pin(async move {
                match next {
                    Some(e) => Err(e),
                    None => Ok("ok".to_string()),
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let retrying = RetryingCompletion::new(
            Flaky::new(&["HTTP 503: unavailable", "request failed: timed out"]),
            RetryConfig::with_retries(3),
        );
        assert_eq!(retrying.complete("sys", &[]).await.unwrap(), "ok");
        assert_eq!(retrying.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let retrying = RetryingCompletion::new(
            Flaky::new(&["OpenRouter API HTTP 401: unauthorized"]),
            RetryConfig::with_retries(3),
        );
        assert!(retrying.complete("sys", &[]).await.is_err());
        assert_eq!(retrying.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let retrying = RetryingCompletion::new(
            Flaky::new(&["HTTP 503", "HTTP 503", "HTTP 503"]),
            RetryConfig::with_retries(1),
        );
        assert_eq!(retrying.complete("sys", &[]).await.unwrap_err(), "HTTP 503");
        assert_eq!(retrying.inner().calls.load(Ordering::SeqCst), 2);
    }
}

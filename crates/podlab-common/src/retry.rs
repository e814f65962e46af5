//! Bounded retry with exponential backoff and jitter.
//!
//! Lifecycle calls are never retried (a failed create must surface to the
//! caller). Retry is reserved for lookups that race with the scheduler,
//! such as finding the pod behind a freshly created workload.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Backoff settings for a retried lookup
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default backoff with a different attempt budget
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }
}

/// Retry `operation` on every error until it succeeds or attempts run out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, |_| true, operation).await
}

/// Retry `operation` while `should_retry` accepts the error.
///
/// Errors rejected by `should_retry` are returned at once. When attempts run
/// out the last error is returned.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&err) {
            debug!(operation = %operation_name, error = %err, "Error is not retryable");
            return Err(err);
        }
        if attempt >= config.max_attempts {
            warn!(
                operation = %operation_name,
                attempt = attempt,
                error = %err,
                "Giving up after max attempts"
            );
            return Err(err);
        }

        // 0.5x to 1.5x of the nominal delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

        debug!(
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            delay_ms = jittered_delay.as_millis() as u64,
            "Attempt failed, retrying"
        );

        tokio::time::sleep(jittered_delay).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}

//! Backoff policies
//!
//! Two shapes of backoff are used across the engine:
//!
//! - [`exponential_backoff`]: deterministic `min(base * 2^n, cap)`, used to
//!   reschedule queued jobs and task executions so `scheduled_at` grows
//!   monotonically between attempts
//! - [`RetryConfig`]: jittered backoff for tight contention loops (lock
//!   acquisition) and for transient infrastructure errors

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// `min(base * 2^retry_count, cap)`
#[must_use]
pub fn exponential_backoff(retry_count: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(cap, |d| d.min(cap))
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay, before jitter
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock acquisition: 50ms doubling up to 500ms, jittered
    ///
    /// Attempts are unbounded; callers bound the loop by wall-clock time.
    #[must_use]
    pub fn lock_acquire() -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set maximum attempts
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set initial delay
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let base_ms = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let delay_ms = base_ms.min(self.max_delay.as_millis() as f64) as u64;

        if self.jitter && delay_ms >= 4 {
            let extra = rand::thread_rng().gen_range(0..=delay_ms / 4);
            Duration::from_millis(delay_ms + extra)
        } else {
            Duration::from_millis(delay_ms)
        }
    }
}

/// Error type for retry operations
#[derive(Debug)]
pub struct RetryError<E> {
    /// The last error encountered
    pub last_error: E,
    /// Total number of attempts made
    pub attempts: u32,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "operation failed after {} attempts: {}",
            self.attempts, self.last_error
        )
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for RetryError<E> {}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// runs out of attempts
///
/// ```ignore
/// let job = retry_with_backoff(
///     &RetryConfig::default(),
///     || store.get_job(id),
///     |e| e.is_transient(),
/// )
/// .await?;
/// ```
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    config: &RetryConfig,
    mut operation: F,
    is_retryable: R,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Debug,
{
    let mut attempt = 1;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if attempt >= config.max_attempts || !is_retryable(&err) {
            debug!(attempt, error = ?err, "Operation failed, giving up");
            return Err(RetryError {
                last_error: err,
                attempts: attempt,
            });
        }

        let delay = config.delay_for(attempt);
        warn!(
            attempt,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = ?err,
            "Operation failed, retrying"
        );
        sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_exponential_backoff_doubles_then_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(300);

        assert_eq!(exponential_backoff(0, base, cap), Duration::from_secs(1));
        assert_eq!(exponential_backoff(1, base, cap), Duration::from_secs(2));
        assert_eq!(exponential_backoff(3, base, cap), Duration::from_secs(8));
        assert_eq!(exponential_backoff(9, base, cap), cap);
        assert_eq!(exponential_backoff(40, base, cap), cap);
    }

    #[test]
    fn test_lock_acquire_delays_stay_in_bounds() {
        let config = RetryConfig::lock_acquire();

        for attempt in 1..20 {
            let delay = config.delay_for(attempt);
            assert!(delay >= Duration::from_millis(50));
            // cap plus at most 25% jitter
            assert!(delay <= Duration::from_millis(625));
        }
    }

    #[test]
    fn test_delay_without_jitter_is_exact() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350))
            .with_jitter(false);

        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<u32, RetryError<&str>> = retry_with_backoff(
            &config,
            || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("connection reset")
                    } else {
                        Ok(n)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            &config,
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("constraint violation")
                }
            },
            |e| *e != "constraint violation",
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

//! Exponential backoff and bounded retries.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{DeployError, DeployResult};

/// Exponential backoff with optional jitter.
///
/// Each call to [`Backoff::next_delay`] doubles (by `factor`) the previous
/// delay, capped at `max`. With jitter the delay is drawn uniformly from
/// `[min, delay]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
    attempt: i32,
}

impl Backoff {
    /// Create a backoff between `min` and `max` with factor 2 and jitter.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            factor: 2.0,
            jitter: true,
            attempt: 0,
        }
    }

    /// Backoff used when polling machine state.
    #[must_use]
    pub fn for_state_polling() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(2))
    }

    /// Set the growth factor.
    #[must_use]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.min.as_secs_f64() * self.factor.powi(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let delay = base.min(self.max.as_secs_f64());

        if self.jitter && delay > self.min.as_secs_f64() {
            let low = self.min.as_secs_f64();
            Duration::from_secs_f64(rand::thread_rng().gen_range(low..=delay))
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// Start over from the minimum delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Bounded retry of calls made outside the main wait loops.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out.
    pub async fn run<F, Fut, T>(&self, what: &str, mut f: F) -> DeployResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DeployResult<T>>,
    {
        let mut backoff = Backoff::new(self.initial_delay, self.max_delay);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = backoff.next_delay();
                    debug!(
                        operation = what,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Sleep for `duration` or until cancelled.
pub(crate) async fn sleep_or_cancel(
    duration: Duration,
    cancel: &tokio_util::sync::CancellationToken,
) -> DeployResult<()> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(DeployError::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn delays_grow_and_cap_without_jitter() {
        let mut backoff = Backoff::for_state_polling().with_jitter(false);
        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(2),
            ]
        );

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn jittered_delays_stay_in_bounds() {
        let mut backoff = Backoff::for_state_polling();
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn retry_stops_on_permanent_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryPolicy::default()
        };

        let result: DeployResult<()> = policy
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DeployError::validation("nope"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_gives_up_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryPolicy::default()
        };

        let result: DeployResult<()> = policy
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DeployError::transient("503"))
            })
            .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryPolicy::default()
        };

        let value = policy
            .run("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DeployError::transient("503"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}

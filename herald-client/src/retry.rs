//! Retry with exponential backoff for transient broker failures.

use std::future::Future;
use std::time::Duration;

use herald_broker::{BrokerError, BrokerResult};
use herald_core::Limits;
use rand::Rng;
use thiserror::Error;
use tracing::warn;

use crate::error::{ClientError, ClientResult};

/// A broker call that did not succeed.
#[derive(Debug, Clone, Error)]
#[error("{source} (after {attempts} attempts)")]
pub struct RetryError {
    /// Attempts made, including the first.
    pub attempts: u32,
    /// The last error returned.
    #[source]
    pub source: BrokerError,
}

impl RetryError {
    /// Returns true if the call gave up on a transient error.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.source.is_retryable()
    }
}

/// Bounded retry policy.
///
/// The delay doubles after each failed attempt, starting at
/// `initial_backoff` and capped at `max_backoff`. With `jitter` the delay
/// is drawn uniformly from `[delay / 2, delay]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Upper bound on the delay.
    pub max_backoff: Duration,
    /// Randomize delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy for testing: few attempts, millisecond delays, no jitter.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter: false,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: false,
        }
    }

    /// Sets the maximum number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the backoff bounds.
    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Returns the delay after the given number of failed attempts (1-based).
    #[must_use]
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        let delay = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);

        if self.jitter && !delay.is_zero() {
            rand::thread_rng().gen_range(delay / 2..=delay)
        } else {
            delay
        }
    }

    /// Runs `call` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// # Errors
    /// Returns the last error together with the number of attempts made.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempts < self.max_attempts => {
                    let delay = self.backoff(attempts);
                    warn!(
                        operation,
                        attempt = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Broker request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => return Err(RetryError { attempts, source }),
            }
        }
    }

    /// Validates the policy.
    ///
    /// # Errors
    /// Returns `Configuration` if attempts are out of bounds or the backoff
    /// range is inverted.
    pub fn validate(&self, limits: &Limits) -> ClientResult<()> {
        if self.max_attempts == 0 || self.max_attempts > limits.max_retry_attempts {
            return Err(ClientError::configuration(
                "retry.max_attempts",
                format!("must be in 1..={}", limits.max_retry_attempts),
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ClientError::configuration(
                "retry.initial_backoff",
                "must not exceed max_backoff",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for attempt in 1..8 {
            let delay = policy.backoff(attempt);
            let ceiling = RetryPolicy {
                jitter: false,
                ..policy
            }
            .backoff(attempt);
            assert!(delay >= ceiling / 2 && delay <= ceiling);
        }
    }

    #[test]
    fn test_validate() {
        let limits = Limits::default();
        assert!(RetryPolicy::default().validate(&limits).is_ok());
        assert!(RetryPolicy::default()
            .with_max_attempts(0)
            .validate(&limits)
            .is_err());
        assert!(RetryPolicy::default()
            .with_backoff(Duration::from_secs(2), Duration::from_secs(1))
            .validate(&limits)
            .is_err());
    }

    #[tokio::test]
    async fn test_run_retries_transient_errors() {
        let calls = &AtomicU32::new(0);
        let result = RetryPolicy::for_testing()
            .run("fetch", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BrokerError::unreachable("fetch"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up() {
        let result: Result<(), _> = RetryPolicy::for_testing()
            .run("fetch", || async { Err(BrokerError::unreachable("fetch")) })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(err.is_exhausted());
    }

    #[tokio::test]
    async fn test_run_does_not_retry_permanent_errors() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::for_testing()
            .run("append", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::UnknownTopic { topic: "t".into() })
            })
            .await;
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

//! Bounded retry for fragile operations.
//!
//! [`RetryExecutor::with_retry`] runs an async operation up to a fixed number
//! of attempts and reports exhaustion as a distinguished error carrying the
//! last underlying failure. There is no delay between attempts unless a
//! [`RetryDelay`] is configured.
//!
//! # Example
//!
//! ```rust
//! use market_data_pipeline::application::services::retry::{RetryError, RetryExecutor};
//!
//! # tokio_test::block_on(async {
//! let executor = RetryExecutor::new();
//! let result: Result<u32, RetryError<&str>> = executor
//!     .with_retry(|attempt| async move { if attempt < 2 { Err("flaky") } else { Ok(attempt) } }, 3)
//!     .await;
//! assert_eq!(result.ok(), Some(2));
//! # });
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Error returned once every attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError<E> {
    /// All attempts failed.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// Error from the final attempt.
    #[must_use]
    pub const fn last(&self) -> &E {
        match self {
            Self::Exhausted { last, .. } => last,
        }
    }

    /// Consume into the final error.
    pub fn into_last(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
        }
    }
}

/// Pause between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryDelay {
    /// Retry immediately.
    #[default]
    None,
    /// Sleep a fixed duration before each retry.
    Fixed(Duration),
}

/// Runs operations with a bounded number of attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    delay: RetryDelay,
}

impl RetryExecutor {
    /// Create an executor that retries immediately.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            delay: RetryDelay::None,
        }
    }

    /// Create an executor that pauses between attempts.
    #[must_use]
    pub const fn with_delay(delay: RetryDelay) -> Self {
        Self { delay }
    }

    /// Run `operation` until it succeeds or `max_attempts` calls have failed.
    ///
    /// The closure receives the zero-based attempt number. `max_attempts` of
    /// 0 is treated as 1.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Exhausted`] with the last error once every
    /// attempt failed.
    pub async fn with_retry<T, E, F, Fut>(
        &self,
        mut operation: F,
        max_attempts: u32,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        tracing::warn!(
                            attempts = attempt,
                            error = %error,
                            "Retries exhausted"
                        );
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: error,
                        });
                    }

                    tracing::warn!(
                        attempt,
                        max_attempts,
                        error = %error,
                        "Attempt failed, retrying"
                    );

                    if let RetryDelay::Fixed(delay) = self.delay {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn counting_failures(
        calls: &Arc<AtomicU32>,
        succeed_on: Option<u32>,
    ) -> impl FnMut(u32) -> std::future::Ready<Result<u32, String>> + use<> {
        let calls = Arc::clone(calls);
        move |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(match succeed_on {
                Some(n) if attempt == n => Ok(attempt),
                _ => Err(format!("failure {attempt}")),
            })
        }
    }

    #[tokio::test]
    async fn first_success_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = RetryExecutor::new()
            .with_retry(counting_failures(&calls, Some(0)), 3)
            .await;

        assert_eq!(result, Ok(0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_below_max_does_not_raise() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = RetryExecutor::new()
            .with_retry(counting_failures(&calls, Some(2)), 3)
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_carries_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = RetryExecutor::new()
            .with_retry(counting_failures(&calls, None), 3)
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.last(), "failure 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_attempts_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = RetryExecutor::new()
            .with_retry(counting_failures(&calls, None), 0)
            .await;

        assert_eq!(result.unwrap_err().attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_delay_sleeps_between_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let result = RetryExecutor::with_delay(RetryDelay::Fixed(Duration::from_secs(2)))
            .with_retry(counting_failures(&calls, None), 3)
            .await;

        assert!(result.is_err());
        // two pauses, none after the final attempt
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }
}

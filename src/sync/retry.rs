// ABOUTME: RetryPolicy - bounded exponential backoff around one sync attempt
// ABOUTME: Observes cancellation before every attempt and during every sleep

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::RetrySettings;
use crate::error::{SyncError, SyncResult};

/// Result of [`RetryPolicy::execute`], with the number of attempts made.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: SyncResult<T>,
    pub attempts: u32,
}

/// Exponential backoff with a bounded number of attempts.
///
/// After failed attempt `k` (1-based) the policy sleeps
/// `min(max_delay, base_delay * 2^(k-1))` before attempt `k + 1`. After
/// `max_attempts` failures the last error is returned unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_secs(settings.base_delay_seconds),
            Duration::from_secs(settings.max_delay_seconds),
        )
    }

    /// A single attempt, no backoff.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Backoff slept after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or exhausts `max_attempts`. The closure receives the 1-based attempt
    /// number.
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        self.execute_if(cancel, SyncError::is_retryable, operation)
            .await
    }

    /// Like [`RetryPolicy::execute`], retrying only errors accepted by `retry_if`.
    pub async fn execute_if<F, Fut, T, P>(
        &self,
        cancel: &CancellationToken,
        retry_if: P,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
        P: Fn(&SyncError) -> bool,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(SyncError::Cancelled),
                    attempts: attempt,
                };
            }

            attempt += 1;
            let error = match operation(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) => e,
            };

            if attempt >= self.max_attempts || !retry_if(&error) {
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            let delay = self.delay_for(attempt);
            tracing::warn!(
                "Attempt {}/{} failed: {}. Retrying in {:?}...",
                attempt,
                self.max_attempts,
                error,
                delay
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(SyncError::Cancelled),
                        attempts: attempt,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Await `future` unless `cancel` fires first.
pub async fn with_cancellation<T, Fut>(cancel: &CancellationToken, future: Fut) -> SyncResult<T>
where
    Fut: Future<Output = SyncResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = future => result,
    }
}

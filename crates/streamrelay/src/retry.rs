// Retry Utility: one retry-with-backoff policy shared by every network-calling component.
//
// Attempts are 1-based. The wait before attempt n is `base * 2^(n-2)` (nothing before the first).

use reqwest::StatusCode;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Shape of the wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * 2^(n-2)` before attempt n
    Exponential,
    /// `base` before every retry
    Fixed,
    /// Retry immediately
    None,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
    /// Upstream statuses treated as transient.
    pub retryable_statuses: Vec<StatusCode>,
}

impl RetryPolicy {
    /// Five attempts, exponential backoff from 100ms, retrying only on 503.
    pub fn relay_default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            backoff: Backoff::Exponential,
            retryable_statuses: vec![StatusCode::SERVICE_UNAVAILABLE],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff, base_delay: Duration) -> Self {
        self.backoff = backoff;
        self.base_delay = base_delay;
        self
    }

    /// Wait before the given 1-based attempt.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                // Shifts past 31 saturate instead of overflowing.
                let multiplier = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(multiplier)
                    .unwrap_or(Duration::MAX)
            }
        }
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_statuses.contains(&status)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::relay_default()
    }
}

/// Outcome of one attempt, as classified by the caller.
pub enum RetryAction<T, E> {
    Success(T),
    /// Transient failure (503, timeout, connection reset).
    Retry(E),
    /// Permanent failure; surfaces without further attempts.
    Fail(E),
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E>
where
    E: fmt::Display + fmt::Debug,
{
    #[error("failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("attempt {attempts} failed: {error}")]
    Failed { attempts: u32, error: E },

    #[error("cancelled")]
    Cancelled,
}

/// Execute an async operation under `policy`.
///
/// `operation` receives the 1-based attempt number. Cancelling `token` interrupts
/// the backoff wait; an attempt already in flight is left to the operation itself.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RetryAction<T, E>>,
    E: fmt::Display + fmt::Debug,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let delay = policy.delay_before_attempt(attempt);
        if !delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        } else if token.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(error) => {
                return Err(RetryError::Failed {
                    attempts: attempt,
                    error,
                });
            }
            RetryAction::Retry(last) => {
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last,
                    });
                }
                warn!(
                    attempt,
                    max = max_attempts,
                    next_delay_ms = policy.delay_before_attempt(attempt + 1).as_millis() as u64,
                    error = %last,
                    "Retrying after transient error"
                );
                attempt += 1;
            }
        }
    }
}

/// Connect, timeout and body errors are transient; builder and redirect errors are not.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}

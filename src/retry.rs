//! Retry policy applied around provider calls.

use std::future::Future;
use std::time::Duration;

use crate::error::ProviderError;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `multiplier * 2^(n-1)` clamped to `[min, max]`, where `n` is the failed attempt.
    Exponential {
        /// Scale applied to the doubling sequence.
        multiplier: Duration,
        /// Lower clamp.
        min: Duration,
        /// Upper clamp.
        max: Duration,
    },
    /// `step * n`, where `n` is the failed attempt.
    Linear {
        /// Increment per attempt.
        step: Duration,
    },
    /// Retry immediately.
    None,
}

impl Backoff {
    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Self::Exponential { multiplier, min, max } => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                multiplier.saturating_mul(factor).clamp(min, max)
            }
            Self::Linear { step } => step.saturating_mul(attempt),
            Self::None => Duration::ZERO,
        }
    }
}

/// Attempt ceiling, delay schedule and retryable-error predicate.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    retryable: fn(&ProviderError) -> bool,
}

impl RetryPolicy {
    /// Builds a policy; `max_attempts` is raised to at least one.
    pub fn new(max_attempts: u32, backoff: Backoff, retryable: fn(&ProviderError) -> bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable,
        }
    }

    /// Five attempts, exponential 2s multiplier clamped to 4s..60s, transient errors only.
    pub fn embedding() -> Self {
        Self::new(
            5,
            Backoff::Exponential {
                multiplier: Duration::from_secs(2),
                min: Duration::from_secs(4),
                max: Duration::from_secs(60),
            },
            ProviderError::is_transient,
        )
    }

    /// Two attempts, 1.5s linear backoff, transient errors and malformed output.
    pub fn generation() -> Self {
        Self::new(
            2,
            Backoff::Linear {
                step: Duration::from_millis(1500),
            },
            |err| err.is_transient() || err.is_malformed(),
        )
    }

    /// Replaces the delay schedule, keeping ceiling and predicate.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replaces the attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Attempt ceiling.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay schedule.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Whether `err` may be retried under this policy.
    pub fn is_retryable(&self, err: &ProviderError) -> bool {
        (self.retryable)(err)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt ceiling is reached. The closure receives the 1-based
    /// attempt number. No delay follows the final attempt.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1u32;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = self.is_retryable(&err);
                    if !retryable || attempt >= self.max_attempts {
                        return Err(RetryError {
                            attempts: attempt,
                            retryable,
                            source: err,
                        });
                    }
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        "{label}: attempt {attempt}/{} failed ({err}); retrying in {:.1}s",
                        self.max_attempts,
                        delay.as_secs_f64()
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Final failure after [`RetryPolicy::run`] gave up.
#[derive(Debug, Clone, thiserror::Error)]
#[error("gave up after {attempts} attempt(s): {source}")]
pub struct RetryError {
    /// Attempts made, including the last one.
    pub attempts: u32,
    /// False when the last error was not retryable under the policy.
    pub retryable: bool,
    /// Last error observed.
    pub source: ProviderError,
}

impl RetryError {
    /// Last provider error.
    pub fn into_inner(self) -> ProviderError {
        self.source
    }
}

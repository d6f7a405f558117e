//! Retry policy and backoff calculation

use std::time::Duration;

use transport::ErrorClassification;

/// How many attempts a call gets and how long to wait between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per logical call, including the first
    pub max_attempts: u32,
    /// Base delay for exponential backoff on transient errors
    pub base_delay: Duration,
    /// Step for linear backoff on rate-limit errors
    pub rate_limit_step: Duration,
    /// Upper bound for any single backoff
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            rate_limit_step: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_delays(
        max_attempts: u32,
        base_delay: Duration,
        rate_limit_step: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            rate_limit_step,
            max_delay,
        }
    }

    /// `base_delay · 2^attempt`, capped. `attempt` is the zero-based index of
    /// the attempt that just failed.
    pub fn transient_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// `rate_limit_step · (attempt + 1)`, capped.
    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        self.rate_limit_step
            .saturating_mul(attempt.saturating_add(1))
            .min(self.max_delay)
    }

    /// Delay before the next attempt, or `None` if the failure is not retried.
    pub fn delay_for(&self, classification: ErrorClassification, attempt: u32) -> Option<Duration> {
        match classification {
            ErrorClassification::AuthenticationInvalid => Some(Duration::ZERO),
            ErrorClassification::RateLimited => Some(self.rate_limit_delay(attempt)),
            ErrorClassification::TransientRetryable => Some(self.transient_delay(attempt)),
            ErrorClassification::Fatal => None,
        }
    }
}

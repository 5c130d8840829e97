//! Exponential backoff for transient provider failures.

use std::time::Duration;

use crate::error::ProviderError;
use crate::types::config::RetryConfig;

/// Backoff schedule derived from [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
        }
    }

    /// Attempts per provider, including the first. Always at least 1.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt may follow a failure on attempt `attempt`
    /// (1-based).
    pub fn should_retry(&self, attempt: u32, error: &ProviderError) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    /// Delay before attempt `attempt + 1`.
    ///
    /// `base * multiplier^(attempt-1)`, capped at `max_delay`. A server
    /// supplied `retry_after` wins when it is longer.
    pub fn delay_for(&self, attempt: u32, error: &ProviderError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let backoff = Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()));

        match error.retry_after() {
            Some(hint) if hint > backoff => hint.min(self.max_delay),
            _ => backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

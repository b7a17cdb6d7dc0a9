//! Retry policy for failed tasks.

use std::time::Duration;

use herald_common::config::{BackoffKind, QueueConfig};

/// Retry configuration with exponential or fixed backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Default number of delivery attempts per task.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Growth of the delay between attempts.
    pub backoff: BackoffKind,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            backoff: BackoffKind::Exponential,
        }
    }
}

impl From<&QueueConfig> for RetryConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_secs(config.initial_backoff_secs),
            max_delay: Duration::from_secs(config.max_backoff_secs),
            backoff: config.backoff,
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after the given failed attempt (1-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            BackoffKind::Fixed => self.initial_delay,
            BackoffKind::Exponential => {
                let exponent = attempt.saturating_sub(1).min(31);
                self.initial_delay
                    .checked_mul(1_u32 << exponent)
                    .unwrap_or(self.max_delay)
            }
        };

        delay.min(self.max_delay)
    }

    /// Whether a task that failed on `attempt` out of `max_attempts` gets another try.
    #[must_use]
    pub const fn should_retry(attempt: u32, max_attempts: u32) -> bool {
        attempt < max_attempts
    }
}

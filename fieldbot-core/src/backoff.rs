// ABOUTME: Exponential backoff for chat session reconnects.
// ABOUTME: Delay doubles per consecutive failure up to a cap; too many failures halts retrying.

use std::time::Duration;

use crate::config::ConnectionConfig;

/// Backoff configuration for session reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Consecutive failures tolerated before giving up (0 = unlimited)
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

impl From<&ConnectionConfig> for BackoffConfig {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            initial_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            max_retries: config.max_retries,
        }
    }
}

/// Tracks consecutive failures; delay for failure k is `min(initial * 2^(k-1), max)`
#[derive(Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    consecutive_failures: u32,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
        }
    }

    /// Record a successful connection (resets backoff)
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Record a failure and return the delay before next retry, or None if max retries exceeded
    pub fn record_failure(&mut self) -> Option<Duration> {
        let attempt = self.consecutive_failures;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.config.max_retries > 0 && self.consecutive_failures > self.config.max_retries {
            return None;
        }

        Some(self.delay_for(attempt))
    }

    /// Delay for a zero-based attempt counter
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.config
            .initial_delay
            .checked_mul(factor)
            .map_or(self.config.max_delay, |d| d.min(self.config.max_delay))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

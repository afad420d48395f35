//! Exponential backoff policy for webhook redelivery, keyed on a row's
//! accumulated failure count.

use std::time::Duration;

/// Configuration for the redelivery backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial backoff delay after the first failure.
    pub initial_backoff: Duration,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff: Duration,
    /// Multiplier applied per accumulated failure.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Stateless backoff policy — computes the delay before re-attempting a row
/// that has already failed `failures` times.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before attempting a row with the given failure count.
    /// Zero failures means a fresh row: no delay.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.config.initial_backoff.as_millis() as f64
            * self.config.multiplier.powi(failures.saturating_sub(1) as i32);
        let capped = base_ms.min(self.config.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

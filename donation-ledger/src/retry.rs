//! Backoff between optimistic retry attempts
//!
//! Exponential backoff with jitter. Attempts contending on one donation or one
//! campaign spread out instead of colliding again on the next tick.

use crate::config::RetryConfig;
use std::time::Duration;

/// Retry schedule derived from [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create new policy
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Attempts of a whole transition
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// CAS attempts on a campaign aggregate
    pub fn aggregate_max_attempts(&self) -> u32 {
        self.config.aggregate_max_attempts
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16) as i32;
        let base_delay =
            self.config.initial_backoff_ms as f64 * self.config.backoff_multiplier.powi(exponent);

        let capped_delay = base_delay.min(self.config.max_backoff_ms as f64);

        let jitter_range = capped_delay * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_micros((final_delay * 1000.0) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

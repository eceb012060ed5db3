use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with symmetric jitter for transient worker failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub factor: f64,
    pub jitter: f64,
    pub cap_ms: u64,
}

impl RetryPolicy {
    /// Delay before attempt `attempts + 1`, given `attempts` already failed.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exp = (self.base_ms as f64) * self.factor.powi(attempts.saturating_sub(1) as i32);
        let capped = exp.min(self.cap_ms as f64);
        let spread = (rand::rng().random::<f64>() * 2.0 - 1.0) * self.jitter;
        // cap wins over base when the two are inverted
        let delay = (capped * (1.0 + spread))
            .max(self.base_ms as f64)
            .min(self.cap_ms as f64);
        Duration::from_millis(delay as u64)
    }

    pub fn allowed(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_ms: 50,
            factor: 2.0,
            jitter: 0.3,
            cap_ms: 5_000,
        }
    }
}

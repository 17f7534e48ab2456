//! Reconnection backoff with uniform jitter.

use rand::Rng;
use std::time::Duration;

/// Delay between reconnection attempts: `min(min + U[0, jitter], max)`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub min: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(2),
            max: Duration::from_secs(30),
            jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self) -> Duration {
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            let jitter_ms = rand::rng().random_range(0..=self.jitter.as_millis() as u64);
            Duration::from_millis(jitter_ms)
        };
        (self.min + jitter).min(self.max)
    }
}

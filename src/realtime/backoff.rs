//! Exponential reconnect backoff with relative jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    config: BackoffConfig,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// `min(max, base * 2^attempt)` without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.config.base.saturating_mul(factor).min(self.config.max)
    }

    /// Jittered delay before retry number `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::rng())
    }

    /// Jittered delay using the supplied RNG. Never exceeds the configured cap.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = rng.random_range(-jitter..=jitter);
        let secs = (base.as_secs_f64() * (1.0 + spread)).max(0.0);
        Duration::from_secs_f64(secs).min(self.config.max)
    }
}

#[cfg(test)]
#[path = "backoff_test.rs"]
mod tests;

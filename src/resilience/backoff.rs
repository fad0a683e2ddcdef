// ABOUTME: Exponential backoff with bounded random jitter for connect retries

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Retry delay calculator
///
/// `delay(attempt) = min(base * 2^attempt, max) + U[0, jitter * that]`
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackoff {
    /// Delay after the first failed attempt
    base: Duration,

    /// Cap on the exponential part
    max: Duration,

    /// Jitter as a fraction of the capped delay, clamped to [0, 1]
    jitter_factor: f64,
}

impl RetryBackoff {
    /// Create a backoff calculator
    pub fn new(base: Duration, max: Duration, jitter_factor: f64) -> Self {
        let jitter_factor = if jitter_factor.is_finite() {
            jitter_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            base,
            max,
            jitter_factor,
        }
    }

    /// Build from retry configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.base_retry_delay,
            config.max_retry_delay,
            config.retry_jitter_factor,
        )
    }

    /// Exponential delay for a 0-indexed attempt, before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        // Use saturating arithmetic to prevent overflow
        let multiplier = 2u64.saturating_pow(attempt);
        let base_millis = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_millis.saturating_mul(multiplier));

        std::cmp::min(delay, self.max)
    }

    /// Jittered delay to sleep after the given failed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Jittered delay using a caller-supplied RNG
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_factor <= 0.0 || base.is_zero() {
            return base;
        }
        let jitter = rng.gen_range(0.0..=self.jitter_factor);
        base + base.mul_f64(jitter)
    }

    /// Inclusive range every `delay(attempt)` falls into
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        let base = self.base_delay(attempt);
        (base, base + base.mul_f64(self.jitter_factor))
    }
}

//! Exponential retry backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Retry schedule: `min(base · 2^attempt, max) + 10% jitter`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max_delay: Duration,
    /// Additive jitter as a fraction of the computed delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.10,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Deterministic part of the delay for a 0-indexed attempt.
    ///
    /// `extra_doublings` shifts the schedule further out (rate-limit replies
    /// ask for one extra doubling).
    pub fn raw_delay(&self, attempt: u32, extra_doublings: u32) -> Duration {
        let exponent = attempt.saturating_add(extra_doublings).min(16);
        let multiplier = 2u32.saturating_pow(exponent);
        self.base
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Full delay including jitter.
    pub fn delay(&self, attempt: u32, extra_doublings: u32) -> Duration {
        let raw = self.raw_delay(attempt, extra_doublings);
        let jitter_cap = (raw.as_millis() as f64 * self.jitter_ratio) as u64;
        if jitter_cap == 0 {
            return raw;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
        raw + Duration::from_millis(jitter)
    }
}

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with bounded multiplicative jitter.
///
/// Delay `n` is `min * 2^n * (1 + j)` with `j` drawn from `[0, jitter]`,
/// capped at `max`. Keeping `jitter < 1` means consecutive delays grow
/// strictly until the cap is reached.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub const DEFAULT_JITTER: f64 = 0.25;

    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            jitter: Self::DEFAULT_JITTER,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.99);
        self
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2_u32.saturating_pow(self.attempt);
        let base = self.min.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = rand::thread_rng().gen_range(0.0..=self.jitter);
        let extra = Duration::from_nanos((base.as_nanos() as f64 * jitter) as u64);
        base.saturating_add(extra).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

use std::time::Duration;

/// Bounded reconnection schedule for the push session.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomly added or removed (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnection attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with_random(attempt, rand::random::<f64>())
    }

    /// Exponential backoff `base * 2^(attempt-1)`, capped at `max_delay`,
    /// scaled by `1 ± jitter_factor`. `random` must be in `[0, 1)`.
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = self.base_delay.as_millis() as u64;
        let capped = base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay.as_millis() as u64);

        let jitter = 1.0 + (random * 2.0 - 1.0) * self.jitter_factor.clamp(0.0, 1.0);
        Duration::from_millis(((capped as f64) * jitter).round() as u64)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

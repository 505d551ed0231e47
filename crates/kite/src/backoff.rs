//! Dial-forever policy with jittered exponential back-off.

use rand::Rng;
use std::time::Duration;

/// Controls how a client redials after a connection drop. Attempts
/// never stop; the delay just keeps growing to the cap.
#[derive(Debug, Clone)]
pub struct DialBackoff {
    /// Delay before the first redial attempt.
    pub initial_delay: Duration,
    /// Ceiling for the computed delay.
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub factor: f64,
}

impl Default for DialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            factor: 1.5,
        }
    }
}

impl DialBackoff {
    /// Delay for the given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.factor.powi(attempt.min(1000) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        // ~10% random jitter so clients that lost the same server do
        // not redial in lockstep.
        let jitter = capped_ms * 0.1 * rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_millis((capped_ms + jitter) as u64)
    }
}

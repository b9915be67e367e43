//! Exponential backoff for batch delivery retries.

use std::time::Duration;

/// Backoff schedule: `initial * factor^(attempt-1)`, capped at `max`, with a
/// multiplicative jitter spread applied after the cap.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            jitter: 0.0,
        }
    }

    /// Schedule used for ingestion deliveries: doubling from the configured
    /// base delay, 25% jitter, never more than 30 seconds between attempts.
    pub fn for_delivery(base_delay: Duration) -> Self {
        Self {
            initial: base_delay,
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.25,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let scaled = self.initial.as_secs_f64() * self.factor.powi(exponent);
        let capped = scaled.min(self.max.as_secs_f64());

        let spread = if self.jitter > 0.0 {
            // Uniform in [1 - jitter, 1 + jitter].
            1.0 - self.jitter + rand::random::<f64>() * self.jitter * 2.0
        } else {
            1.0
        };

        Duration::from_secs_f64((capped * spread).max(0.0))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::for_delivery(Duration::from_millis(500))
    }
}

//! Exponential backoff with jitter.
//!
//! Shared by the runtime adapter's bounded retries and the health prober's
//! polling cadence.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound for any single delay (before jitter).
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0), applied as +/- a fraction of the delay.
    pub jitter: f64,

    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(5),
            jitter: 0.25,
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(30) as i32);
        let delay = (self.base.as_secs_f64() * exp).min(self.max.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + rand::rng().random_range(-jitter..=jitter)
        } else {
            1.0
        };

        Duration::from_secs_f64((delay * factor).max(0.0))
    }
}

//! # Backoff Schedule
//!
//! Exponential retry-delay calculation for failed batch flushes.
//!
//! The schedule grows the delay as `base * multiplier^attempt`, capped at a
//! configured maximum, with optional bounded jitter to prevent thundering
//! herd when many writers retry against the same sink.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry-delay calculation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSchedule {
    /// Base delay for the first retry
    pub base: Duration,
    /// Exponential multiplier applied per attempt (default: 2.0)
    pub multiplier: f64,
    /// Maximum delay cap to prevent unbounded growth
    pub max: Duration,
    /// Whether to randomize delays to prevent thundering herd
    pub jitter_enabled: bool,
    /// Maximum jitter fraction (0.0 to 1.0) applied around the delay
    pub max_jitter: f64,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
            jitter_enabled: false,
            max_jitter: 0.1, // 10% jitter when enabled
        }
    }
}

impl BackoffSchedule {
    /// Delay before retry number `attempt` (1-based: the first retry is attempt 1)
    ///
    /// Attempt 0 is the initial submission and carries no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let exponential = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = exponential.min(self.max.as_secs_f64());

        let seconds = if self.jitter_enabled {
            self.apply_jitter(capped)
        } else {
            capped
        };

        Duration::from_secs_f64(seconds.max(0.0))
    }

    /// Apply bounded random jitter around a delay
    fn apply_jitter(&self, delay_seconds: f64) -> f64 {
        let jitter_range = delay_seconds * self.max_jitter.clamp(0.0, 1.0);
        if jitter_range <= 0.0 {
            return delay_seconds;
        }
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        delay_seconds + jitter
    }
}

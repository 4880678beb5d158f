//! Retry backoff.
//!
//! Full jitter, per the design: `delay = rand(0, base * 2^(attempts-1))`,
//! capped at `max_backoff`. Unlike a symmetric +/- jitter around the
//! computed delay, full jitter draws uniformly from zero up to the
//! exponential ceiling, which spreads retries out more and avoids
//! thundering-herd re-offers after a shared failure.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max_backoff: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max_backoff: Duration) -> Self {
        Self { base, max_backoff }
    }

    /// `attempts` is the 1-indexed attempt count that just failed; the
    /// ceiling for the draw is `base * 2^(attempts-1)`, capped at
    /// `max_backoff`.
    pub fn calculate_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let ceiling_secs = self
            .base
            .as_secs_f64()
            .mul_add(2f64.powi(exponent as i32), 0.0)
            .min(self.max_backoff.as_secs_f64());

        if ceiling_secs <= 0.0 {
            return Duration::ZERO;
        }

        let draw = rand::thread_rng().gen_range(0.0..=ceiling_secs);
        Duration::from_secs_f64(draw)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// One recorded retry, kept on the job's in-memory history for
/// observability; not persisted anywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error: String,
    pub delay: Duration,
    pub attempted_at: chrono::DateTime<chrono::Utc>,
}

impl RetryAttempt {
    pub fn new(attempt: u32, error: impl Into<String>, delay: Duration) -> Self {
        Self {
            attempt,
            error: error.into(),
            delay,
            attempted_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RetryHistory {
    pub attempts: Vec<RetryAttempt>,
}

impl RetryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_attempt(&mut self, attempt: RetryAttempt) {
        self.attempts.push(attempt);
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn total_delay(&self) -> Duration {
        self.attempts.iter().map(|a| a.delay).sum()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.attempts.last().map(|a| a.error.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_the_computed_ceiling() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for attempts in 1..=10 {
            let exponent = attempts - 1;
            let ceiling = (1.0f64 * 2f64.powi(exponent)).min(60.0);
            for _ in 0..50 {
                let delay = backoff.calculate_delay(attempts);
                assert!(delay.as_secs_f64() <= ceiling + f64::EPSILON);
                assert!(delay.as_secs_f64() >= 0.0);
            }
        }
    }

    #[test]
    fn delay_is_capped_at_max_backoff() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5));
        for _ in 0..50 {
            let delay = backoff.calculate_delay(20);
            assert!(delay.as_secs_f64() <= 5.0 + f64::EPSILON);
        }
    }

    #[test]
    fn first_attempt_ceiling_equals_base() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(60));
        for _ in 0..50 {
            let delay = backoff.calculate_delay(1);
            assert!(delay.as_secs_f64() <= 2.0 + f64::EPSILON);
        }
    }

    #[test]
    fn retry_history_tracks_attempts() {
        let mut history = RetryHistory::new();
        history.add_attempt(RetryAttempt::new(1, "transient", Duration::from_secs(1)));
        assert_eq!(history.attempt_count(), 1);
        assert_eq!(history.last_error(), Some("transient"));
    }
}

//! Transport-error backoff for the feed connection.
//!
//! The delay for attempt `n` (1-based) is `initial * multiplier^(n-1)`,
//! capped at `max` and then jittered. A clean disconnect does not go
//! through here; it waits the fixed disconnect delay instead.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::FeedSettings;

/// Exponential backoff with jitter and an attempt budget.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff. `max_attempts` of 0 never gives up.
    #[must_use]
    pub const fn new(
        initial: Duration,
        max: Duration,
        multiplier: f64,
        jitter: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial,
            max,
            multiplier,
            jitter,
            max_attempts,
            attempts: 0,
        }
    }

    /// Backoff for the transport-error path of a feed.
    #[must_use]
    pub const fn from_feed_settings(settings: &FeedSettings) -> Self {
        Self::new(
            settings.reconnect_delay_initial,
            settings.reconnect_delay_max,
            settings.reconnect_delay_multiplier,
            settings.reconnect_jitter,
            settings.max_reconnect_attempts,
        )
    }

    /// Consume one attempt and return how long to wait before it, or `None`
    /// once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        self.attempts += 1;
        Some(self.jittered(self.base_delay(self.attempts)))
    }

    /// Un-jittered delay before attempt `attempt`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }

    /// Forget past attempts after a successful connect.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts consumed since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the attempt budget is spent.
    #[must_use]
    pub const fn exhausted(&self) -> bool {
        self.max_attempts > 0 && self.attempts >= self.max_attempts
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter;
        let offset: f64 = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.001))
    }
}

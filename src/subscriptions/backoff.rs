//! Retry pacing for data-insert subscriptions
//!
//! The scheduler never sleeps inside a tick. A failure instead pushes the
//! next allowed attempt into the future, doubling the delay each time.

use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_retries: Option<u32>,
    failures: u32,
}

impl RetryBackoff {
    /// `max_retries = None` retries forever
    pub fn new(initial_delay: Duration, max_delay: Duration, max_retries: Option<u32>) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_retries,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Record a failure; returns when the next attempt is allowed, or `None`
    /// once the retry limit is spent
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(max) = self.max_retries {
            if self.failures >= max {
                log::warn!("⛔ Retry limit of {} attempts reached", max);
                return None;
            }
        }

        let delay = self.delay(self.failures);
        self.failures += 1;

        log::warn!(
            "⏳ Retry attempt {} in {}ms",
            self.failures,
            delay.as_millis()
        );

        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        Some(now + delay)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

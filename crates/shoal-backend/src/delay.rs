//! Retry backoff.

use std::time::Duration;

/// Exponential backoff doubling from `min` to `max`.
///
/// The first call after a reset yields `min`; each later call doubles the
/// previous value, saturating at `max`.
#[derive(Debug)]
pub struct DelayExp2 {
    min: Duration,
    max: Duration,
    value: Duration,
}

impl DelayExp2 {
    pub fn new(min: Duration, max: Duration) -> DelayExp2 {
        DelayExp2 {
            min,
            max,
            value: Duration::ZERO,
        }
    }

    pub fn reset(&mut self) {
        self.value = Duration::ZERO;
    }

    /// The next delay to sleep before retrying.
    pub fn after(&mut self) -> Duration {
        self.value = (self.value * 2).clamp(self.min, self.max);
        self.value
    }
}

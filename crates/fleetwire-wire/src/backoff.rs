//! Exponential reconnect backoff.

use std::time::Duration;

/// Doubling delay between reconnect attempts, capped at a ceiling.
///
/// The N-th consecutive failure waits `min(initial * 2^(N-1), ceiling)`.
/// [`Backoff::reset`] after a successful connection brings the next wait
/// back to `initial`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(initial);
        Self {
            initial,
            ceiling,
            current: initial,
        }
    }

    /// The delay to wait now; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    /// The delay the next call to [`next_delay`](Self::next_delay) returns.
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

//! Reconnect backoff for feed connections.

use std::time::Duration;

/// Doublings before the delay stops growing regardless of the cap.
const MAX_EXPONENT: u32 = 16;

/// Exponential backoff, capped at `max`.
///
/// The first delay after a reset is `initial`; each further failure doubles
/// it until `max` is reached.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    /// Delay before the next attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(MAX_EXPONENT);
        self.attempt = self.attempt.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

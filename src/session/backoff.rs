//! Capped exponential reconnection backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Reconnection delay sequence: doubles from `initial` up to `max`, with up
/// to 25% random jitter added, never exceeding `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    current_ms: u64,
}

impl Backoff {
    /// Sequence starting at `initial`, capped at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial_ms = u64::try_from(initial.as_millis()).unwrap_or(u64::MAX).max(1);
        let max_ms = u64::try_from(max.as_millis())
            .unwrap_or(u64::MAX)
            .max(initial_ms);
        Self {
            initial_ms,
            max_ms,
            current_ms: initial_ms,
        }
    }

    /// Next delay to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_ms;
        self.current_ms = base.saturating_mul(2).min(self.max_ms);
        let jitter = rand::thread_rng().gen_range(0..=base.checked_div(4).unwrap_or(0));
        Duration::from_millis(base.saturating_add(jitter).min(self.max_ms))
    }

    /// Start over from the initial delay (after a healthy connection).
    pub fn reset(&mut self) {
        self.current_ms = self.initial_ms;
    }
}

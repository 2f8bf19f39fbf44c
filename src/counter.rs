use std::{
    fmt::{self, Debug},
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, Instant},
};

use crate::clock::{Clock, SystemClock};

/// Count bytes moved and tell the rate between two polls.
///
/// Each [`rate()`](Self::rate) call closes the current measurement window and
/// opens the next one. Polling every `T` therefore gives the average rate over
/// each `T`, not a long-run average.
pub struct RateCounter {
    clock: Arc<dyn Clock>,
    state: RwLock<CounterState>,
}

#[derive(Debug, Default, Clone, Copy)]
struct CounterState {
    count: u64,
    last_count: u64,
    /// Unset until the first `add()` or `rate()`.
    last_check: Option<Instant>,
}

impl RateCounter {
    /// Create a counter on the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Create a counter on a given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: RwLock::new(CounterState::default()),
        }
    }

    /// Record that `n` bytes moved.
    pub fn add(&self, n: u64) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        state.count += n;
        if state.last_check.is_none() {
            state.last_check = Some(self.clock.now());
        }
    }

    /// Bytes moved since creation.
    pub fn total(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .count
    }

    /// Bytes moved per `period` since previous call.
    ///
    /// A window of zero length has no rate: it returns `0.0` and keeps the
    /// window open, so those bytes are reported by the next call instead.
    pub fn rate(&self, period: Duration) -> f64 {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        // read clock after the lock acquired, or concurrent `add()` may land in the wrong window
        let now = self.clock.now();
        let between = state
            .last_check
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or_default();

        if between.is_zero() {
            state.last_check.get_or_insert(now);
            return 0.0;
        }

        let changed = state.count - state.last_count;
        let rate = changed as f64 * period.as_secs_f64() / between.as_secs_f64();

        state.last_count = state.count;
        state.last_check = Some(now);

        rate
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for RateCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.state.read().unwrap_or_else(PoisonError::into_inner);

        f.debug_struct("RateCounter")
            .field("count", &state.count)
            .field("last_count", &state.last_count)
            .field("last_check", &state.last_check)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::thread;

    #[test]
    fn total_accumulates() {
        let counter = RateCounter::new();
        counter.add(3);
        counter.add(0);
        counter.add(39);

        assert_eq!(counter.total(), 42);
    }

    #[test]
    fn rate_over_each_window() {
        let clock = MockClock::new();
        let counter = RateCounter::with_clock(Arc::new(clock.clone()));

        counter.add(1000);
        clock.advance(Duration::from_millis(500));
        assert_eq!(counter.rate(Duration::from_secs(1)), 2000.0);

        // previous poll consumed the window
        clock.advance(Duration::from_millis(500));
        assert_eq!(counter.rate(Duration::from_secs(1)), 0.0);

        counter.add(250);
        clock.advance(Duration::from_millis(250));
        assert_eq!(counter.rate(Duration::from_secs(2)), 2000.0);
        assert_eq!(counter.total(), 1250);
    }

    #[test]
    fn zero_length_window_defers() {
        let clock = MockClock::new();
        let counter = RateCounter::with_clock(Arc::new(clock.clone()));

        counter.add(100);
        assert_eq!(counter.rate(Duration::from_secs(1)), 0.0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(counter.rate(Duration::from_secs(1)), 100.0);
    }

    #[test]
    fn rate_before_any_add() {
        let clock = MockClock::new();
        let counter = RateCounter::with_clock(Arc::new(clock.clone()));

        assert_eq!(counter.rate(Duration::from_secs(1)), 0.0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(counter.rate(Duration::from_secs(1)), 0.0);
    }

    #[test]
    fn concurrent_add() {
        let counter = RateCounter::new();

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        counter.add(1);
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..100 {
                    counter.rate(Duration::from_secs(1));
                }
            });
        });

        assert_eq!(counter.total(), 4000);
    }
}

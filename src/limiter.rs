use std::{
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::clock::{Clock, SystemClock};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Limit bytes moved per time window ("batch").
///
/// Time is sliced into windows of `resolution` length. Each window allows at
/// most `floor(rate / floor(1s / resolution))` bytes; a caller who used up the
/// window must [`limit()`](Self::limit) until the next one begins.
///
/// ```text
/// b: bytes moved, w: waiting in limit()
///
/// caller:  |bbbbbb|w|bbbbbb|wwww|bb|bbbb|w|bbbbbb|...
///          | resolution | resolution | resolution |
///                             ^^^^
///                  budget changed by set_rate() in the middle of a window:
///                  already consumed bytes are kept, can_do() never below 0
/// ```
///
/// Smaller `resolution` means smaller bursts but more wake-ups.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    handle: RateHandle,

    /// Bytes consumed in current window.
    batch_done: u64,
    /// When current window started.
    last_batch: Instant,
}

impl RateLimiter {
    /// Create a limiter on the system clock.
    pub fn new(per_sec: u64, resolution: Duration) -> Self {
        Self::with_clock(per_sec, resolution, SystemClock::shared())
    }

    /// Create a limiter on a given clock. The first window starts now.
    pub fn with_clock(per_sec: u64, resolution: Duration, clock: Arc<dyn Clock>) -> Self {
        let last_batch = clock.now();

        Self {
            clock,
            handle: RateHandle::new(per_sec, resolution),
            batch_done: 0,
            last_batch,
        }
    }

    /// Bytes still allowed in current window. Never below zero.
    pub fn can_do(&self) -> usize {
        let remain = self.handle.max_per_batch().saturating_sub(self.batch_done);
        usize::try_from(remain).unwrap_or(usize::MAX)
    }

    /// Record `n` bytes consumed in current window.
    pub fn did(&mut self, n: usize) {
        self.batch_done = self.batch_done.saturating_add(n as u64);
    }

    /// Change the rate, from current window on.
    pub fn set_rate(&self, per_sec: u64) {
        self.handle.set_rate(per_sec);
    }

    /// Block until next window start, then open it with an empty consumption.
    ///
    /// A resolution too large to add to the window start never ends the
    /// window: the caller stays blocked.
    pub fn limit(&mut self) {
        match self.last_batch.checked_add(self.handle.resolution) {
            Some(next_batch) => {
                tracing::trace!(
                    wait = ?next_batch.saturating_duration_since(self.clock.now()),
                    consumed = self.batch_done,
                    "waiting for next batch"
                );
                self.clock.sleep_until(next_batch);
            }
            None => {
                tracing::trace!(
                    resolution = ?self.handle.resolution,
                    "next batch out of time range, waiting for good"
                );
                self.clock.sleep(Duration::MAX);
            }
        }

        self.last_batch = self.clock.now();
        self.batch_done = 0;
    }

    /// Configured bytes per second.
    pub fn rate(&self) -> u64 {
        self.handle.rate()
    }

    /// Length of one window.
    pub fn resolution(&self) -> Duration {
        self.handle.resolution
    }

    /// Budget of one window.
    pub fn max_per_batch(&self) -> u64 {
        self.handle.max_per_batch()
    }

    /// A handle to change this limiter's rate from another thread.
    pub fn handle(&self) -> RateHandle {
        self.handle.clone()
    }
}

impl Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate", &self.handle.rate())
            .field("resolution", &self.handle.resolution)
            .field("batch_done", &self.batch_done)
            .field("last_batch", &self.last_batch)
            .finish()
    }
}

/// Shared rate knob of a [`RateLimiter`].
///
/// Changes are picked up by the limiter on its next budget check; a transfer
/// already in the middle of a window keeps its consumption.
#[derive(Debug, Clone)]
pub struct RateHandle {
    per_sec: Arc<AtomicU64>,
    resolution: Duration,
}

impl RateHandle {
    fn new(per_sec: u64, resolution: Duration) -> Self {
        Self {
            per_sec: Arc::new(AtomicU64::new(per_sec)),
            resolution,
        }
    }

    /// Replace the rate in bytes per second.
    pub fn set_rate(&self, per_sec: u64) {
        self.per_sec.store(per_sec, Ordering::Release);
    }

    /// Current rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.per_sec.load(Ordering::Acquire)
    }

    /// Current budget of one window.
    pub fn max_per_batch(&self) -> u64 {
        batch_budget(self.rate(), self.resolution)
    }
}

/// `floor(per_sec / floor(1s / resolution))`.
///
/// A zero resolution, or a rate under one byte per window, gives a zero budget.
/// Windows longer than a second (no whole window count per second) get
/// `per_sec * resolution / 1s`.
fn batch_budget(per_sec: u64, resolution: Duration) -> u64 {
    let resolution_ns = resolution.as_nanos();
    if resolution_ns == 0 {
        return 0;
    }

    let batches_per_sec = NANOS_PER_SEC / resolution_ns;
    let budget = match batches_per_sec {
        0 => u128::from(per_sec) * resolution_ns / NANOS_PER_SEC,
        n => u128::from(per_sec) / n,
    };

    u64::try_from(budget).unwrap_or(u64::MAX)
}

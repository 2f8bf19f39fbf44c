//! Time sources.
//!
//! Every timing-sensitive type in this crate takes an `Arc<dyn Clock>` at
//! construction. [`SystemClock`] is the default; [`MockClock`] lets tests move
//! time forward by hand, so rate and profiling logic can be checked without
//! real sleeps.

use std::{
    fmt::Debug,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

/// A source of "now" which can also put the current thread to sleep.
pub trait Clock: Debug + Send + Sync {
    /// Current time point.
    fn now(&self) -> Instant;

    /// Block current thread for `duration`.
    fn sleep(&self, duration: Duration);

    /// Block current thread until `deadline`.
    ///
    /// Return immediately if `deadline` already passed. Periodic work (like the
    /// sampling profiler's monitor) ticks by calling this with evenly spaced
    /// deadlines, so that slow wake-ups do not accumulate drift.
    fn sleep_until(&self, deadline: Instant) {
        if let Some(remain) = deadline.checked_duration_since(self.now()) {
            self.sleep(remain);
        }
    }

    /// Block current thread until `deadline` or until `interrupt` fires,
    /// whichever comes first. `None` waits for the interrupt only.
    ///
    /// Return `true` if woken by the interrupt.
    ///
    /// The default implementation can only be interrupted when there is no
    /// deadline; clocks able to wake a sleeper early should override it.
    fn sleep_until_interrupted(&self, deadline: Option<Instant>, interrupt: &Interrupt) -> bool {
        match deadline {
            Some(deadline) => {
                self.sleep_until(deadline);
                interrupt.is_fired()
            }
            None => interrupt.wait_until(None),
        }
    }
}

/// One-shot signal which wakes threads inside
/// [`Clock::sleep_until_interrupted()`].
#[derive(Debug, Default)]
pub struct Interrupt {
    fired: Mutex<bool>,
    woken: Condvar,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every current and future sleeper.
    pub fn fire(&self) {
        *self.lock() = true;
        self.woken.notify_all();
    }

    pub fn is_fired(&self) -> bool {
        *self.lock()
    }

    /// Wait on the wall clock until fired or `deadline` passed. Return `true`
    /// if fired.
    pub(crate) fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut fired = self.lock();

        loop {
            if *fired {
                return true;
            }

            fired = match deadline {
                None => self
                    .woken
                    .wait(fired)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remain = match deadline.checked_duration_since(Instant::now()) {
                        Some(remain) if !remain.is_zero() => remain,
                        _ => return false,
                    };
                    self.woken
                        .wait_timeout(fired, remain)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.fired.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wall clock, backed by [`Instant::now()`] and [`thread::sleep()`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }

    /// A system clock ready to be handed to constructors.
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }

    fn sleep_until_interrupted(&self, deadline: Option<Instant>, interrupt: &Interrupt) -> bool {
        interrupt.wait_until(deadline)
    }
}

/// Clock which only moves when told to.
///
/// `sleep()` on a `MockClock` blocks until other threads [`advance()`](Self::advance)
/// the clock past the sleeper's deadline. All clones share the same time.
///
/// # Example
///
/// ```
/// use iorate::clock::{Clock, MockClock};
/// use std::time::Duration;
///
/// let clock = MockClock::new();
/// let start = clock.now();
///
/// let sleeper = {
///     let clock = clock.clone();
///     std::thread::spawn(move || clock.sleep(Duration::from_millis(5)))
/// };
///
/// while !sleeper.is_finished() {
///     if clock.sleepers() > 0 {
///         clock.advance(Duration::from_millis(1));
///     }
///     std::thread::yield_now();
/// }
///
/// assert!(clock.now() >= start + Duration::from_millis(5));
/// ```
#[derive(Debug, Clone)]
pub struct MockClock {
    inner: Arc<MockInner>,
}

#[derive(Debug)]
struct MockInner {
    state: Mutex<MockState>,
    changed: Condvar,
}

#[derive(Debug)]
struct MockState {
    now: Instant,
    /// Deadlines of threads currently inside `sleep()`, `None` for a sleep
    /// with no end.
    deadlines: Vec<Option<Instant>>,
}

/// How often an interruptible mock sleeper looks at its interrupt.
const INTERRUPT_POLL: Duration = Duration::from_millis(1);

impl MockClock {
    /// Create a mock clock frozen at the current instant.
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Create a mock clock frozen at `start`.
    pub fn starting_at(start: Instant) -> Self {
        Self {
            inner: Arc::new(MockInner {
                state: Mutex::new(MockState {
                    now: start,
                    deadlines: Vec::new(),
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Move time forward and wake every sleeper whose deadline is reached.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.lock();
        state.now += duration;
        drop(state);

        self.inner.changed.notify_all();
    }

    /// How many threads are blocked in `sleep()` with a deadline still ahead.
    ///
    /// A sleeper stops counting the moment the clock reaches its deadline, even
    /// before its thread gets scheduled again. Tests use this to advance time
    /// only once the threads they drive have settled into their next wait.
    pub fn sleepers(&self) -> usize {
        let state = self.lock();
        state
            .deadlines
            .iter()
            .filter(|d| d.map_or(true, |d| d > state.now))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until mock time reaches `deadline` or `interrupt` fires.
    fn wait(
        &self,
        mut state: MutexGuard<'_, MockState>,
        deadline: Option<Instant>,
        interrupt: Option<&Interrupt>,
    ) -> bool {
        state.deadlines.push(deadline);

        let fired = loop {
            if interrupt.map_or(false, Interrupt::is_fired) {
                break true;
            }
            if deadline.map_or(false, |d| state.now >= d) {
                break false;
            }

            // advance() notifies, an interrupt does not: poll it
            state = match interrupt {
                None => self
                    .inner
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(_) => {
                    self.inner
                        .changed
                        .wait_timeout(state, INTERRUPT_POLL)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        };

        if let Some(pos) = state.deadlines.iter().position(|d| *d == deadline) {
            state.deadlines.swap_remove(pos);
        }

        fired
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.lock().now
    }

    fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }

        let state = self.lock();
        // past the end of representable time: never wakes
        let deadline = state.now.checked_add(duration);
        self.wait(state, deadline, None);
    }

    fn sleep_until_interrupted(&self, deadline: Option<Instant>, interrupt: &Interrupt) -> bool {
        let state = self.lock();
        self.wait(state, deadline, Some(interrupt))
    }
}

/// Run `f` on a scoped thread, advancing `clock` by `step` each time at least
/// `sleepers` threads wait on it, until `f` returns.
#[cfg(test)]
pub(crate) fn drive<T, F>(clock: &MockClock, sleepers: usize, step: Duration, f: F) -> T
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    thread::scope(|s| {
        let handle = s.spawn(f);
        while !handle.is_finished() {
            if clock.sleepers() >= sleepers {
                clock.advance(step);
            } else {
                thread::yield_now();
            }
        }
        handle.join().unwrap()
    })
}

use std::{
    collections::HashMap,
    fmt::{self, Debug},
    io::{self, Read, Write},
    marker::PhantomData,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use std_semaphore::Semaphore;

use crate::{
    clock::{Clock, SystemClock},
    limiter::RateHandle,
    throttle::{ThrottledReader, ThrottledWriter},
};

/// Create [`ThrottledWriter`]s which, all together, do not exceed one rate.
///
/// Every writer given out by [`get()`](Self::get) gets an equal share of the
/// pool rate. Shares are recomputed whenever a writer joins or leaves the pool,
/// or the pool rate changes:
///
/// ```text
/// WriterPool (rate: 12 KiB/s)
///  |
///  +-- get() -> writer 1    12 KiB/s
///  |
///  +-- get() -> writer 1     6 KiB/s
///  |           writer 2      6 KiB/s
///  |
///  +-- get() -> writer 1     4 KiB/s
///  |           writer 2      4 KiB/s
///  |           writer 3      4 KiB/s
///  |
///  +-- writer 2 released
///              writer 1      6 KiB/s
///              writer 3      6 KiB/s
/// ```
///
/// Shares are `floor(rate / writers)`, the remainder is left unused. A writer
/// already in the middle of a window may use its old share until the window
/// ends.
///
/// # Example
///
/// ```
/// use iorate::{WriterPool, KiB, MiB};
/// use std::{io::{self, Write}, thread, time::Duration};
///
/// let pool = WriterPool::new(MiB, Duration::from_millis(5));
///
/// thread::scope(|s| {
///     for _ in 0..4 {
///         s.spawn(|| {
///             // 256 KiB/s each while all 4 are out
///             let mut writer = pool.get(io::sink());
///             writer.write_all(&[0; 16 * KiB as usize]).unwrap();
///         });
///     }
/// });
///
/// assert_eq!(pool.len(), 0);
/// ```
pub struct WriterPool {
    shared: Arc<Shared>,
}

/// Create [`ThrottledReader`]s which, all together, do not exceed one rate.
///
/// Work the same way as [`WriterPool`], on the read side.
pub struct ReaderPool {
    shared: Arc<Shared>,
}

macro_rules! pool_common {
    ($pool:ident, $pooled:ident, $throttled:ident) => {
        impl $pool {
            /// Create a pool with a total rate in bytes per second and the
            /// `resolution` of its throttles.
            pub fn new(per_sec: u64, resolution: Duration) -> Self {
                Self::from_shared(Shared::new(
                    per_sec,
                    resolution,
                    SystemClock::shared(),
                    None,
                ))
            }

            /// Start to create a pool by [`PoolBuilder`].
            pub fn builder() -> PoolBuilder<$pool> {
                PoolBuilder::default()
            }

            /// Wrap `inner` in a throttle of this pool.
            ///
            /// The throttle is a member of the pool until it is released or
            /// dropped. If the pool has a member limit and it is reached, block
            /// until some member leaves.
            pub fn get<T>(&self, inner: T) -> $pooled<T> {
                // the actual rate is set when joining the pool
                let throttled = $throttled::with_clock(
                    inner,
                    0,
                    self.shared.resolution,
                    Arc::clone(&self.shared.clock),
                );
                let membership = self.shared.join(throttled.rate_handle());

                $pooled {
                    throttled,
                    membership,
                }
            }

            /// Set the pool rate, updating the share of each member.
            /// Return the old rate.
            pub fn set_rate(&self, per_sec: u64) -> u64 {
                self.shared.set_rate(per_sec)
            }

            /// Current pool rate in bytes per second.
            pub fn rate(&self) -> u64 {
                self.shared.lock().max_rate
            }

            /// Resolution of the throttles given out.
            pub fn resolution(&self) -> Duration {
                self.shared.resolution
            }

            /// Number of members currently given out.
            pub fn len(&self) -> usize {
                self.shared.lock().given_out.len()
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            fn from_shared(shared: Arc<Shared>) -> Self {
                Self { shared }
            }
        }

        impl Debug for $pool {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let state = self.shared.lock();

                f.debug_struct(stringify!($pool))
                    .field("rate", &state.max_rate)
                    .field("resolution", &self.shared.resolution)
                    .field("members", &state.given_out.len())
                    .finish()
            }
        }

        impl<T> $pooled<T> {
            /// Current share of the pool rate, in bytes per second.
            pub fn rate(&self) -> u64 {
                self.throttled.rate()
            }

            /// Leave the pool and give back the wrapped stream.
            ///
            /// Dropping the pooled stream leaves the pool as well.
            pub fn release(self) -> T {
                let Self {
                    throttled,
                    membership,
                } = self;
                drop(membership);

                throttled.into_inner()
            }

            pub fn get_ref(&self) -> &T {
                self.throttled.get_ref()
            }

            pub fn get_mut(&mut self) -> &mut T {
                self.throttled.get_mut()
            }
        }

        impl<T> Debug for $pooled<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($pooled))
                    .field("throttled", &self.throttled)
                    .field("member_id", &self.membership.id)
                    .finish()
            }
        }
    };
}

/// A [`ThrottledWriter`] given out by a [`WriterPool`].
///
/// Its rate is owned by the pool, so it cannot be changed from here.
pub struct PooledWriter<W> {
    throttled: ThrottledWriter<W>,
    membership: Membership,
}

/// A [`ThrottledReader`] given out by a [`ReaderPool`].
///
/// Its rate is owned by the pool, so it cannot be changed from here.
pub struct PooledReader<R> {
    throttled: ThrottledReader<R>,
    membership: Membership,
}

pool_common!(WriterPool, PooledWriter, ThrottledWriter);
pool_common!(ReaderPool, PooledReader, ThrottledReader);

impl<W: Write> Write for PooledWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.throttled.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.throttled.flush()
    }
}

impl<R: Read> Read for PooledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.throttled.read(buf)
    }
}

struct Shared {
    state: Mutex<PoolState>,
    resolution: Duration,
    clock: Arc<dyn Clock>,
    /// Member quota, if limited.
    slots: Option<Semaphore>,
}

struct PoolState {
    max_rate: u64,
    given_out: HashMap<u64, RateHandle>,
    next_id: u64,
}

impl Shared {
    fn new(
        max_rate: u64,
        resolution: Duration,
        clock: Arc<dyn Clock>,
        slots: Option<Semaphore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                max_rate,
                given_out: HashMap::new(),
                next_id: 0,
            }),
            resolution,
            clock,
            slots,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join(self: &Arc<Self>, handle: RateHandle) -> Membership {
        // occupying single member quota, released in `leave()`
        if let Some(slots) = &self.slots {
            slots.acquire();
        }

        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.given_out.insert(id, handle);
        state.set_shared_rates();

        Membership {
            shared: Arc::clone(self),
            id,
        }
    }

    fn leave(&self, id: u64) {
        let mut state = self.lock();

        // leaving twice is a no-op
        if state.given_out.remove(&id).is_none() {
            return;
        }
        state.set_shared_rates();
        drop(state);

        if let Some(slots) = &self.slots {
            slots.release();
        }
    }

    fn set_rate(&self, max_rate: u64) -> u64 {
        let mut state = self.lock();
        let old = state.max_rate;
        state.max_rate = max_rate;
        state.set_shared_rates();

        old
    }
}

impl PoolState {
    fn set_shared_rates(&self) {
        if self.given_out.is_empty() {
            return;
        }

        let per_member = self.max_rate / self.given_out.len() as u64;
        for handle in self.given_out.values() {
            handle.set_rate(per_member);
        }

        tracing::debug!(
            members = self.given_out.len(),
            per_member,
            pool_rate = self.max_rate,
            "pool rates rebalanced"
        );
    }
}

/// Pool membership of one throttle; leaving the pool when dropped.
struct Membership {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.shared.leave(self.id);
    }
}

/// Use to build a [`WriterPool`] or a [`ReaderPool`].
///
/// Created by [`WriterPool::builder()`] or [`ReaderPool::builder()`].
pub struct PoolBuilder<P> {
    rate: u64,
    resolution: Duration,
    clock: Option<Arc<dyn Clock>>,
    max_members: Option<u32>,
    phantom: PhantomData<P>,
}

impl<P> Default for PoolBuilder<P> {
    fn default() -> Self {
        Self {
            rate: u64::MAX,
            resolution: Duration::from_millis(10),
            clock: None,
            max_members: None,
            phantom: PhantomData,
        }
    }
}

impl<P> PoolBuilder<P> {
    /// Set total rate of the pool in bytes per second, default is `u64::MAX`
    /// (in effect, unlimited).
    pub fn rate(&mut self, per_sec: u64) -> &mut Self {
        self.rate = per_sec;
        self
    }

    /// Set resolution of the throttles in this pool, default is `10ms`.
    pub fn resolution(&mut self, resolution: Duration) -> &mut Self {
        self.resolution = resolution;
        self
    }

    /// Set clock of the throttles in this pool, default is [`SystemClock`].
    pub fn clock(&mut self, clock: Arc<dyn Clock>) -> &mut Self {
        self.clock = Some(clock);
        self
    }

    /// Set how many members may be given out at the same time. `get()` blocks
    /// while the pool is full. Default is no limit.
    pub fn max_members(&mut self, max_members: u32) -> &mut Self {
        self.max_members = Some(max_members);
        self
    }

    /// Return `None` if `max_members` == `0` or larger than `isize::MAX`.
    fn build_shared(&self) -> Option<Arc<Shared>> {
        let slots = match self.max_members {
            None => None,
            Some(0) => return None,
            Some(n) => Some(Semaphore::new(n.try_into().ok()?)),
        };

        Some(Shared::new(
            self.rate,
            self.resolution,
            self.clock.clone().unwrap_or_else(SystemClock::shared),
            slots,
        ))
    }
}

impl PoolBuilder<WriterPool> {
    /// Create a new [`WriterPool`] with current configuration.
    ///
    /// Return `None` if `max_members` == `0` or larger than `isize::MAX`.
    pub fn build(&self) -> Option<WriterPool> {
        self.build_shared().map(WriterPool::from_shared)
    }
}

impl PoolBuilder<ReaderPool> {
    /// Create a new [`ReaderPool`] with current configuration.
    ///
    /// Return `None` if `max_members` == `0` or larger than `isize::MAX`.
    pub fn build(&self) -> Option<ReaderPool> {
        self.build_shared().map(ReaderPool::from_shared)
    }
}

impl<P> Debug for PoolBuilder<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(&format!("PoolBuilder<{}>", std::any::type_name::<P>()))
            .field("rate", &self.rate)
            .field("resolution", &self.resolution)
            .field("max_members", &self.max_members)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KiB, MiB};
    use rayon::prelude::*;
    use std::thread;

    #[test]
    fn shares_follow_membership() {
        let pool = WriterPool::new(12 * KiB, Duration::from_millis(5));
        assert!(pool.is_empty());

        let w1 = pool.get(io::sink());
        assert_eq!(w1.rate(), 12 * KiB);

        let w2 = pool.get(io::sink());
        let w3 = pool.get(io::sink());
        assert_eq!(pool.len(), 3);
        for w in [&w1, &w2, &w3] {
            assert_eq!(w.rate(), 4 * KiB);
        }

        drop(w2);
        assert_eq!(pool.len(), 2);
        assert_eq!(w1.rate(), 6 * KiB);
        assert_eq!(w3.rate(), 6 * KiB);

        w1.release();
        assert_eq!(w3.rate(), 12 * KiB);

        w3.release();
        assert!(pool.is_empty());
    }

    #[test]
    fn share_is_floored() {
        let pool = ReaderPool::new(10_001, Duration::from_millis(5));
        let readers: Vec<_> = (0..3).map(|_| pool.get(io::empty())).collect();

        for r in &readers {
            assert_eq!(r.rate(), 3333);
        }
    }

    #[test]
    fn set_rate_returns_old() {
        let pool = WriterPool::new(10 * KiB, Duration::from_millis(5));

        // nothing to rebalance
        assert_eq!(pool.set_rate(20 * KiB), 10 * KiB);

        let w1 = pool.get(Vec::<u8>::new());
        let w2 = pool.get(Vec::<u8>::new());
        assert_eq!(pool.set_rate(MiB), 20 * KiB);
        assert_eq!(w1.rate(), MiB / 2);
        assert_eq!(w2.rate(), MiB / 2);
        assert_eq!(pool.rate(), MiB);
    }

    #[test]
    fn release_gives_back_stream() {
        let pool = WriterPool::new(MiB, Duration::from_millis(1));
        let mut writer = pool.get(Vec::new());

        writer.write_all(b"hello").unwrap();
        assert_eq!(writer.get_ref(), b"hello");
        assert_eq!(writer.release(), b"hello".to_vec());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn pool_reused_after_empty() {
        let pool = ReaderPool::new(MiB, Duration::from_millis(1));
        let data = [1u8; 100];

        for _ in 0..3 {
            let mut reader = pool.get(&data[..]);
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();

            assert_eq!(out, vec![1; 100]);
            assert_eq!(pool.len(), 1);
            drop(reader);
            assert_eq!(pool.len(), 0);
        }
    }

    #[test]
    fn membership_churn() {
        let pool = WriterPool::new(64 * MiB, Duration::from_millis(1));

        let written: usize = (0..64)
            .into_par_iter()
            .map(|i| {
                let mut writer = pool.get(Vec::new());
                writer.write_all(&vec![0; i * 100]).unwrap();
                writer.release().len()
            })
            .sum();

        assert_eq!(written, (0..64).map(|i| i * 100).sum::<usize>());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn builder_reject_zero_members() {
        assert!(WriterPool::builder().max_members(0).build().is_none());
        assert!(ReaderPool::builder().max_members(0).build().is_none());
    }

    #[test]
    fn builder_defaults() {
        let pool = ReaderPool::builder().build().unwrap();

        assert_eq!(pool.rate(), u64::MAX);
        assert_eq!(pool.resolution(), Duration::from_millis(10));
    }

    #[test]
    fn max_members_blocks_get() {
        let pool = WriterPool::builder()
            .rate(MiB)
            .resolution(Duration::from_millis(1))
            .max_members(1)
            .build()
            .unwrap();

        let first = pool.get(io::sink());

        thread::scope(|s| {
            let second = s.spawn(|| pool.get(io::sink()).rate());

            thread::sleep(Duration::from_millis(20));
            assert!(!second.is_finished());
            assert_eq!(pool.len(), 1);

            drop(first);
            assert_eq!(second.join().unwrap(), MiB);
        });

        assert_eq!(pool.len(), 0);
    }
}

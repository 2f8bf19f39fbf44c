//! Find out where a transfer spends its time: waiting on reads or on writes.
//!
//! Two flavors wrap a writer and reader pair:
//!
//! - [`profile()`] times every call. Exact, but costs two clock reads and an
//!   atomic add per call.
//! - [`profile_sampled()`] only flips a flag around every call, while a monitor
//!   thread looks at the flags once per `resolution`. Approximate, with close to
//!   no per-call cost; good for streams doing millions of tiny calls.
//!
//! ```
//! use iorate::profile;
//! use std::io;
//!
//! let src = [7u8; 4096];
//! let (mut writer, mut reader, prof) = profile(io::sink(), &src[..]);
//!
//! io::copy(&mut reader, &mut writer).unwrap();
//!
//! let result = prof.done();
//! assert!(result.wait_read + result.wait_write <= result.total);
//! ```

use std::{
    fmt::{self, Debug},
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::clock::{Clock, SystemClock};

pub mod sample;

pub use sample::{
    profile_sampled, profile_sampled_with_clock, SampleSession, SampleTally, SampledProfile,
    SampledReader, SampledWriter,
};

/// Time spent by a writer and reader pair.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeProfile {
    /// Wall time since the pair was wrapped.
    pub total: Duration,
    /// Time spent inside `read()`.
    pub wait_read: Duration,
    /// Time spent inside `write()`.
    pub wait_write: Duration,
}

impl TimeProfile {
    /// Share of the waiting time spent on reads, `None` if nothing waited.
    pub fn read_ratio(&self) -> Option<f64> {
        let waited = (self.wait_read + self.wait_write).as_secs_f64();
        if waited == 0.0 {
            None
        } else {
            Some(self.wait_read.as_secs_f64() / waited)
        }
    }
}

/// Wrap a writer and reader pair and time every call made on them.
///
/// The result comes from [`Profile::done()`], which can be called many times.
pub fn profile<W, R>(writer: W, reader: R) -> (TimedWriter<W>, TimedReader<R>, Profile) {
    profile_with_clock(SystemClock::shared(), writer, reader)
}

/// Same as [`profile()`], on a given clock.
pub fn profile_with_clock<W, R>(
    clock: Arc<dyn Clock>,
    writer: W,
    reader: R,
) -> (TimedWriter<W>, TimedReader<R>, Profile) {
    let timed_writer = TimedWriter {
        clock: Arc::clone(&clock),
        inner: writer,
        sum_ns: Arc::new(AtomicU64::new(0)),
    };
    let timed_reader = TimedReader {
        clock: Arc::clone(&clock),
        inner: reader,
        sum_ns: Arc::new(AtomicU64::new(0)),
    };

    let start = clock.now();
    let prof = Profile {
        wait_read: Arc::clone(&timed_reader.sum_ns),
        wait_write: Arc::clone(&timed_writer.sum_ns),
        clock,
        start,
    };

    (timed_writer, timed_reader, prof)
}

/// Result handle of [`profile()`].
pub struct Profile {
    clock: Arc<dyn Clock>,
    start: Instant,
    wait_read: Arc<AtomicU64>,
    wait_write: Arc<AtomicU64>,
}

impl Profile {
    /// Timings up to now.
    pub fn done(&self) -> TimeProfile {
        TimeProfile {
            total: self.clock.now().saturating_duration_since(self.start),
            wait_read: Duration::from_nanos(self.wait_read.load(Ordering::Relaxed)),
            wait_write: Duration::from_nanos(self.wait_write.load(Ordering::Relaxed)),
        }
    }
}

impl Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("start", &self.start)
            .field("wait_read_ns", &self.wait_read.load(Ordering::Relaxed))
            .field("wait_write_ns", &self.wait_write.load(Ordering::Relaxed))
            .finish()
    }
}

/// Reader half of [`profile()`].
pub struct TimedReader<R> {
    clock: Arc<dyn Clock>,
    inner: R,
    sum_ns: Arc<AtomicU64>,
}

/// Writer half of [`profile()`].
pub struct TimedWriter<W> {
    clock: Arc<dyn Clock>,
    inner: W,
    sum_ns: Arc<AtomicU64>,
}

impl<R> TimedReader<R> {
    /// Time spent reading so far.
    pub fn wait_read(&self) -> Duration {
        Duration::from_nanos(self.sum_ns.load(Ordering::Relaxed))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<W> TimedWriter<W> {
    /// Time spent writing so far.
    pub fn wait_write(&self) -> Duration {
        Duration::from_nanos(self.sum_ns.load(Ordering::Relaxed))
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<R: Read> Read for TimedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = self.clock.now();
        let result = self.inner.read(buf);
        add_elapsed(&self.sum_ns, self.clock.now(), start);

        result
    }
}

impl<W: Write> Write for TimedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let start = self.clock.now();
        let result = self.inner.write(buf);
        add_elapsed(&self.sum_ns, self.clock.now(), start);

        result
    }

    fn flush(&mut self) -> io::Result<()> {
        let start = self.clock.now();
        let result = self.inner.flush();
        add_elapsed(&self.sum_ns, self.clock.now(), start);

        result
    }
}

fn add_elapsed(sum_ns: &AtomicU64, now: Instant, start: Instant) {
    let elapsed = now.saturating_duration_since(start).as_nanos();
    sum_ns.fetch_add(
        u64::try_from(elapsed).unwrap_or(u64::MAX),
        Ordering::Relaxed,
    );
}

impl<R> Debug for TimedReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedReader")
            .field("wait_read", &self.wait_read())
            .finish()
    }
}

impl<W> Debug for TimedWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedWriter")
            .field("wait_write", &self.wait_write())
            .finish()
    }
}

/// Readers and writers built from closures, sleeping on a mock clock.
#[cfg(test)]
mod fixtures {
    use std::io::{self, Read, Write};

    pub struct ReadFn<F>(pub F);

    impl<F: FnMut(&mut [u8]) -> io::Result<usize>> Read for ReadFn<F> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            (self.0)(buf)
        }
    }

    pub struct WriteFn<F>(pub F);

    impl<F: FnMut(&[u8]) -> io::Result<usize>> Write for WriteFn<F> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            (self.0)(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{fixtures::*, *};
    use crate::clock::{self, MockClock};

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn precise_profile() {
        let clock = MockClock::new();
        let start = clock.now();
        let total = 2000 * MS;

        let sleep_read = ReadFn(|buf: &mut [u8]| {
            let eof = clock.now() - start >= total;
            clock.sleep(20 * MS);
            Ok(if eof { 0 } else { buf.len() })
        });
        let sleep_write = WriteFn(|buf: &[u8]| {
            clock.sleep(60 * MS);
            Ok(buf.len())
        });

        let got = clock::drive(&clock, 1, 5 * MS, || {
            let (mut w, mut r, prof) =
                profile_with_clock(Arc::new(clock.clone()), sleep_write, sleep_read);
            io::copy(&mut r, &mut w).unwrap();
            prof.done()
        });

        // 25 rounds of read + write, then one more read finding the end
        assert_eq!(
            got,
            TimeProfile {
                total: 2020 * MS,
                wait_read: 26 * 20 * MS,
                wait_write: 25 * 60 * MS,
            }
        );
    }

    #[test]
    fn done_is_repeatable() {
        let clock = MockClock::new();
        let (mut w, mut r, prof) =
            profile_with_clock(Arc::new(clock.clone()), Vec::new(), &b"abc"[..]);

        let first = prof.done();
        clock.advance(MS);
        io::copy(&mut r, &mut w).unwrap();
        let second = prof.done();

        assert_eq!(first.total, Duration::ZERO);
        assert_eq!(second.total, MS);
        assert_eq!(w.into_inner(), b"abc");
    }

    #[test]
    fn errors_still_timed() {
        let clock = MockClock::new();
        let failing = ReadFn(|_: &mut [u8]| {
            clock.sleep(3 * MS);
            Err(io::Error::new(io::ErrorKind::TimedOut, "slow"))
        });

        let (waited, result) = clock::drive(&clock, 1, MS, || {
            let (_, mut r, _) = profile_with_clock(Arc::new(clock.clone()), io::sink(), failing);
            let result = r.read(&mut [0; 8]);
            (r.wait_read(), result)
        });

        assert_eq!(waited, 3 * MS);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn read_ratio() {
        let prof = TimeProfile {
            total: 10 * MS,
            wait_read: MS,
            wait_write: 3 * MS,
        };
        assert_eq!(prof.read_ratio(), Some(0.25));
        assert_eq!(TimeProfile::default().read_ratio(), None);
    }
}

use std::{
    fmt::{self, Debug},
    io::{self, Read, Write},
    sync::Arc,
    time::Duration,
};

use crate::{
    clock::{Clock, SystemClock},
    limiter::{RateHandle, RateLimiter},
};

/// Keep reads from a stream under a rate of bytes per second.
///
/// Each `read()` is checked against the budget left in the current window of
/// `resolution` length. The smaller `resolution` is, the less bursty the
/// stream, but also the more overhead the throttling has.
///
/// A read larger than the remaining budget only gets the part which fits, then
/// waits for the next window and returns that short count; the caller reads
/// the rest on its next call.
///
/// # Example
///
/// ```
/// use iorate::{ThrottledReader, KiB};
/// use std::{io::Read, time::{Duration, Instant}};
///
/// let input = vec![42u8; 10 * KiB as usize];
/// let mut reader = ThrottledReader::new(input.as_slice(), 100 * KiB, Duration::from_millis(10));
///
/// let started = Instant::now();
/// let mut output = Vec::new();
/// reader.read_to_end(&mut output).unwrap();
///
/// assert_eq!(output, input);
/// assert!(started.elapsed() >= Duration::from_millis(50));
/// ```
pub struct ThrottledReader<R> {
    inner: R,
    limiter: RateLimiter,
}

/// Keep writes to a stream under a rate of bytes per second.
///
/// Unlike [`ThrottledReader`], one `write()` call keeps writing and waiting,
/// window after window, until the whole buffer is written or the wrapped
/// stream fails.
pub struct ThrottledWriter<W> {
    inner: W,
    limiter: RateLimiter,
}

macro_rules! throttled_common {
    ($name:ident) => {
        impl<T> $name<T> {
            /// Wrap a stream, throttling on the system clock.
            pub fn new(inner: T, per_sec: u64, resolution: Duration) -> Self {
                Self::with_clock(inner, per_sec, resolution, SystemClock::shared())
            }

            /// Wrap a stream, throttling on a given clock.
            pub fn with_clock(
                inner: T,
                per_sec: u64,
                resolution: Duration,
                clock: Arc<dyn Clock>,
            ) -> Self {
                Self {
                    inner,
                    limiter: RateLimiter::with_clock(per_sec, resolution, clock),
                }
            }

            /// Change the rate. Takes effect on the next budget check, an
            /// in-progress call is not interrupted.
            pub fn set_rate(&self, per_sec: u64) {
                self.limiter.set_rate(per_sec);
            }

            /// Current rate in bytes per second.
            pub fn rate(&self) -> u64 {
                self.limiter.rate()
            }

            pub(crate) fn rate_handle(&self) -> RateHandle {
                self.limiter.handle()
            }

            pub fn get_ref(&self) -> &T {
                &self.inner
            }

            pub fn get_mut(&mut self) -> &mut T {
                &mut self.inner
            }

            pub fn into_inner(self) -> T {
                self.inner
            }
        }

        impl<T> Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("limiter", &self.limiter)
                    .finish()
            }
        }
    };
}

throttled_common!(ThrottledReader);
throttled_common!(ThrottledWriter);

impl<R: Read> Read for ThrottledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let can_read = self.limiter.can_do();
            if buf.len() <= can_read {
                // no throttling needed
                let n = self.inner.read(buf)?;
                self.limiter.did(n);
                return Ok(n);
            }

            if can_read > 0 {
                // read what can be read for this batch, caller comes back for the rest
                let n = self.inner.read(&mut buf[..can_read])?;
                self.limiter.did(n);
                self.limiter.limit();
                return Ok(n);
            }

            // returning Ok(0) here would look like end of stream
            self.limiter.limit();
        }
    }
}

impl<W: Write> Write for ThrottledWriter<W> {
    /// If the wrapped stream fails after part of `buf` went through, the part
    /// already written is returned as a short write; the error is returned only
    /// when nothing was written in this call.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;

        loop {
            let rest = &buf[written..];
            let can_write = self.limiter.can_do();
            if rest.len() <= can_write {
                // no throttling needed
                let m = match self.inner.write(rest) {
                    Ok(m) => m,
                    Err(err) => return partial(written, err),
                };
                self.limiter.did(m);
                return Ok(written + m);
            }

            if can_write > 0 {
                // write what can be written for this batch
                let m = match self.inner.write(&rest[..can_write]) {
                    Ok(m) => m,
                    Err(err) => return partial(written, err),
                };
                self.limiter.did(m);
                written += m;

                if m == 0 {
                    return Ok(written);
                }
            }

            self.limiter.limit();
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn partial(written: usize, err: io::Error) -> io::Result<usize> {
    match written {
        0 => Err(err),
        n => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{self, Clock, MockClock},
        KiB,
    };
    use rand::RngCore;
    use std::io::Cursor;

    const MS: Duration = Duration::from_millis(1);

    /// Writer which accepts at most `cap` bytes, then fails.
    struct FailAfter {
        cap: usize,
        got: Vec<u8>,
    }

    impl Write for FailAfter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.cap - self.got.len();
            if room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "full"));
            }
            let n = room.min(buf.len());
            self.got.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn read_under_budget_never_waits() {
        // any wait on a mock clock nobody advances would hang
        let clock = MockClock::new();
        let mut reader = ThrottledReader::with_clock(
            Cursor::new(vec![1; 4096]),
            100 * KiB,
            10 * MS,
            Arc::new(clock.clone()),
        );

        let mut buf = [0; 1000];
        assert_eq!(reader.read(&mut buf).unwrap(), 1000);
        assert_eq!(reader.read(&mut buf[..24]).unwrap(), 24);
        assert_eq!(reader.read(&mut []).unwrap(), 0);
    }

    #[test]
    fn read_over_budget_is_partial() {
        let clock = MockClock::new();
        let start = clock.now();
        let mut reader = ThrottledReader::with_clock(
            Cursor::new(vec![1; 4096]),
            100 * KiB,
            10 * MS,
            Arc::new(clock.clone()),
        );

        let n = clock::drive(&clock, 1, MS, || {
            let mut buf = [0; 4096];
            reader.read(&mut buf).unwrap()
        });

        assert_eq!(n, 1024);
        assert_eq!(clock.now(), start + 10 * MS);
    }

    #[test]
    fn read_with_spent_budget_does_not_report_eof() {
        let clock = MockClock::new();
        let mut reader = ThrottledReader::with_clock(
            Cursor::new(vec![1; 4096]),
            100 * KiB,
            10 * MS,
            Arc::new(clock.clone()),
        );

        let mut buf = [0; 1024];
        assert_eq!(reader.read(&mut buf).unwrap(), 1024);

        let n = clock::drive(&clock, 1, MS, || reader.read(&mut buf).unwrap());
        assert_eq!(n, 1024);
    }

    #[test]
    fn write_loops_until_done() {
        let clock = MockClock::new();
        let start = clock.now();
        let mut writer =
            ThrottledWriter::with_clock(Vec::new(), 100 * KiB, 10 * MS, Arc::new(clock.clone()));

        let input = vec![9; 4096];
        let n = clock::drive(&clock, 1, MS, || writer.write(&input).unwrap());

        assert_eq!(n, 4096);
        assert_eq!(writer.get_ref(), &input);
        // 3 full windows waited, the 4th had room
        assert_eq!(clock.now(), start + 30 * MS);
    }

    #[test]
    fn write_error_keeps_partial_count() {
        let clock = MockClock::new();
        let mut writer = ThrottledWriter::with_clock(
            FailAfter {
                cap: 1500,
                got: Vec::new(),
            },
            100 * KiB,
            10 * MS,
            Arc::new(clock.clone()),
        );

        let n = clock::drive(&clock, 1, MS, || writer.write(&[5; 4096]).unwrap());
        assert_eq!(n, 1500);

        let err = writer.write(&[5; 10]).unwrap_err();
        assert_eq!(err.to_string(), "full");
        assert_eq!(writer.into_inner().got.len(), 1500);
    }

    #[test]
    fn set_rate_unblocks() {
        let writer = ThrottledWriter::new(Vec::new(), 0, 5 * MS);
        assert_eq!(writer.rate(), 0);

        let handle = writer.rate_handle();
        let mut writer = writer;

        std::thread::scope(|s| {
            let copy = s.spawn(|| writer.write_all(&[1; 64 * 1024]));

            std::thread::sleep(20 * MS);
            assert!(!copy.is_finished());

            handle.set_rate(64 * KiB * 1024);
            copy.join().unwrap().unwrap();
        });

        assert_eq!(writer.get_ref().len(), 64 * 1024);
        assert_eq!(writer.rate(), 64 * KiB * 1024);
    }

    #[test]
    fn read_all_keeps_content() {
        let mut input = vec![0; 64 * 1024];
        rand::thread_rng().fill_bytes(&mut input);

        let mut reader = ThrottledReader::new(input.as_slice(), 8 * KiB * 1024, MS);
        let mut output = Vec::new();
        reader.read_to_end(&mut output).unwrap();

        assert_eq!(output, input);
    }
}

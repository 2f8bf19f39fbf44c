//! Statistical profiling: a monitor thread samples "is a call in progress"
//! flags instead of timing each call.
//!
//! ```text
//! reader:  |rrrr|..........|rrrr|..........|rrrr|
//! writer:  .....|wwwwwwwwww|....|wwwwwwwwww|.....
//! monitor: ^  ^  ^  ^  ^  ^  ^  ^  ^  ^  ^  ^  ^    one look per resolution
//!
//! wait_read ~= total * (ticks seeing a read) / (all ticks)
//! ```

use std::{
    fmt::{self, Debug},
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    panic,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use super::TimeProfile;
use crate::clock::{Clock, Interrupt, SystemClock};

/// Sampling interval used in place of a zero resolution.
const MIN_RESOLUTION: Duration = Duration::from_millis(1);

/// Wrap a writer and reader pair, and start a monitor thread sampling their
/// state every `resolution`.
///
/// Fails only if the monitor thread can't be spawned.
pub fn profile_sampled<W, R>(
    writer: W,
    reader: R,
    resolution: Duration,
) -> io::Result<(SampledWriter<W>, SampledReader<R>, SampleSession)> {
    profile_sampled_with_clock(SystemClock::shared(), writer, reader, resolution)
}

/// Same as [`profile_sampled()`], on a given clock.
pub fn profile_sampled_with_clock<W, R>(
    clock: Arc<dyn Clock>,
    writer: W,
    reader: R,
    resolution: Duration,
) -> io::Result<(SampledWriter<W>, SampledReader<R>, SampleSession)> {
    let resolution = if resolution.is_zero() {
        MIN_RESOLUTION
    } else {
        resolution
    };

    let sampled_writer = SampledWriter {
        inner: writer,
        busy: Arc::new(AtomicBool::new(false)),
    };
    let sampled_reader = SampledReader {
        inner: reader,
        busy: Arc::new(AtomicBool::new(false)),
    };

    let start = clock.now();
    let stop = Arc::new(Interrupt::new());
    let monitor = Monitor {
        clock: Arc::clone(&clock),
        start,
        resolution,
        stop: Arc::clone(&stop),
        reading: Arc::clone(&sampled_reader.busy),
        writing: Arc::clone(&sampled_writer.busy),
    };

    let handle = thread::Builder::new()
        .name("iorate-sampler".into())
        .spawn(move || monitor.run())?;

    tracing::debug!(?resolution, "sampling profile started");

    let session = SampleSession {
        clock,
        start,
        stop,
        monitor: Some(handle),
    };

    Ok((sampled_writer, sampled_reader, session))
}

/// Sample counts of one stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleTally {
    /// Ticks which found a call in progress.
    pub blocked: u64,
    /// Ticks which found no call in progress.
    pub idle: u64,
}

impl SampleTally {
    pub fn samples(&self) -> u64 {
        self.blocked + self.idle
    }

    /// Estimated time blocked out of `total`. Zero if never sampled.
    fn estimate(&self, total: Duration) -> Duration {
        match self.samples() {
            0 => Duration::ZERO,
            n => total.mul_f64(self.blocked as f64 / n as f64),
        }
    }

    fn record(&mut self, busy: bool) {
        if busy {
            self.blocked += 1;
        } else {
            self.idle += 1;
        }
    }
}

/// Outcome of [`SampleSession::done()`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampledProfile {
    /// Estimated timings, `wait_*` scaled from the sample counts.
    pub time: TimeProfile,
    pub read: SampleTally,
    pub write: SampleTally,
}

/// Running sampling profile, started by [`profile_sampled()`].
///
/// Dropping the session without calling [`done()`](Self::done) stops the
/// monitor thread as well, without waiting for it.
pub struct SampleSession {
    clock: Arc<dyn Clock>,
    start: Instant,
    stop: Arc<Interrupt>,
    monitor: Option<JoinHandle<(SampleTally, SampleTally)>>,
}

impl SampleSession {
    /// Stop sampling and estimate where the time went.
    ///
    /// The monitor thread is woken up and joined. If it panicked, the panic
    /// is resumed here.
    pub fn done(mut self) -> SampledProfile {
        let total = self.clock.now().saturating_duration_since(self.start);
        self.stop.fire();

        let (read, write) = match self.monitor.take().map(JoinHandle::join) {
            Some(Ok(tallies)) => tallies,
            Some(Err(cause)) => panic::resume_unwind(cause),
            None => Default::default(),
        };

        tracing::debug!(
            samples = read.samples(),
            read_blocked = read.blocked,
            write_blocked = write.blocked,
            "sampling profile done"
        );

        SampledProfile {
            time: TimeProfile {
                total,
                wait_read: read.estimate(total),
                wait_write: write.estimate(total),
            },
            read,
            write,
        }
    }
}

impl Drop for SampleSession {
    fn drop(&mut self) {
        self.stop.fire();
    }
}

impl Debug for SampleSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleSession")
            .field("start", &self.start)
            .field("stopped", &self.stop.is_fired())
            .finish()
    }
}

struct Monitor {
    clock: Arc<dyn Clock>,
    start: Instant,
    resolution: Duration,
    stop: Arc<Interrupt>,
    reading: Arc<AtomicBool>,
    writing: Arc<AtomicBool>,
}

impl Monitor {
    fn run(self) -> (SampleTally, SampleTally) {
        let mut read = SampleTally::default();
        let mut write = SampleTally::default();
        let mut tick = self.start;

        loop {
            // ticks stay on the start + k * resolution grid, however late we wake;
            // past the end of representable time only the stop can wake us
            let next = tick.checked_add(self.resolution);
            if self.clock.sleep_until_interrupted(next, &self.stop) {
                return (read, write);
            }
            if let Some(next) = next {
                tick = next;
            }

            read.record(self.reading.load(Ordering::Relaxed));
            write.record(self.writing.load(Ordering::Relaxed));
        }
    }
}

/// Reader half of [`profile_sampled()`].
pub struct SampledReader<R> {
    inner: R,
    busy: Arc<AtomicBool>,
}

/// Writer half of [`profile_sampled()`].
pub struct SampledWriter<W> {
    inner: W,
    busy: Arc<AtomicBool>,
}

impl<R> SampledReader<R> {
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<W> SampledWriter<W> {
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<R: Read> Read for SampledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.busy.store(true, Ordering::Relaxed);
        let result = self.inner.read(buf);
        self.busy.store(false, Ordering::Relaxed);

        result
    }
}

impl<W: Write> Write for SampledWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.busy.store(true, Ordering::Relaxed);
        let result = self.inner.write(buf);
        self.busy.store(false, Ordering::Relaxed);

        result
    }

    fn flush(&mut self) -> io::Result<()> {
        self.busy.store(true, Ordering::Relaxed);
        let result = self.inner.flush();
        self.busy.store(false, Ordering::Relaxed);

        result
    }
}

impl<R> Debug for SampledReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampledReader")
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .finish()
    }
}

impl<W> Debug for SampledWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampledWriter")
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .finish()
    }
}

//! Bandwidth control for thread-based blocking I/O.
//!
//! # Concepts
//!
//! This crate wraps [`Read`](std::io::Read) and [`Write`](std::io::Write)
//! streams to do three things:
//!
//! - **Measure**: [`MeasuredReader`] and [`MeasuredWriter`] count bytes and tell
//!   transfer rates.
//! - **Throttle**: [`ThrottledReader`] and [`ThrottledWriter`] keep a stream
//!   under a rate of bytes per second. [`WriterPool`] and [`ReaderPool`] keep
//!   many streams together under one rate, sharing it equally.
//! - **Profile**: [`profile()`] and [`profile_sampled()`] tell whether a copy
//!   loop spends its time waiting on the reader or on the writer.
//!
//! Throttling slices time into windows of `resolution` length, each allowing
//! a fixed budget of bytes:
//!
//! ```text
//! rate: 100 KiB/s, resolution: 10ms  =>  1024 bytes per window
//!
//! b: bytes moved, w: waiting for next window
//!
//! stream:   |bbbb|wwwwww|bbbbbbbb|ww|bb|bb|bbb|www|bbbbbbbbbbb|
//!           |    10ms   |    10ms   |    10ms   |    10ms    |...
//!
//! time pass ----->
//! ```
//!
//! Streams in a pool each get `rate / members` of the pool rate:
//!
//! ```text
//! WriterPool (1 MiB/s)
//!  |
//!  +-- PooledWriter 1    ... 512 KiB/s ...
//!  +-- PooledWriter 2    ... 512 KiB/s ...
//!  |
//!  +-- PooledWriter 3 joins, all three drop to 341 KiB/s
//! ```
//!
//! Nothing here spawns threads except the sampling profiler's monitor. A
//! throttled call just blocks the calling thread.
//!
//! All timing goes through a [`Clock`]. Production code uses [`SystemClock`],
//! tests can drive time by hand with [`MockClock`].
//!
//!
//!
//! # Examples
//!
//! ```rust
//! use iorate::{MeasuredWriter, WriterPool, KiB};
//! use std::{io::{self, Write}, thread, time::Duration};
//!
//! // two uploads sharing 200 KiB/s
//! let pool = WriterPool::new(200 * KiB, Duration::from_millis(10));
//! let uplink = MeasuredWriter::new(io::sink());
//!
//! thread::scope(|s| {
//!     for _ in 0..2 {
//!         s.spawn(|| {
//!             let mut upload = pool.get(&uplink);
//!             upload.write_all(&[0; 10 * KiB as usize]).unwrap();
//!         });
//!     }
//! });
//!
//! assert_eq!(uplink.total(), 20 * KiB);
//! assert_eq!(pool.len(), 0);
//! ```

pub mod clock;
mod counter;
mod limiter;
mod measure;
pub mod profile;
mod throttle;
mod throttle_pool;

/// 1024 bytes.
#[allow(non_upper_case_globals)]
pub const KiB: u64 = 1 << 10;

/// 1024 [`KiB`].
#[allow(non_upper_case_globals)]
pub const MiB: u64 = 1 << 20;

/// 1024 [`MiB`].
#[allow(non_upper_case_globals)]
pub const GiB: u64 = 1 << 30;

#[doc(inline)]
pub use clock::{Clock, Interrupt, MockClock, SystemClock};

#[doc(inline)]
pub use counter::RateCounter;

#[doc(inline)]
pub use limiter::{RateHandle, RateLimiter};

#[doc(inline)]
pub use measure::{MeasuredReader, MeasuredWriter, Meter, ReadAt, WriteAt};

#[doc(inline)]
pub use profile::{
    profile, profile_sampled, profile_sampled_with_clock, profile_with_clock, Profile,
    SampleSession, SampleTally, SampledProfile, SampledReader, SampledWriter, TimeProfile,
    TimedReader, TimedWriter,
};

#[doc(inline)]
pub use throttle::{ThrottledReader, ThrottledWriter};

#[doc(inline)]
pub use throttle_pool::{PoolBuilder, PooledReader, PooledWriter, ReaderPool, WriterPool};

//! Stream wrappers which count bytes and tell transfer rates.
//!
//! Sequential streams go through [`Read`]/[`Write`]; random access goes through
//! [`ReadAt`]/[`WriteAt`], with the offset passed to the wrapped stream as is.

use std::{
    fmt::{self, Debug},
    io::{self, Read, Write},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use crate::{
    clock::{Clock, SystemClock},
    counter::RateCounter,
};

/// Read at an offset, without a cursor.
pub trait ReadAt {
    /// Read into `buf` starting at `offset`; return how many bytes were read.
    /// `Ok(0)` means `offset` is at or past the end.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

/// Write at an offset, without a cursor.
pub trait WriteAt {
    /// Write `buf` starting at `offset`; return how many bytes were written.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
}

impl ReadAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.len());
        let src = &self[start..];
        let n = src.len().min(buf.len());

        buf[..n].copy_from_slice(&src[..n]);
        Ok(n)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.as_slice().read_at(buf, offset)
    }
}

impl WriteAt for Mutex<Vec<u8>> {
    /// Grow the vector with zeroes if `offset` is past its end.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;

        let mut vec = self.lock().unwrap_or_else(PoisonError::into_inner);
        if vec.len() < end {
            vec.resize(end, 0);
        }
        vec[start..end].copy_from_slice(buf);

        Ok(buf.len())
    }
}

#[cfg(unix)]
impl ReadAt for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

#[cfg(unix)]
impl WriteAt for std::fs::File {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, buf, offset)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &T {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

impl<T: WriteAt + ?Sized> WriteAt for &T {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        (**self).write_at(buf, offset)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

impl<T: WriteAt + ?Sized> WriteAt for Arc<T> {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        (**self).write_at(buf, offset)
    }
}

/// Read side of a measured stream's byte counter.
///
/// Cloned out of a [`MeasuredReader`] or [`MeasuredWriter`], so the rate can be
/// polled from another thread while the stream itself is busy.
#[derive(Clone)]
pub struct Meter {
    counter: Arc<RateCounter>,
}

impl Meter {
    /// Bytes moved per `period` since the last poll of any clone of this meter.
    pub fn bytes_per(&self, period: Duration) -> u64 {
        self.counter.rate(period) as u64
    }

    /// Bytes moved per second since the last poll.
    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per(Duration::from_secs(1))
    }

    /// Bytes moved since the stream was wrapped.
    pub fn total(&self) -> u64 {
        self.counter.total()
    }
}

impl Debug for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meter")
            .field("total", &self.counter.total())
            .finish()
    }
}

macro_rules! measured_common {
    ($name:ident) => {
        impl<T> $name<T> {
            /// Wrap a stream, measuring on the system clock.
            pub fn new(inner: T) -> Self {
                Self::with_clock(inner, SystemClock::shared())
            }

            /// Wrap a stream, measuring on a given clock.
            pub fn with_clock(inner: T, clock: Arc<dyn Clock>) -> Self {
                Self {
                    inner,
                    meter: Meter {
                        counter: Arc::new(RateCounter::with_clock(clock)),
                    },
                }
            }

            /// A handle to poll rates while the stream is moved elsewhere.
            pub fn meter(&self) -> Meter {
                self.meter.clone()
            }

            /// Bytes per `period` since the last measurement.
            pub fn bytes_per(&self, period: Duration) -> u64 {
                self.meter.bytes_per(period)
            }

            /// Bytes per second since the last measurement.
            pub fn bytes_per_sec(&self) -> u64 {
                self.meter.bytes_per_sec()
            }

            /// Total number of bytes moved.
            pub fn total(&self) -> u64 {
                self.meter.total()
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
                    .field("total", &self.meter.total())
                    .finish()
            }
        }
    };
}

/// Wrap a reader and track how many bytes are read from it.
pub struct MeasuredReader<R> {
    inner: R,
    meter: Meter,
}

measured_common!(MeasuredReader);

impl<R: Read> Read for MeasuredReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.meter.counter.add(n as u64);
        Ok(n)
    }
}

/// Share one measured reader between several consumers, e.g. `&File`.
impl<R> Read for &MeasuredReader<R>
where
    for<'a> &'a R: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (&self.inner).read(buf)?;
        self.meter.counter.add(n as u64);
        Ok(n)
    }
}

impl<R: ReadAt> ReadAt for MeasuredReader<R> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let n = self.inner.read_at(buf, offset)?;
        self.meter.counter.add(n as u64);
        Ok(n)
    }
}

/// Wrap a writer and track how many bytes are written to it.
pub struct MeasuredWriter<W> {
    inner: W,
    meter: Meter,
}

measured_common!(MeasuredWriter);

impl<W: Write> Write for MeasuredWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.meter.counter.add(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Share one measured writer between several producers, e.g. `&File` or `&Sink`.
impl<W> Write for &MeasuredWriter<W>
where
    for<'a> &'a W: Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = (&self.inner).write(buf)?;
        self.meter.counter.add(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.inner).flush()
    }
}

impl<W: WriteAt> WriteAt for MeasuredWriter<W> {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let n = self.inner.write_at(buf, offset)?;
        self.meter.counter.add(n as u64);
        Ok(n)
    }
}

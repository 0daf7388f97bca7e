//! Small stream adapters shared by the conversion pipeline, the merger and
//! the uploader.
//!
//! - [`ReaderAt`]: a sized, random-access byte source. Layer blobs are read
//!   through this trait so the pipeline only ever borrows read access.
//! - [`SectionReader`]: exposes a sub-window of a [`ReaderAt`] through a
//!   forward-only `Read` cursor. Only `SeekFrom::Current` is supported;
//!   absolute positioning is done by constructing a new section.
//! - [`ActionWriter`] / [`ActionReader`]: scoped-close decorators running a
//!   caller-supplied action exactly once as part of finishing.
//! - [`CancelReader`]: fails a read fast once the governing token has fired,
//!   instead of issuing the underlying I/O.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use anyhow::Result;

use crate::cancel::CancelToken;
use crate::error::Canceled;

/// A sized byte source supporting reads at arbitrary offsets.
///
/// Implementations must not require `&mut self`, so one blob can back
/// several concurrent section readers.
pub trait ReaderAt {
    /// Reads up to `buf.len()` bytes at `offset`, returning the number of
    /// bytes read. Zero means end of source.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Total size of the source in bytes.
    fn size(&self) -> io::Result<u64>;
}

impl ReaderAt for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl ReaderAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }
}

impl<T: ReaderAt + ?Sized> ReaderAt for &T {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        (**self).size()
    }
}

/// Forward-only cursor over the window `[offset, offset + len)` of a
/// [`ReaderAt`].
pub struct SectionReader<R: ReaderAt> {
    ra: R,
    offset: u64,
    len: u64,
    pos: u64,
}

impl<R: ReaderAt> SectionReader<R> {
    pub fn new(ra: R, offset: u64, len: u64) -> Self {
        SectionReader {
            ra,
            offset,
            len,
            pos: 0,
        }
    }

    /// A section spanning from `offset` to the end of the source.
    pub fn to_end(ra: R, offset: u64) -> io::Result<Self> {
        let size = ra.size()?;
        let len = size.saturating_sub(offset);
        Ok(Self::new(ra, offset, len))
    }
}

impl<R: ReaderAt> Read for SectionReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let remaining = (self.len - self.pos) as usize;
        let want = buf.len().min(remaining);
        let n = self.ra.read_at(&mut buf[..want], self.offset + self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: ReaderAt> Seek for SectionReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(delta) => {
                let next = self.pos as i64 + delta;
                if next < 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "seek before section start",
                    ));
                }
                self.pos = next as u64;
                Ok(self.pos)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "only SeekFrom::Current is supported",
            )),
        }
    }
}

/// Writer decorator running an action exactly once when finished.
///
/// `finish` flushes the inner writer, then runs the action; the first error
/// encountered wins. Dropping without `finish` skips the action.
pub struct ActionWriter<W: Write, F: FnOnce() -> Result<()>> {
    inner: W,
    action: Option<F>,
}

impl<W: Write, F: FnOnce() -> Result<()>> ActionWriter<W, F> {
    pub fn new(inner: W, action: F) -> Self {
        ActionWriter {
            inner,
            action: Some(action),
        }
    }

    pub fn finish(mut self) -> Result<W> {
        let flushed = self.inner.flush();
        let action = self.action.take().expect("finish consumes the writer");
        let acted = action();
        flushed?;
        acted?;
        Ok(self.inner)
    }
}

impl<W: Write, F: FnOnce() -> Result<()>> Write for ActionWriter<W, F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader decorator running an action exactly once after the inner reader is
/// released.
pub struct ActionReader<R: Read, F: FnOnce() -> Result<()>> {
    inner: R,
    action: F,
}

impl<R: Read, F: FnOnce() -> Result<()>> ActionReader<R, F> {
    pub fn new(inner: R, action: F) -> Self {
        ActionReader { inner, action }
    }

    pub fn finish(self) -> Result<()> {
        drop(self.inner);
        (self.action)()
    }
}

impl<R: Read, F: FnOnce() -> Result<()>> Read for ActionReader<R, F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Reader that checks the governing token before each read.
///
/// Cancellation surfaces as `ErrorKind::Other` (deadline as `TimedOut`) with
/// [`Canceled`] as the source, so `error::is_canceled` can recognize it after
/// any amount of context wrapping. `Interrupted` is deliberately avoided:
/// `io::copy` would retry it.
pub struct CancelReader<R: Read> {
    token: CancelToken,
    inner: R,
}

impl<R: Read> CancelReader<R> {
    pub fn new(token: &CancelToken, inner: R) -> Self {
        CancelReader {
            token: token.clone(),
            inner,
        }
    }
}

impl<R: Read> Read for CancelReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Err(state) = self.token.check() {
            let kind = match state {
                Canceled::DeadlineExceeded => io::ErrorKind::TimedOut,
                Canceled::Canceled => io::ErrorKind::Other,
            };
            return Err(io::Error::new(kind, state));
        }
        self.inner.read(buf)
    }
}

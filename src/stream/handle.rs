//! `Read` / `Write` over a positioned backend handle.
//!
//! A `Handle` reads and writes at an explicit position without moving it;
//! these adapters advance the position after every call so callers see an
//! ordinary sequential stream.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::backend::Handle;
use crate::stream::Close;

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "handle already closed")
}

fn close_handle<H: Handle>(handle: &mut Option<H>) -> io::Result<()> {
    match handle.take() {
        Some(mut h) => h.close().map_err(io::Error::from),
        None => Ok(()),
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Sequential reader over a handle.
pub struct HandleReader<H: Handle> {
    handle: Option<H>,
    buffer_size: usize,
    mark: Option<u64>,
}

impl<H: Handle> HandleReader<H> {
    /// Each `read` asks the handle for at most `buffer_size` bytes.
    pub fn new(handle: H, buffer_size: usize) -> Self {
        Self {
            handle: Some(handle),
            buffer_size: buffer_size.max(1),
            mark: None,
        }
    }

    fn handle(&mut self) -> io::Result<&mut H> {
        self.handle.as_mut().ok_or_else(closed)
    }

    pub fn position(&self) -> Option<u64> {
        self.handle.as_ref().map(|h| h.position())
    }

    /// Move forward `n` bytes without reading them.
    pub fn skip(&mut self, n: u64) -> io::Result<u64> {
        let handle = self.handle()?;
        let pos = handle.position();
        handle.seek(pos.saturating_add(n));
        Ok(n)
    }

    /// Remember the current position for `reset`.
    pub fn mark(&mut self) -> io::Result<()> {
        let pos = self.handle()?.position();
        self.mark = Some(pos);
        Ok(())
    }

    /// Return to the last `mark`.
    pub fn reset(&mut self) -> io::Result<()> {
        let mark = self
            .mark
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "reset without mark"))?;
        self.handle()?.seek(mark);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }
}

impl<H: Handle> Read for HandleReader<H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = buf.len().min(self.buffer_size);
        let handle = self.handle()?;
        if want == 0 {
            return Ok(0);
        }
        let n = handle.read(&mut buf[..want]).map_err(io::Error::from)?;
        let pos = handle.position();
        handle.seek(pos + n as u64);
        Ok(n)
    }
}

impl<H: Handle> Seek for HandleReader<H> {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let handle = self.handle()?;
        let pos = match target {
            SeekFrom::Start(pos) => pos,
            SeekFrom::Current(delta) => handle
                .position()
                .checked_add_signed(delta)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?,
            SeekFrom::End(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "handle length is unknown",
                ))
            }
        };
        handle.seek(pos);
        Ok(pos)
    }
}

impl<H: Handle> Close for HandleReader<H> {
    fn close(&mut self) -> io::Result<()> {
        close_handle(&mut self.handle)
    }
}

impl<H: Handle> Drop for HandleReader<H> {
    fn drop(&mut self) {
        if let Err(e) = close_handle(&mut self.handle) {
            tracing::warn!("Failed to close read handle: {}", e);
        }
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Sequential writer over a handle.
pub struct HandleWriter<H: Handle> {
    handle: Option<H>,
    buffer_size: usize,
}

impl<H: Handle> HandleWriter<H> {
    /// Each `write` hands the handle at most `buffer_size` bytes.
    pub fn new(handle: H, buffer_size: usize) -> Self {
        Self {
            handle: Some(handle),
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn position(&self) -> Option<u64> {
        self.handle.as_ref().map(|h| h.position())
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }
}

impl<H: Handle> Write for HandleWriter<H> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(self.buffer_size);
        let handle = self.handle.as_mut().ok_or_else(closed)?;
        if n == 0 {
            return Ok(0);
        }
        handle.write(&buf[..n]).map_err(io::Error::from)?;
        let pos = handle.position();
        handle.seek(pos + n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<H: Handle> Close for HandleWriter<H> {
    fn close(&mut self) -> io::Result<()> {
        close_handle(&mut self.handle)
    }
}

impl<H: Handle> Drop for HandleWriter<H> {
    fn drop(&mut self) {
        if let Err(e) = close_handle(&mut self.handle) {
            tracing::warn!("Failed to close write handle: {}", e);
        }
    }
}

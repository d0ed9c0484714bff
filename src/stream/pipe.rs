//! Pipe bridge for push-only backends.
//!
//! A backend without random-access handles can only copy a whole file into
//! a sink (`get_to`) or out of a source (`put_from`). To hand callers a
//! stream anyway, the blocking call runs on its own thread connected to the
//! caller through a bounded in-memory pipe:
//!
//! ```text
//! get:  worker: fs.get_to(path, PipeWriter) ──chunks──> PipedReader (caller)
//! put:  caller: PipedWriter ──chunks──> worker: fs.put_from(path, PipeReader)
//! ```
//!
//! The channel bound gives backpressure; closing either end unblocks the
//! other.

use bytes::{Buf, Bytes};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::backend::RemoteFs;
use crate::config::TransferConfig;
use crate::error::{Result, SyncError};
use crate::stream::Close;

// =============================================================================
// In-memory pipe
// =============================================================================

/// Create a pipe holding at most `capacity` chunks in flight.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = bounded(capacity.max(1));
    (
        PipeWriter { tx: Some(tx) },
        PipeReader {
            rx,
            current: Bytes::new(),
        },
    )
}

/// Write end. Dropping it signals end of stream.
pub struct PipeWriter {
    tx: Option<Sender<Bytes>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe writer closed"))?;
        if buf.is_empty() {
            return Ok(0);
        }
        tx.send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for PipeWriter {
    fn close(&mut self) -> io::Result<()> {
        self.tx.take();
        Ok(())
    }
}

/// Read end. Sees EOF once every writer is gone and the buffer is drained.
pub struct PipeReader {
    rx: Receiver<Bytes>,
    current: Bytes,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while !self.current.has_remaining() {
            match self.rx.recv() {
                Ok(chunk) => self.current = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.remaining());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

// =============================================================================
// Background transfers
// =============================================================================

type Task = JoinHandle<Result<u64>>;

fn join_task(task: Task, path: &str) -> Result<u64> {
    task.join().unwrap_or_else(|_| {
        Err(SyncError::io(
            "transfer",
            path,
            io::Error::other("transfer thread panicked"),
        ))
    })
}

/// Entry point for pipe-backed remote streams.
pub struct PipedTransfer;

impl PipedTransfer {
    /// Stream a remote file by running `get_to` on a worker thread.
    ///
    /// Returns as soon as the thread is started. A failing transfer is
    /// logged and the reader sees a short stream ending in EOF.
    pub fn reader<F>(fs: Arc<F>, path: &str, config: &TransferConfig) -> Result<PipedReader>
    where
        F: RemoteFs + ?Sized + 'static,
    {
        let (mut tx, rx) = pipe(config.pipe_capacity);
        let remote = path.to_string();
        let task = thread::Builder::new()
            .name(format!("remsync-get:{}", crate::path::basename(path)))
            .spawn(move || {
                let result = fs.get_to(&remote, &mut tx);
                drop(tx);
                if let Err(e) = &result {
                    tracing::warn!("Background download of {} failed: {}", remote, e);
                }
                result
            })
            .map_err(|e| SyncError::io("spawn", path, e))?;

        tracing::debug!("Started piped read of {}", path);
        Ok(PipedReader {
            inner: Some(rx),
            task: Some(task),
            path: path.to_string(),
        })
    }

    /// Stream into a remote file by running `put_from` on a worker thread.
    pub fn writer<F>(fs: Arc<F>, path: &str, permissions: u32, config: &TransferConfig) -> Result<PipedWriter>
    where
        F: RemoteFs + ?Sized + 'static,
    {
        let (tx, mut rx) = pipe(config.pipe_capacity);
        let remote = path.to_string();
        let task = thread::Builder::new()
            .name(format!("remsync-put:{}", crate::path::basename(path)))
            .spawn(move || {
                let result = fs.put_from(&remote, &mut rx, permissions);
                drop(rx);
                result
            })
            .map_err(|e| SyncError::io("spawn", path, e))?;

        tracing::debug!("Started piped write of {}", path);
        Ok(PipedWriter {
            inner: Some(tx),
            task: Some(task),
            path: path.to_string(),
        })
    }
}

/// Read side of a background download.
pub struct PipedReader {
    inner: Option<PipeReader>,
    task: Option<Task>,
    path: String,
}

impl PipedReader {
    fn shutdown(&mut self) {
        // Dropping the read end first unblocks a worker stuck on a full pipe.
        self.inner.take();
        if let Some(task) = self.task.take() {
            // Failures were already logged by the worker.
            let _ = join_task(task, &self.path);
        }
    }
}

impl Read for PipedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(rx) => rx.read(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")),
        }
    }
}

impl Close for PipedReader {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for PipedReader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Write side of a background upload.
pub struct PipedWriter {
    inner: Option<PipeWriter>,
    task: Option<Task>,
    path: String,
}

impl PipedWriter {
    /// End the stream and wait for the upload, returning its result.
    pub fn finish(mut self) -> Result<u64> {
        self.end()
    }

    fn end(&mut self) -> Result<u64> {
        self.inner.take();
        match self.task.take() {
            Some(task) => join_task(task, &self.path),
            None => Ok(0),
        }
    }
}

impl Write for PipedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(tx) => tx.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for PipedWriter {
    /// Wait for the upload; its failure is logged, not returned.
    fn close(&mut self) -> io::Result<()> {
        if let Err(e) = self.end() {
            tracing::warn!("Background upload of {} failed: {}", self.path, e);
        }
        Ok(())
    }
}

impl Drop for PipedWriter {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.close();
        }
    }
}

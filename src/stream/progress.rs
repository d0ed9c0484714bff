//! Transfer progress reporting.
//!
//! `ProgressReader` and `ProgressWriter` wrap any stream and tell the
//! registered `TransferListener`s when a transfer starts, how far it has
//! got, and when it is finished.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::Result;
use crate::stream::Close;

/// What is being transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub source: String,
    pub target: String,
    /// Total length, when it could be determined.
    pub size: Option<u64>,
}

/// Observer of transfers. Every method defaults to doing nothing.
pub trait TransferListener: Send + Sync {
    fn started(&self, _event: &TransferEvent) {}

    /// `transferred` is cumulative.
    fn progressed(&self, _event: &TransferEvent, _transferred: u64) {}

    fn finished(&self, _event: &TransferEvent, _transferred: u64) {}
}

/// Shared, cloneable set of listeners.
#[derive(Clone, Default)]
pub struct TransferListeners {
    inner: Arc<RwLock<Vec<Arc<dyn TransferListener>>>>,
}

impl TransferListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn TransferListener>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Remove a listener previously added. Returns false if it was not registered.
    pub fn remove(&self, listener: &Arc<dyn TransferListener>) -> bool {
        let mut listeners = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn each(&self, f: impl Fn(&dyn TransferListener)) {
        let listeners = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            f(listener.as_ref());
        }
    }
}

impl fmt::Debug for TransferListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferListeners")
            .field("len", &self.len())
            .finish()
    }
}

/// Length of a transfer, known now or looked up on first use.
pub enum TransferSize {
    Known(u64),
    Lazy(Box<dyn FnOnce() -> Result<u64> + Send>),
    Unknown,
}

impl TransferSize {
    pub fn lazy(f: impl FnOnce() -> Result<u64> + Send + 'static) -> Self {
        TransferSize::Lazy(Box::new(f))
    }

    fn resolve(self) -> Option<u64> {
        match self {
            TransferSize::Known(size) => Some(size),
            TransferSize::Lazy(f) => match f() {
                Ok(size) => Some(size),
                Err(e) => {
                    tracing::debug!("Could not determine transfer size: {}", e);
                    None
                }
            },
            TransferSize::Unknown => None,
        }
    }
}

/// Start/progress/finish state shared by both wrappers.
struct Tracker {
    listeners: TransferListeners,
    event: TransferEvent,
    size: Option<TransferSize>,
    transferred: u64,
    started: bool,
    finished: bool,
}

impl Tracker {
    fn new(listeners: TransferListeners, source: String, target: String, size: TransferSize) -> Self {
        Self {
            listeners,
            event: TransferEvent {
                source,
                target,
                size: None,
            },
            size: Some(size),
            transferred: 0,
            started: false,
            finished: false,
        }
    }

    fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.event.size = self.size.take().and_then(TransferSize::resolve);
        let event = &self.event;
        self.listeners.each(|l| l.started(event));
    }

    fn advance(&mut self, n: usize) {
        self.start();
        if n == 0 {
            return;
        }
        self.transferred += n as u64;
        let (event, transferred) = (&self.event, self.transferred);
        self.listeners.each(|l| l.progressed(event, transferred));
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.start();
        self.finished = true;
        let (event, transferred) = (&self.event, self.transferred);
        self.listeners.each(|l| l.finished(event, transferred));
    }
}

// =============================================================================
// Wrappers
// =============================================================================

/// A `Read` that reports progress.
pub struct ProgressReader<R: Read> {
    inner: R,
    tracker: Tracker,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(
        inner: R,
        listeners: TransferListeners,
        source: impl Into<String>,
        target: impl Into<String>,
        size: TransferSize,
    ) -> Self {
        Self {
            inner,
            tracker: Tracker::new(listeners, source.into(), target.into(), size),
        }
    }

    pub fn transferred(&self) -> u64 {
        self.tracker.transferred
    }

    /// Fire `finished` without closing the inner stream.
    pub fn finish(&mut self) {
        self.tracker.finish();
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.tracker.start();
        let n = self.inner.read(buf)?;
        self.tracker.advance(n);
        Ok(n)
    }
}

impl<R: Read + Close> Close for ProgressReader<R> {
    fn close(&mut self) -> io::Result<()> {
        self.tracker.finish();
        self.inner.close()
    }
}

impl<R: Read> Drop for ProgressReader<R> {
    fn drop(&mut self) {
        self.tracker.finish();
    }
}

/// A `Write` that reports progress.
pub struct ProgressWriter<W: Write> {
    inner: W,
    tracker: Tracker,
}

impl<W: Write> ProgressWriter<W> {
    pub fn new(
        inner: W,
        listeners: TransferListeners,
        source: impl Into<String>,
        target: impl Into<String>,
        size: TransferSize,
    ) -> Self {
        Self {
            inner,
            tracker: Tracker::new(listeners, source.into(), target.into(), size),
        }
    }

    pub fn transferred(&self) -> u64 {
        self.tracker.transferred
    }

    /// Fire `finished` without closing the inner stream.
    pub fn finish(&mut self) {
        self.tracker.finish();
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tracker.start();
        let n = self.inner.write(buf)?;
        self.tracker.advance(n);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write + Close> Close for ProgressWriter<W> {
    fn close(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        self.tracker.finish();
        self.inner.close()
    }
}

impl<W: Write> Drop for ProgressWriter<W> {
    fn drop(&mut self) {
        self.tracker.finish();
    }
}

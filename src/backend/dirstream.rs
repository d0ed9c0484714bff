//! Directory streams.
//!
//! Two ways to enumerate a remote directory:
//!
//! - `listing`: everything from `list_dir` up front, filtered lazily. Every
//!   backend gets this for free.
//! - `DirectoryStream`: reads batches from an open directory handle, for
//!   backends that can iterate server-side. Open handles are tracked in a
//!   shared list so `close()`, possibly from another thread, releases every
//!   one of them exactly once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{Result, SyncError};
use crate::file::RemoteFile;
use crate::path::is_dot_entry;

/// Predicate deciding which entries a stream yields.
pub type DirFilter = Box<dyn Fn(&RemoteFile) -> Result<bool> + Send + Sync>;

/// Entries of one directory, in listing order.
pub type DirIter<'a> = Box<dyn Iterator<Item = Result<RemoteFile>> + Send + 'a>;

// =============================================================================
// Fallback listing
// =============================================================================

/// Wrap a complete listing as a directory iterator.
pub fn listing(entries: Vec<RemoteFile>, filter: Option<DirFilter>) -> Result<DirIter<'static>> {
    Ok(Box::new(Listing {
        entries: entries.into_iter(),
        filter,
    }))
}

struct Listing {
    entries: std::vec::IntoIter<RemoteFile>,
    filter: Option<DirFilter>,
}

impl Iterator for Listing {
    type Item = Result<RemoteFile>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let file = self.entries.next()?;
            if is_dot_entry(file.name()) {
                continue;
            }
            match apply_filter(self.filter.as_deref(), &file) {
                Ok(true) => return Some(Ok(file)),
                Ok(false) => continue,
                Err(e) => {
                    self.entries = Vec::new().into_iter();
                    return Some(Err(e));
                }
            }
        }
    }
}

fn apply_filter(
    filter: Option<&(dyn Fn(&RemoteFile) -> Result<bool> + Send + Sync)>,
    file: &RemoteFile,
) -> Result<bool> {
    match filter {
        None => Ok(true),
        Some(filter) => filter(file).map_err(|e| {
            SyncError::Iteration(format!("failed to filter {}: {}", file.path(), e))
        }),
    }
}

// =============================================================================
// Handle-backed stream
// =============================================================================

/// Backend side of a `DirectoryStream`.
pub trait DirectorySource: Sync {
    /// Open directory handle. Dropping it releases it.
    type Handle: Send;
    /// Native entry type returned by the backend.
    type Entry: Send;

    fn open_directory(&self, path: &str) -> Result<Self::Handle>;

    /// Next batch of entries; an empty batch ends the listing.
    fn read_directory(&self, handle: &mut Self::Handle) -> Result<Vec<Self::Entry>>;

    fn to_remote_file(&self, dir: &str, entry: Self::Entry) -> Result<RemoteFile>;
}

type Slot<H> = Arc<Mutex<Option<H>>>;

struct Shared<H> {
    handles: Mutex<Vec<Slot<H>>>,
    closed: AtomicBool,
}

trait CloseAll: Send + Sync {
    fn close_all(&self) -> usize;
    fn is_closed(&self) -> bool;
}

impl<H: Send> CloseAll for Shared<H> {
    fn close_all(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let slots: Vec<Slot<H>> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let mut released = 0;
        for slot in slots {
            let handle = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if handle.is_some() {
                released += 1;
            }
        }
        tracing::trace!("closed directory stream, released {} handles", released);
        released
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Cloneable, thread-safe close switch for a `DirectoryStream`.
#[derive(Clone)]
pub struct DirectoryCloser {
    shared: Arc<dyn CloseAll>,
}

impl DirectoryCloser {
    /// Release every open handle. Returns how many were still open; a
    /// second call is a no-op returning 0.
    pub fn close(&self) -> usize {
        self.shared.close_all()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

/// A directory enumerated through backend handles.
pub struct DirectoryStream<'a, S: DirectorySource> {
    source: &'a S,
    path: String,
    filter: Option<Arc<DirFilter>>,
    shared: Arc<Shared<S::Handle>>,
}

impl<'a, S: DirectorySource> DirectoryStream<'a, S> {
    pub fn new(source: &'a S, path: impl Into<String>, filter: Option<DirFilter>) -> Self {
        Self {
            source,
            path: path.into(),
            filter: filter.map(Arc::new),
            shared: Arc::new(Shared {
                handles: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Open a fresh handle and iterate it.
    pub fn iter(&self) -> Result<DirectoryIter<'a, S>> {
        if self.shared.is_closed() {
            return Err(SyncError::Iteration(format!("{}: stream closed", self.path)));
        }
        let handle = self.source.open_directory(&self.path)?;
        let slot = Arc::new(Mutex::new(Some(handle)));
        self.shared
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(slot.clone());

        Ok(DirectoryIter {
            source: self.source,
            path: self.path.clone(),
            filter: self.filter.clone(),
            shared: self.shared.clone(),
            slot,
            pending: VecDeque::new(),
            done: false,
        })
    }

    /// Box a single iteration for `RemoteFs::directory`.
    pub fn boxed(self) -> Result<DirIter<'a>> {
        Ok(Box::new(self.iter()?))
    }

    pub fn closer(&self) -> DirectoryCloser
    where
        S::Handle: 'static,
    {
        DirectoryCloser {
            shared: self.shared.clone(),
        }
    }

    pub fn close(&self) -> usize {
        self.shared.close_all()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

/// Iterator over one open directory handle.
pub struct DirectoryIter<'a, S: DirectorySource> {
    source: &'a S,
    path: String,
    filter: Option<Arc<DirFilter>>,
    shared: Arc<Shared<S::Handle>>,
    slot: Slot<S::Handle>,
    pending: VecDeque<S::Entry>,
    done: bool,
}

impl<S: DirectorySource> DirectoryIter<'_, S> {
    fn closed_error(&mut self) -> Option<Result<RemoteFile>> {
        self.done = true;
        self.pending.clear();
        Some(Err(SyncError::Iteration(format!("{}: stream closed", self.path))))
    }
}

impl<S: DirectorySource> Iterator for DirectoryIter<'_, S> {
    type Item = Result<RemoteFile>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.shared.is_closed() {
                return self.closed_error();
            }

            if let Some(entry) = self.pending.pop_front() {
                let file = match self.source.to_remote_file(&self.path, entry) {
                    Ok(file) => file,
                    Err(e) => return Some(Err(e)),
                };
                if is_dot_entry(file.name()) {
                    continue;
                }
                let filter = self.filter.as_deref().map(|f| &**f);
                match apply_filter(filter, &file) {
                    Ok(true) => return Some(Ok(file)),
                    Ok(false) => continue,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }

            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(handle) = slot.as_mut() else {
                drop(slot);
                return self.closed_error();
            };
            match self.source.read_directory(handle) {
                Ok(batch) if batch.is_empty() => {
                    *slot = None;
                    self.done = true;
                    return None;
                }
                Ok(batch) => self.pending.extend(batch),
                Err(e) => {
                    *slot = None;
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl<S: DirectorySource> Drop for DirectoryIter<'_, S> {
    fn drop(&mut self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileKind;
    use std::sync::atomic::AtomicUsize;

    /// Serves `names` in batches of two and counts open handles.
    struct BatchSource {
        names: Vec<&'static str>,
        open: Arc<AtomicUsize>,
    }

    struct CountedHandle {
        next: usize,
        open: Arc<AtomicUsize>,
    }

    impl Drop for CountedHandle {
        fn drop(&mut self) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl DirectorySource for BatchSource {
        type Handle = CountedHandle;
        type Entry = &'static str;

        fn open_directory(&self, _path: &str) -> Result<CountedHandle> {
            self.open.fetch_add(1, Ordering::SeqCst);
            Ok(CountedHandle {
                next: 0,
                open: self.open.clone(),
            })
        }

        fn read_directory(&self, handle: &mut CountedHandle) -> Result<Vec<&'static str>> {
            let end = (handle.next + 2).min(self.names.len());
            let batch = self.names[handle.next..end].to_vec();
            handle.next = end;
            Ok(batch)
        }

        fn to_remote_file(&self, dir: &str, entry: &'static str) -> Result<RemoteFile> {
            Ok(RemoteFile::new(FileKind::File, crate::path::join(dir, entry)))
        }
    }

    fn source() -> BatchSource {
        BatchSource {
            names: vec![".", "..", "a", "b", "c", "d", "e"],
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[test]
    fn test_stream_reads_all_batches_and_skips_dots() {
        let src = source();
        let stream = DirectoryStream::new(&src, "/dir", None);
        let names: Vec<String> = stream
            .iter()
            .unwrap()
            .map(|f| f.unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(src.open.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stream_filter() {
        let src = source();
        let filter: DirFilter = Box::new(|f| Ok(f.name() != "c"));
        let stream = DirectoryStream::new(&src, "/dir", Some(filter));
        let count = stream.iter().unwrap().filter_map(|f| f.ok()).count();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_close_releases_handles_once() {
        let src = source();
        let stream = DirectoryStream::new(&src, "/dir", None);
        let mut first = stream.iter().unwrap();
        let _second = stream.iter().unwrap();
        assert_eq!(src.open.load(Ordering::SeqCst), 2);

        assert!(first.next().unwrap().is_ok());
        assert_eq!(stream.close(), 2);
        assert_eq!(src.open.load(Ordering::SeqCst), 0);
        assert_eq!(stream.close(), 0);

        match first.next() {
            Some(Err(SyncError::Iteration(_))) => {}
            other => panic!("Expected iteration error, got {:?}", other),
        }
        assert!(first.next().is_none());
        assert!(stream.iter().is_err());
    }

    #[test]
    fn test_close_from_another_thread() {
        let src = source();
        let stream = DirectoryStream::new(&src, "/dir", None);
        let closer = stream.closer();
        let mut iter = stream.iter().unwrap();
        assert!(iter.next().unwrap().is_ok());

        std::thread::scope(|s| {
            s.spawn(move || closer.close()).join().unwrap();
        });

        assert!(stream.is_closed());
        assert_eq!(src.open.load(Ordering::SeqCst), 0);
        assert!(matches!(iter.next(), Some(Err(_))));
    }

    #[test]
    fn test_listing_filter_error_is_iteration_error() {
        let files = vec![
            RemoteFile::new(FileKind::File, "/d/a"),
            RemoteFile::new(FileKind::File, "/d/b"),
        ];
        let filter: DirFilter = Box::new(|_| {
            Err(SyncError::status(crate::error::StatusCode::Failure, "filter"))
        });
        let mut iter = listing(files, Some(filter)).unwrap();
        assert!(matches!(iter.next(), Some(Err(SyncError::Iteration(_)))));
        assert!(iter.next().is_none());
    }
}

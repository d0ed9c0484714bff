//! Byte-stream adapters over remote files.
//!
//! Remote files surface as plain `std::io::Read` / `std::io::Write`
//! whichever way the backend moves bytes:
//!
//! - `handle`: a backend with random-access handles is read and written
//!   through `HandleReader` / `HandleWriter`.
//! - `pipe`: a push-only backend runs its blocking get/put on a worker
//!   thread feeding an in-memory pipe.
//! - `progress`: either kind of stream can be wrapped to report transfer
//!   progress to listeners.

pub mod handle;
pub mod pipe;
pub mod progress;

use std::fs::File;
use std::io::{self, Read, Write};

pub use handle::{HandleReader, HandleWriter};
pub use pipe::{pipe, PipeReader, PipeWriter, PipedReader, PipedTransfer, PipedWriter};
pub use progress::{
    ProgressReader, ProgressWriter, TransferEvent, TransferListener, TransferListeners, TransferSize,
};

/// Explicit end of a stream.
///
/// Dropping a stream also releases it, but only `close` reports the
/// failure. Closing twice is a no-op.
pub trait Close {
    fn close(&mut self) -> io::Result<()>;
}

impl<C: Close + ?Sized> Close for Box<C> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl Close for File {
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// A closable remote read stream.
pub trait ReadStream: Read + Close + Send {}

impl<T: Read + Close + Send> ReadStream for T {}

/// A closable remote write stream.
pub trait WriteStream: Write + Close + Send {}

impl<T: Write + Close + Send> WriteStream for T {}

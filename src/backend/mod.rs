//! Backend contract.
//!
//! A backend supplies a handful of filesystem primitives; everything else
//! (sync, walking, streaming) is built on top of them by the engine. The
//! provided methods give a backend with raw handles working push-style
//! `get_to` / `put_from` for free, and give every backend a directory
//! stream built from `list_dir`.

pub mod dirstream;
pub mod local;
#[cfg(feature = "ssh")]
pub mod ssh;

use std::io::{self, Read, Write};
use std::time::SystemTime;

use crate::error::{Result, SyncError};
use crate::file::RemoteFile;
use crate::flags::{EolPolicy, OpenFlags, TransferMode};
use crate::stream::handle::{HandleReader, HandleWriter};
use crate::stream::Close;

pub use dirstream::{DirFilter, DirIter, DirectoryCloser, DirectorySource, DirectoryStream};
pub use local::LocalBackend;
#[cfg(feature = "ssh")]
pub use ssh::Ssh2Backend;

/// Buffer used by the provided `get_to` / `put_from`.
const PROVIDED_COPY_BUFFER: usize = 32 * 1024;

bitflags::bitflags! {
    /// Optional features a backend may offer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u32 {
        /// `open_handle` works; random access and resume are possible.
        const RAW_HANDLES = 1 << 0;
        const SET_MOD_TIME = 1 << 1;
        const LSTAT = 1 << 2;
        const SYMLINKS = 1 << 3;
        const HARD_LINKS = 1 << 4;
        const OWNERSHIP = 1 << 5;
        const EOL_POLICY = 1 << 6;
        const TRANSFER_MODE = 1 << 7;
    }
}

/// An open remote file with an explicit position.
///
/// `read` and `write` act at the current position and do not move it;
/// callers advance with `seek`.
pub trait Handle: Send {
    fn position(&self) -> u64;

    fn seek(&mut self, pos: u64);

    /// Read into `buf`, returning 0 at end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `buf`.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

impl<H: Handle + ?Sized> Handle for Box<H> {
    fn position(&self) -> u64 {
        (**self).position()
    }

    fn seek(&mut self, pos: u64) {
        (**self).seek(pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write(buf)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Filesystem primitives a backend provides.
///
/// Paths are absolute and `/`-separated. Optional operations default to
/// `SyncError::Unsupported` and must be paired with the matching
/// `Capabilities` bit.
pub trait RemoteFs: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Directory a session starts in, typically the user's home.
    fn default_path(&self) -> Result<String> {
        Ok("/".to_string())
    }

    fn stat(&self, path: &str) -> Result<RemoteFile>;

    /// Like `stat` but does not follow a final symlink.
    fn lstat(&self, _path: &str) -> Result<RemoteFile> {
        Err(SyncError::Unsupported("lstat"))
    }

    /// Entries of a directory, excluding `.` and `..`.
    fn list_dir(&self, path: &str) -> Result<Vec<RemoteFile>>;

    /// Stream the entries of a directory.
    ///
    /// The default lists everything up front and filters it; backends with
    /// server-side iteration return a `DirectoryStream` instead.
    fn directory<'a>(&'a self, path: &str, filter: Option<DirFilter>) -> Result<DirIter<'a>> {
        dirstream::listing(self.list_dir(path)?, filter)
    }

    fn open_handle(&self, _path: &str, _flags: OpenFlags, _permissions: u32) -> Result<Box<dyn Handle>> {
        Err(SyncError::Unsupported("open_handle"))
    }

    /// Copy the whole of a remote file into `sink`, blocking until done.
    fn get_to(&self, path: &str, sink: &mut dyn Write) -> Result<u64> {
        let handle = self.open_handle(path, OpenFlags::READ, 0)?;
        let mut reader = HandleReader::new(handle, PROVIDED_COPY_BUFFER);
        let copied = io::copy(&mut reader, sink).map_err(|e| SyncError::from_io("get", path, e))?;
        reader.close().map_err(|e| SyncError::from_io("close", path, e))?;
        Ok(copied)
    }

    /// Replace a remote file with everything read from `source`.
    fn put_from(&self, path: &str, source: &mut dyn Read, permissions: u32) -> Result<u64> {
        let handle = self.open_handle(path, OpenFlags::overwrite(), permissions)?;
        let mut writer = HandleWriter::new(handle, PROVIDED_COPY_BUFFER);
        let copied = io::copy(source, &mut writer).map_err(|e| SyncError::from_io("put", path, e))?;
        writer.close().map_err(|e| SyncError::from_io("close", path, e))?;
        Ok(copied)
    }

    /// Create one directory; its parent must exist.
    fn mkdir(&self, path: &str, permissions: u32) -> Result<()>;

    fn remove(&self, path: &str) -> Result<()>;

    /// Remove an empty directory.
    fn remove_dir(&self, path: &str) -> Result<()>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn chmod(&self, path: &str, permissions: u32) -> Result<()>;

    fn chown(&self, _path: &str, _uid: u32) -> Result<()> {
        Err(SyncError::Unsupported("chown"))
    }

    fn chgrp(&self, _path: &str, _gid: u32) -> Result<()> {
        Err(SyncError::Unsupported("chgrp"))
    }

    fn set_mod_time(&self, _path: &str, _modified: SystemTime) -> Result<()> {
        Err(SyncError::Unsupported("set_mod_time"))
    }

    fn read_link(&self, _path: &str) -> Result<String> {
        Err(SyncError::Unsupported("read_link"))
    }

    /// Create `link` pointing at `target`.
    fn symlink(&self, _link: &str, _target: &str) -> Result<()> {
        Err(SyncError::Unsupported("symlink"))
    }

    fn link(&self, _link: &str, _target: &str) -> Result<()> {
        Err(SyncError::Unsupported("link"))
    }

    fn set_eol_policy(&self, _policy: &[EolPolicy]) -> Result<()> {
        Err(SyncError::Unsupported("eol_policy"))
    }

    fn set_transfer_mode(&self, _mode: TransferMode) -> Result<()> {
        Err(SyncError::Unsupported("transfer_mode"))
    }
}

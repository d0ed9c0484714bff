//! Backend rooted at a local directory.
//!
//! Remote path `/a/b` maps to `<root>/a/b`. Useful for mirroring between
//! two local trees and as the reference backend in tests; raw handles can
//! be switched off to exercise the push-only code paths.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use filetime::FileTime;

use super::dirstream::{DirFilter, DirIter, DirectorySource, DirectoryStream};
use super::{Capabilities, Handle, RemoteFs};
use crate::error::{Result, StatusCode, SyncError};
use crate::file::{FileKind, RemoteFile};
use crate::flags::OpenFlags;
use crate::path::join;

/// Entries fetched per directory-stream batch
const DIR_BATCH_SIZE: usize = 64;

/// Map a local I/O failure to the status a file server would report.
fn status_from_io(path: &str, err: io::Error) -> SyncError {
    let code = match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        io::ErrorKind::AlreadyExists => StatusCode::FileAlreadyExists,
        io::ErrorKind::InvalidInput => StatusCode::InvalidParameter,
        io::ErrorKind::Unsupported => StatusCode::OpUnsupported,
        _ => StatusCode::Failure,
    };
    SyncError::status_msg(code, path, err.to_string())
}

fn file_from_metadata(path: String, meta: &fs::Metadata) -> RemoteFile {
    let file = RemoteFile::new(file_kind(meta), path)
        .with_size(meta.len())
        .with_modified(meta.modified().unwrap_or(UNIX_EPOCH))
        .with_accessed(meta.accessed().unwrap_or(UNIX_EPOCH))
        .with_created(meta.created().unwrap_or(UNIX_EPOCH));

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        file.with_permissions(meta.mode()).with_owner(meta.uid(), meta.gid())
    }
    #[cfg(not(unix))]
    {
        file.with_permissions(if meta.permissions().readonly() { 0o444 } else { 0o644 })
    }
}

fn file_kind(meta: &fs::Metadata) -> FileKind {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        FileKind::from_mode(meta.mode())
    }
    #[cfg(not(unix))]
    {
        let ft = meta.file_type();
        if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_file() {
            FileKind::File
        } else {
            FileKind::Unknown
        }
    }
}

#[cfg(unix)]
fn apply_mode(options: &mut OpenOptions, permissions: u32) {
    use std::os::unix::fs::OpenOptionsExt;
    if permissions != 0 {
        options.mode(permissions);
    }
}

#[cfg(not(unix))]
fn apply_mode(_options: &mut OpenOptions, _permissions: u32) {}

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    raw_handles: bool,
}

impl LocalBackend {
    /// Serve the tree under `root`, which must be an existing directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let meta = fs::metadata(&root).map_err(|e| SyncError::io("open root", &root, e))?;
        if !meta.is_dir() {
            return Err(SyncError::status_msg(
                StatusCode::NotADirectory,
                root.display().to_string(),
                "backend root must be a directory",
            ));
        }
        Ok(Self {
            root,
            raw_handles: true,
        })
    }

    /// Offer or withhold `open_handle`.
    pub fn with_raw_handles(mut self, enabled: bool) -> Self {
        self.raw_handles = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path for a remote path. `..` segments are rejected.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let mut local = self.root.clone();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    return Err(SyncError::status_msg(
                        StatusCode::InvalidFilename,
                        path,
                        "path escapes the backend root",
                    ))
                }
                name => local.push(name),
            }
        }
        Ok(local)
    }
}

impl RemoteFs for LocalBackend {
    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::SET_MOD_TIME
            | Capabilities::LSTAT
            | Capabilities::SYMLINKS
            | Capabilities::HARD_LINKS;
        if cfg!(unix) {
            caps |= Capabilities::OWNERSHIP;
        }
        if self.raw_handles {
            caps |= Capabilities::RAW_HANDLES;
        }
        caps
    }

    fn stat(&self, path: &str) -> Result<RemoteFile> {
        let meta = fs::metadata(self.resolve(path)?).map_err(|e| status_from_io(path, e))?;
        Ok(file_from_metadata(path.to_string(), &meta))
    }

    fn lstat(&self, path: &str) -> Result<RemoteFile> {
        let meta = fs::symlink_metadata(self.resolve(path)?).map_err(|e| status_from_io(path, e))?;
        Ok(file_from_metadata(path.to_string(), &meta))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<RemoteFile>> {
        let dir = self.resolve(path)?;
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| status_from_io(path, e))? {
            let entry = entry.map_err(|e| status_from_io(path, e))?;
            files.push(self.to_remote_file(path, entry)?);
        }
        files.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(files)
    }

    fn directory<'a>(&'a self, path: &str, filter: Option<DirFilter>) -> Result<DirIter<'a>> {
        DirectoryStream::new(self, path, filter).boxed()
    }

    fn open_handle(&self, path: &str, flags: OpenFlags, permissions: u32) -> Result<Box<dyn Handle>> {
        if !self.raw_handles {
            return Err(SyncError::Unsupported("open_handle"));
        }
        let local = self.resolve(path)?;
        let mut options = OpenOptions::new();
        options
            .read(flags.contains(OpenFlags::READ) || !flags.contains(OpenFlags::WRITE))
            .write(flags.contains(OpenFlags::WRITE))
            .append(flags.contains(OpenFlags::APPEND))
            .truncate(flags.contains(OpenFlags::TRUNCATE));
        if flags.contains(OpenFlags::EXCLUSIVE) {
            options.create_new(true);
        } else {
            options.create(flags.contains(OpenFlags::CREATE));
        }
        apply_mode(&mut options, permissions);

        let file = options.open(&local).map_err(|e| status_from_io(path, e))?;
        Ok(Box::new(LocalHandle {
            file: Some(file),
            path: path.to_string(),
            pos: 0,
        }))
    }

    fn get_to(&self, path: &str, sink: &mut dyn Write) -> Result<u64> {
        let mut file = File::open(self.resolve(path)?).map_err(|e| status_from_io(path, e))?;
        io::copy(&mut file, sink).map_err(|e| SyncError::from_io("get", path, e))
    }

    fn put_from(&self, path: &str, source: &mut dyn Read, permissions: u32) -> Result<u64> {
        let local = self.resolve(path)?;
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        apply_mode(&mut options, permissions);

        let mut file = options.open(&local).map_err(|e| status_from_io(path, e))?;
        let copied = io::copy(source, &mut file).map_err(|e| SyncError::from_io("put", path, e))?;
        file.flush().map_err(|e| status_from_io(path, e))?;
        Ok(copied)
    }

    fn mkdir(&self, path: &str, permissions: u32) -> Result<()> {
        let local = self.resolve(path)?;
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(if permissions == 0 { 0o755 } else { permissions });
        }
        #[cfg(not(unix))]
        let _ = permissions;
        builder.create(&local).map_err(|e| status_from_io(path, e))
    }

    fn remove(&self, path: &str) -> Result<()> {
        let local = self.resolve(path)?;
        let meta = fs::symlink_metadata(&local).map_err(|e| status_from_io(path, e))?;
        if meta.is_dir() {
            return Err(SyncError::status(StatusCode::FileIsADirectory, path));
        }
        fs::remove_file(&local).map_err(|e| status_from_io(path, e))
    }

    fn remove_dir(&self, path: &str) -> Result<()> {
        let local = self.resolve(path)?;
        if local == self.root {
            return Err(SyncError::status_msg(
                StatusCode::CannotDelete,
                path,
                "refusing to remove the backend root",
            ));
        }
        match fs::remove_dir(&local) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(status_from_io(path, e)),
            Err(e) => {
                let not_empty = fs::read_dir(&local)
                    .map(|mut entries| entries.next().is_some())
                    .unwrap_or(false);
                if not_empty {
                    Err(SyncError::status(StatusCode::DirNotEmpty, path))
                } else {
                    Err(status_from_io(path, e))
                }
            }
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.resolve(from)?, self.resolve(to)?).map_err(|e| status_from_io(from, e))
    }

    fn chmod(&self, path: &str, permissions: u32) -> Result<()> {
        let local = self.resolve(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&local, fs::Permissions::from_mode(permissions & 0o7777))
                .map_err(|e| status_from_io(path, e))
        }
        #[cfg(not(unix))]
        {
            let mut perms = fs::metadata(&local).map_err(|e| status_from_io(path, e))?.permissions();
            perms.set_readonly(permissions & 0o200 == 0);
            fs::set_permissions(&local, perms).map_err(|e| status_from_io(path, e))
        }
    }

    #[cfg(unix)]
    fn chown(&self, path: &str, uid: u32) -> Result<()> {
        std::os::unix::fs::lchown(self.resolve(path)?, Some(uid), None).map_err(|e| status_from_io(path, e))
    }

    #[cfg(unix)]
    fn chgrp(&self, path: &str, gid: u32) -> Result<()> {
        std::os::unix::fs::lchown(self.resolve(path)?, None, Some(gid)).map_err(|e| status_from_io(path, e))
    }

    fn set_mod_time(&self, path: &str, modified: SystemTime) -> Result<()> {
        filetime::set_file_mtime(self.resolve(path)?, FileTime::from_system_time(modified))
            .map_err(|e| status_from_io(path, e))
    }

    fn read_link(&self, path: &str) -> Result<String> {
        let target = fs::read_link(self.resolve(path)?).map_err(|e| status_from_io(path, e))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn symlink(&self, link: &str, target: &str) -> Result<()> {
        // Absolute targets are remote paths and live under the root too.
        let target_path = if target.starts_with('/') {
            self.resolve(target)?
        } else {
            PathBuf::from(target)
        };
        let link_path = self.resolve(link)?;
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&target_path, &link_path).map_err(|e| status_from_io(link, e))
        }
        #[cfg(not(unix))]
        {
            let _ = (target_path, link_path);
            Err(SyncError::Unsupported("symlink"))
        }
    }

    fn link(&self, link: &str, target: &str) -> Result<()> {
        fs::hard_link(self.resolve(target)?, self.resolve(link)?).map_err(|e| status_from_io(link, e))
    }
}

impl DirectorySource for LocalBackend {
    type Handle = fs::ReadDir;
    type Entry = fs::DirEntry;

    fn open_directory(&self, path: &str) -> Result<fs::ReadDir> {
        fs::read_dir(self.resolve(path)?).map_err(|e| status_from_io(path, e))
    }

    fn read_directory(&self, handle: &mut fs::ReadDir) -> Result<Vec<fs::DirEntry>> {
        let mut batch = Vec::with_capacity(DIR_BATCH_SIZE);
        for entry in handle.by_ref().take(DIR_BATCH_SIZE) {
            batch.push(entry.map_err(|e| SyncError::Iteration(e.to_string()))?);
        }
        Ok(batch)
    }

    fn to_remote_file(&self, dir: &str, entry: fs::DirEntry) -> Result<RemoteFile> {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = join(dir, &name);
        // DirEntry::metadata does not follow symlinks.
        let meta = entry.metadata().map_err(|e| status_from_io(&path, e))?;
        Ok(file_from_metadata(path, &meta))
    }
}

/// Open local file behind a `Handle`.
struct LocalHandle {
    file: Option<File>,
    path: String,
    pos: u64,
}

impl LocalHandle {
    fn file_at_pos(&mut self) -> Result<&mut File> {
        let pos = self.pos;
        let path = &self.path;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SyncError::status(StatusCode::InvalidHandle, path.clone()))?;
        file.seek(SeekFrom::Start(pos)).map_err(|e| status_from_io(path, e))?;
        Ok(file)
    }
}

impl Handle for LocalHandle {
    fn position(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let path = self.path.clone();
        let file = self.file_at_pos()?;
        file.read(buf).map_err(|e| status_from_io(&path, e))
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let path = self.path.clone();
        let file = self.file_at_pos()?;
        file.write_all(buf).map_err(|e| status_from_io(&path, e))
    }

    fn close(&mut self) -> Result<()> {
        match self.file.take() {
            Some(mut file) => file.flush().map_err(|e| status_from_io(&self.path, e)),
            None => Ok(()),
        }
    }
}

//! Sync engine.
//!
//! `Engine` holds the algorithms that work on top of any `RemoteFs`:
//! directory download and upload with change classification, single-file
//! transfers, resumable transfers, and the small helpers a file client
//! needs (`mkdirs`, `exists`, `remove_recursive`).
//!
//! Files are compared by size and modification time in whole seconds;
//! contents are never hashed. Nothing is written anywhere unless
//! `SyncOptions::commit` is set.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use filetime::FileTime;

use crate::backend::{Capabilities, Handle, RemoteFs};
use crate::config::TransferConfig;
use crate::error::{Result, StatusCode, SyncError};
use crate::file::RemoteFile;
use crate::flags::{EolPolicy, OpenFlags, TransferMode};
use crate::operation::{Outcome, SyncOperation};
use crate::path::{ancestors_inclusive, basename, is_dot_entry, join, join_relative};
use crate::stream::{
    Close, HandleReader, HandleWriter, PipedTransfer, ProgressReader, ProgressWriter, ReadStream,
    TransferListeners, TransferSize, WriteStream,
};
use crate::visit::{
    local_mtime_secs, local_subtree, read_local_dir, remote_subtree, walk, walk_local, FileVisitor,
    LocalEntry, LocalVisitor, VisitResult,
};

/// How a directory sync behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Descend into sub-directories.
    pub recurse: bool,
    /// Delete target entries that have no source counterpart.
    pub sync: bool,
    /// Apply changes; when false only classify them.
    pub commit: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            recurse: true,
            sync: false,
            commit: true,
        }
    }
}

impl SyncOptions {
    pub fn new(recurse: bool, sync: bool, commit: bool) -> Self {
        Self { recurse, sync, commit }
    }
}

/// Ledger key for a relative path; the sync root itself is `.`.
fn ledger_key(relative: &str) -> String {
    if relative.is_empty() {
        ".".to_string()
    } else {
        relative.to_string()
    }
}

#[cfg(unix)]
fn local_permissions(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn local_permissions(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn set_local_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_local_permissions(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Backend-agnostic file operations.
pub struct Engine<F: RemoteFs + ?Sized + 'static> {
    fs: Arc<F>,
    config: TransferConfig,
    listeners: TransferListeners,
    mode: TransferMode,
}

impl<F: RemoteFs + ?Sized + 'static> Engine<F> {
    pub fn new(fs: Arc<F>) -> Self {
        Self::with_config(fs, TransferConfig::default())
    }

    pub fn with_config(fs: Arc<F>, config: TransferConfig) -> Self {
        Self {
            fs,
            config,
            listeners: TransferListeners::new(),
            mode: TransferMode::Binary,
        }
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Listeners notified of every transfer this engine performs.
    pub fn listeners(&self) -> &TransferListeners {
        &self.listeners
    }

    fn capable(&self, caps: Capabilities) -> bool {
        self.fs.capabilities().contains(caps)
    }

    // =========================================================================
    // Transfer settings
    // =========================================================================

    pub fn transfer_mode(&self) -> TransferMode {
        self.mode
    }

    /// Switch between binary and text transfers. Text mode needs the
    /// backend's `TRANSFER_MODE` capability.
    pub fn set_transfer_mode(&mut self, mode: TransferMode) -> Result<()> {
        if !self.capable(Capabilities::TRANSFER_MODE) {
            return Err(SyncError::Unsupported("transfer_mode"));
        }
        self.fs.set_transfer_mode(mode)?;
        self.mode = mode;
        Ok(())
    }

    pub fn set_eol_policy(&self, policy: &[EolPolicy]) -> Result<()> {
        if !self.capable(Capabilities::EOL_POLICY) {
            return Err(SyncError::Unsupported("eol_policy"));
        }
        self.fs.set_eol_policy(policy)
    }

    fn open_flags(&self, flags: OpenFlags) -> OpenFlags {
        match self.mode {
            TransferMode::Text => flags | OpenFlags::TEXT,
            TransferMode::Binary => flags,
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Whether `path` exists. Only "no such file" counts as absent.
    pub fn exists(&self, path: &str) -> Result<bool> {
        match self.fs.stat(path) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create `path` and any missing parents, left to right.
    pub fn mkdirs(&self, path: &str, permissions: u32) -> Result<()> {
        for prefix in ancestors_inclusive(path) {
            match self.fs.stat(&prefix) {
                Ok(existing) if existing.is_dir() => {}
                Ok(_) => {
                    return Err(SyncError::status_msg(
                        StatusCode::NotADirectory,
                        prefix,
                        "path component is not a directory",
                    ))
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!("Creating remote directory {}", prefix);
                    self.fs.mkdir(&prefix, permissions)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// `lstat` where the backend has it, `stat` otherwise.
    fn remote_lstat(&self, path: &str) -> Result<RemoteFile> {
        if self.capable(Capabilities::LSTAT) {
            self.fs.lstat(path)
        } else {
            self.fs.stat(path)
        }
    }

    /// Remove a file, or a directory and everything below it. A symlink is
    /// removed itself, never followed.
    pub fn remove_recursive(&self, path: &str) -> Result<()> {
        let node = self.remote_lstat(path)?;
        if !node.is_dir() {
            return self.fs.remove(path);
        }

        struct Remove<'a, F: RemoteFs + ?Sized> {
            fs: &'a F,
        }

        impl<F: RemoteFs + ?Sized> FileVisitor for Remove<'_, F> {
            fn visit_file(&mut self, file: &RemoteFile) -> Result<VisitResult> {
                self.fs.remove(file.path())?;
                Ok(VisitResult::Continue)
            }

            fn post_visit_directory(&mut self, dir: &RemoteFile, error: Option<SyncError>) -> Result<VisitResult> {
                if let Some(e) = error {
                    return Err(e);
                }
                self.fs.remove_dir(dir.path())?;
                Ok(VisitResult::Continue)
            }
        }

        walk(&*self.fs, path, &mut Remove { fs: &*self.fs })?;
        tracing::debug!("Removed {} recursively", path);
        Ok(())
    }

    /// Walk the remote tree at `path`.
    pub fn visit<V: FileVisitor + ?Sized>(&self, path: &str, visitor: &mut V) -> Result<VisitResult> {
        walk(&*self.fs, path, visitor)
    }

    // =========================================================================
    // Streams
    // =========================================================================

    fn lazy_size(&self, path: &str) -> TransferSize {
        let fs = self.fs.clone();
        let path = path.to_string();
        TransferSize::lazy(move || fs.stat(&path).map(|f| f.size()))
    }

    /// Read a remote file starting at `offset`.
    ///
    /// A non-zero offset needs `RAW_HANDLES`; without it the file is
    /// streamed through a background `get_to`.
    pub fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn ReadStream>> {
        let size = self.lazy_size(path);
        if self.capable(Capabilities::RAW_HANDLES) {
            let mut handle = self.fs.open_handle(path, self.open_flags(OpenFlags::READ), 0)?;
            handle.seek(offset);
            let reader = HandleReader::new(handle, self.config.buffer_size);
            return Ok(Box::new(ProgressReader::new(
                reader,
                self.listeners.clone(),
                path,
                "stream",
                size,
            )));
        }
        if offset != 0 {
            return Err(SyncError::Unsupported("open_read at offset"));
        }
        let reader = PipedTransfer::reader(self.fs.clone(), path, &self.config)?;
        Ok(Box::new(ProgressReader::new(
            reader,
            self.listeners.clone(),
            path,
            "stream",
            size,
        )))
    }

    /// Write a remote file starting at `offset`. Offset zero replaces the
    /// file; any other offset keeps what is already there.
    pub fn open_write(&self, path: &str, permissions: u32, offset: u64) -> Result<Box<dyn WriteStream>> {
        if self.capable(Capabilities::RAW_HANDLES) {
            let flags = if offset == 0 {
                OpenFlags::overwrite()
            } else {
                OpenFlags::WRITE | OpenFlags::CREATE
            };
            let mut handle = self.fs.open_handle(path, self.open_flags(flags), permissions)?;
            handle.seek(offset);
            let writer = HandleWriter::new(handle, self.config.buffer_size);
            return Ok(Box::new(ProgressWriter::new(
                writer,
                self.listeners.clone(),
                "stream",
                path,
                TransferSize::Unknown,
            )));
        }
        if offset != 0 {
            return Err(SyncError::Unsupported("open_write at offset"));
        }
        let writer = PipedTransfer::writer(self.fs.clone(), path, permissions, &self.config)?;
        Ok(Box::new(ProgressWriter::new(
            writer,
            self.listeners.clone(),
            "stream",
            path,
            TransferSize::Unknown,
        )))
    }

    // =========================================================================
    // Single files
    // =========================================================================

    /// Download one file. A directory `local` receives `basename(remote)`.
    pub fn get_file(&self, remote: &str, local: &Path) -> Result<u64> {
        let source = self.fs.stat(remote)?;
        if source.is_dir() {
            return Err(SyncError::status(StatusCode::FileIsADirectory, remote));
        }
        let target = if local.is_dir() {
            local.join(basename(remote))
        } else {
            local.to_path_buf()
        };
        self.fetch(&source, &target)
    }

    /// Copy `source` to `target` through a temp file in the target directory.
    fn fetch(&self, source: &RemoteFile, target: &Path) -> Result<u64> {
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".remsync-")
            .tempfile_in(dir)
            .map_err(|e| SyncError::io("create temp file", dir, e))?;

        let label = target.display().to_string();
        let size = TransferSize::Known(source.size());
        let copied = if self.capable(Capabilities::RAW_HANDLES) {
            let handle = self
                .fs
                .open_handle(source.path(), self.open_flags(OpenFlags::READ), 0)?;
            let mut reader = ProgressReader::new(
                HandleReader::new(handle, self.config.buffer_size),
                self.listeners.clone(),
                source.path(),
                label,
                size,
            );
            let copied = io::copy(&mut reader, tmp.as_file_mut())
                .map_err(|e| SyncError::from_io("download", target, e))?;
            reader
                .close()
                .map_err(|e| SyncError::from_io("close", source.path(), e))?;
            copied
        } else {
            let mut writer = ProgressWriter::new(
                tmp.as_file_mut(),
                self.listeners.clone(),
                source.path(),
                label,
                size,
            );
            let copied = self.fs.get_to(source.path(), &mut writer)?;
            writer.finish();
            copied
        };

        let mode = match source.permissions() {
            0 => self.config.file_permissions,
            mode => mode,
        };
        set_local_permissions(tmp.path(), mode).map_err(|e| SyncError::io("chmod", tmp.path(), e))?;
        tmp.persist(target)
            .map_err(|e| SyncError::io("persist", target, e.error))?;

        if self.config.preserve_times {
            filetime::set_file_mtime(target, FileTime::from_system_time(source.modified_at()))
                .map_err(|e| SyncError::io("set mtime", target, e))?;
        }
        tracing::info!("Downloaded {} -> {} ({} bytes)", source.path(), target.display(), copied);
        Ok(copied)
    }

    /// Upload one file. A directory `remote` receives the local file name.
    pub fn put_file(&self, local: &Path, remote: &str) -> Result<u64> {
        let meta = fs::metadata(local).map_err(|e| SyncError::io("stat", local, e))?;
        if meta.is_dir() {
            return Err(SyncError::io(
                "upload",
                local,
                io::Error::new(io::ErrorKind::InvalidInput, "is a directory"),
            ));
        }
        let target = match self.fs.stat(remote) {
            Ok(existing) if existing.is_dir() => {
                let name = local
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                join(remote, &name)
            }
            _ => remote.to_string(),
        };
        self.push(local, &meta, &target)
    }

    fn push(&self, local: &Path, meta: &fs::Metadata, remote: &str) -> Result<u64> {
        let permissions = match local_permissions(meta) {
            0 => self.config.file_permissions,
            mode => mode,
        };
        let file = File::open(local).map_err(|e| SyncError::io("open", local, e))?;
        let label = local.display().to_string();
        let size = TransferSize::Known(meta.len());

        let copied = if self.capable(Capabilities::RAW_HANDLES) {
            let handle = self
                .fs
                .open_handle(remote, self.open_flags(OpenFlags::overwrite()), permissions)?;
            let mut writer = ProgressWriter::new(
                HandleWriter::new(handle, self.config.buffer_size),
                self.listeners.clone(),
                label,
                remote,
                size,
            );
            let mut file = file;
            let copied =
                io::copy(&mut file, &mut writer).map_err(|e| SyncError::from_io("upload", local, e))?;
            writer.close().map_err(|e| SyncError::from_io("close", remote, e))?;
            copied
        } else {
            let mut reader = ProgressReader::new(file, self.listeners.clone(), label, remote, size);
            let copied = self.fs.put_from(remote, &mut reader, permissions)?;
            reader.finish();
            copied
        };

        if self.config.preserve_times && self.capable(Capabilities::SET_MOD_TIME) {
            if let Ok(modified) = meta.modified() {
                self.fs.set_mod_time(remote, modified)?;
            }
        }
        tracing::info!("Uploaded {} -> {} ({} bytes)", local.display(), remote, copied);
        Ok(copied)
    }

    /// Continue a partial download, appending from the local file's length.
    pub fn resume_get(&self, remote: &str, local: &Path) -> Result<u64> {
        let source = self.fs.stat(remote)?;
        let offset = match fs::metadata(local) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(SyncError::io("stat", local, e)),
        };
        if offset >= source.size() {
            return Ok(0);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(local)
            .map_err(|e| SyncError::io("open", local, e))?;
        let mut reader = self.open_read(remote, offset)?;
        let copied = io::copy(&mut reader, &mut file).map_err(|e| SyncError::from_io("download", local, e))?;
        reader.close().map_err(|e| SyncError::from_io("close", remote, e))?;

        if self.config.preserve_times {
            filetime::set_file_mtime(local, FileTime::from_system_time(source.modified_at()))
                .map_err(|e| SyncError::io("set mtime", local, e))?;
        }
        tracing::info!("Resumed {} at {} (+{} bytes)", remote, offset, copied);
        Ok(copied)
    }

    /// Continue a partial upload from the remote file's length.
    pub fn resume_put(&self, local: &Path, remote: &str) -> Result<u64> {
        let meta = fs::metadata(local).map_err(|e| SyncError::io("stat", local, e))?;
        let offset = match self.fs.stat(remote) {
            Ok(existing) => existing.size(),
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };
        if offset >= meta.len() {
            return Ok(0);
        }

        let mut file = File::open(local).map_err(|e| SyncError::io("open", local, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| SyncError::io("seek", local, e))?;
        let mut writer = self.open_write(remote, local_permissions(&meta), offset)?;
        let copied = io::copy(&mut file, &mut writer).map_err(|e| SyncError::from_io("upload", local, e))?;
        writer.close().map_err(|e| SyncError::from_io("close", remote, e))?;

        if self.config.preserve_times && self.capable(Capabilities::SET_MOD_TIME) {
            if let Ok(modified) = meta.modified() {
                self.fs.set_mod_time(remote, modified)?;
            }
        }
        tracing::info!("Resumed {} at {} (+{} bytes)", remote, offset, copied);
        Ok(copied)
    }

    // =========================================================================
    // Download
    // =========================================================================

    /// Bring `local_dir` in line with `remote_dir`.
    pub fn download(&self, remote_dir: &str, local_dir: &Path, options: SyncOptions) -> Result<SyncOperation> {
        let op = self.download_dir(remote_dir, local_dir, "", options)?;
        tracing::info!("Download {} -> {}: {}", remote_dir, local_dir.display(), op);
        Ok(op)
    }

    fn download_dir(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        prefix: &str,
        options: SyncOptions,
    ) -> Result<SyncOperation> {
        let entries = self.fs.list_dir(remote_dir)?;
        if options.commit {
            fs::create_dir_all(local_dir).map_err(|e| SyncError::io("mkdir", local_dir, e))?;
        }

        let mut op = SyncOperation::new();
        let mut remote_names = HashSet::new();

        for entry in entries {
            if is_dot_entry(entry.name()) {
                continue;
            }
            remote_names.insert(entry.name().to_string());
            let relative = join_relative(prefix, entry.name());
            let target = local_dir.join(entry.name());
            let existing = fs::symlink_metadata(&target).ok();

            if entry.is_dir() {
                if !options.recurse {
                    tracing::debug!("Not descending into {}", entry.path());
                    continue;
                }
                if let Some(meta) = existing.as_ref().filter(|m| !m.is_dir()) {
                    if options.commit {
                        let removed = if meta.file_type().is_symlink() || meta.is_file() {
                            fs::remove_file(&target)
                        } else {
                            fs::remove_dir_all(&target)
                        };
                        if let Err(e) = removed {
                            tracing::warn!("Failed to remove {}: {}", target.display(), e);
                            op.record_error(relative, SyncError::io("remove", &target, e));
                            continue;
                        }
                    }
                    op.record(Outcome::Deleted, relative.clone());
                }
                match self.download_dir(entry.path(), &target, &relative, options) {
                    Ok(sub) => op.add(sub),
                    Err(e) => {
                        tracing::warn!("Failed to download {}: {}", entry.path(), e);
                        op.record_error(relative, e);
                    }
                }
                continue;
            }

            if !entry.is_file() {
                tracing::debug!("Skipping {} ({:?})", entry.path(), entry.kind());
                continue;
            }

            let outcome = match &existing {
                None => Outcome::Created,
                Some(meta)
                    if meta.is_file()
                        && meta.len() == entry.size()
                        && local_mtime_secs(meta) == entry.mtime_secs() =>
                {
                    Outcome::Unchanged
                }
                Some(_) => Outcome::Updated,
            };
            op.record(outcome, relative.clone());
            tracing::debug!("{:?}: {}", outcome, relative);
            if outcome == Outcome::Unchanged {
                continue;
            }
            op.increase_size(entry.size());
            if !options.commit {
                continue;
            }

            if existing.as_ref().is_some_and(|m| m.is_dir()) {
                if let Err(e) = fs::remove_dir_all(&target) {
                    op.record_error(relative, SyncError::io("remove", &target, e));
                    continue;
                }
            }
            if let Err(e) = self.fetch(&entry, &target) {
                tracing::warn!("Failed to download {}: {}", entry.path(), e);
                op.record_error(relative, e);
            }
        }

        if options.sync {
            self.delete_local_extras(local_dir, prefix, &remote_names, &mut op, options.commit)?;
        }
        Ok(op)
    }

    fn delete_local_extras(
        &self,
        local_dir: &Path,
        prefix: &str,
        remote_names: &HashSet<String>,
        op: &mut SyncOperation,
        commit: bool,
    ) -> Result<()> {
        if !local_dir.is_dir() {
            return Ok(());
        }
        for entry in read_local_dir(local_dir, prefix)? {
            let name = entry.name();
            if op.contains(&entry.relative) || remote_names.contains(&name) {
                continue;
            }
            let mut doomed = Vec::new();
            if entry.is_dir() {
                match local_subtree(&entry.path, &entry.relative) {
                    Ok(below) => doomed = below,
                    Err(e) => {
                        op.record_error(entry.relative.clone(), e);
                        continue;
                    }
                }
            }
            if commit {
                let removed = if entry.is_dir() {
                    fs::remove_dir_all(&entry.path)
                } else {
                    fs::remove_file(&entry.path)
                };
                if let Err(e) = removed {
                    tracing::warn!("Failed to delete {}: {}", entry.path.display(), e);
                    op.record_error(entry.relative.clone(), SyncError::io("remove", &entry.path, e));
                    continue;
                }
            }
            doomed.push(entry.relative.clone());
            for path in doomed {
                op.record(Outcome::Deleted, path);
            }
            tracing::debug!("Deleted: {}", entry.relative);
        }
        Ok(())
    }

    // =========================================================================
    // Upload
    // =========================================================================

    /// Bring `remote_dir` in line with `local_dir`.
    pub fn upload(&self, local_dir: &Path, remote_dir: &str, options: SyncOptions) -> Result<SyncOperation> {
        if !local_dir.is_dir() {
            return Err(SyncError::io(
                "upload",
                local_dir,
                io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }
        let mut visitor = Upload {
            engine: self,
            remote_root: remote_dir.trim_end_matches('/').to_string(),
            options,
            stack: Vec::new(),
            result: None,
        };
        walk_local(local_dir, &mut visitor)?;
        let op = visitor.result.unwrap_or_default();
        tracing::info!("Upload {} -> {}: {}", local_dir.display(), remote_dir, op);
        Ok(op)
    }
}

/// Ledger of one open directory during an upload.
#[derive(Default)]
struct Frame {
    op: SyncOperation,
    /// The remote directory does not exist yet and a dry run will not
    /// create it, so nothing below it is looked up.
    remote_absent: bool,
}

/// Visitor behind `Engine::upload`. Keeps one ledger per open directory
/// and folds each into its parent on the way out.
struct Upload<'e, F: RemoteFs + ?Sized + 'static> {
    engine: &'e Engine<F>,
    remote_root: String,
    options: SyncOptions,
    stack: Vec<Frame>,
    result: Option<SyncOperation>,
}

impl<F: RemoteFs + ?Sized + 'static> Upload<'_, F> {
    fn remote_path(&self, relative: &str) -> String {
        match (self.remote_root.as_str(), relative) {
            (root, "") if root.is_empty() => "/".to_string(),
            (root, "") => root.to_string(),
            (root, rel) => join(root, rel),
        }
    }

    fn current(&mut self) -> &mut SyncOperation {
        if self.stack.is_empty() {
            self.stack.push(Frame::default());
        }
        let last = self.stack.len() - 1;
        &mut self.stack[last].op
    }

    fn parent_absent(&self) -> bool {
        self.stack.last().is_some_and(|f| f.remote_absent)
    }

    /// Make sure the remote directory for `dir` exists, replacing a
    /// non-directory in the way. Returns true when the directory is still
    /// missing afterwards, which only happens in a dry run.
    fn prepare_directory(&mut self, dir: &LocalEntry, remote: &str) -> Result<bool> {
        if self.parent_absent() {
            return Ok(true);
        }
        let engine = self.engine;
        let fs = engine.fs();
        let permissions = engine.config().dir_permissions;
        let commit = self.options.commit;
        match engine.remote_lstat(remote) {
            Ok(existing) if existing.is_dir() => Ok(false),
            Ok(_) if dir.is_root() => Err(SyncError::status_msg(
                StatusCode::NotADirectory,
                remote,
                "upload target is not a directory",
            )),
            Ok(_) => {
                if commit {
                    fs.remove(remote)?;
                }
                self.current().record(Outcome::Deleted, dir.relative.clone());
                if commit {
                    fs.mkdir(remote, permissions)?;
                }
                Ok(!commit)
            }
            Err(e) if e.is_not_found() => {
                if commit {
                    engine.mkdirs(remote, permissions)?;
                }
                Ok(!commit)
            }
            Err(e) => Err(e),
        }
    }

    fn delete_remote_extras(&self, dir: &LocalEntry, remote: &str, op: &mut SyncOperation) -> Result<()> {
        let fs = self.engine.fs();
        let entries = fs.list_dir(remote)?;
        let local_names: HashSet<String> = read_local_dir(&dir.path, &dir.relative)?
            .iter()
            .map(LocalEntry::name)
            .collect();

        for entry in entries {
            if is_dot_entry(entry.name()) || local_names.contains(entry.name()) {
                continue;
            }
            let relative = join_relative(&dir.relative, entry.name());
            if op.contains(&relative) {
                continue;
            }
            let mut doomed = Vec::new();
            if entry.is_dir() {
                match remote_subtree(fs, entry.path(), &relative) {
                    Ok(below) => doomed = below,
                    Err(e) => {
                        op.record_error(relative, e);
                        continue;
                    }
                }
            }
            if self.options.commit {
                let removed = if entry.is_dir() {
                    self.engine.remove_recursive(entry.path())
                } else {
                    fs.remove(entry.path())
                };
                if let Err(e) = removed {
                    tracing::warn!("Failed to delete {}: {}", entry.path(), e);
                    op.record_error(relative, e);
                    continue;
                }
            }
            doomed.push(relative.clone());
            for path in doomed {
                op.record(Outcome::Deleted, path);
            }
            tracing::debug!("Deleted: {}", relative);
        }
        Ok(())
    }
}

impl<F: RemoteFs + ?Sized + 'static> LocalVisitor for Upload<'_, F> {
    fn pre_visit_directory(&mut self, dir: &LocalEntry) -> Result<VisitResult> {
        if !dir.is_root() && !self.options.recurse {
            tracing::debug!("Not descending into {}", dir.path.display());
            return Ok(VisitResult::SkipSubtree);
        }
        let remote = self.remote_path(&dir.relative);
        let remote_absent = match self.prepare_directory(dir, &remote) {
            Ok(absent) => absent,
            Err(e) if dir.is_root() => return Err(e),
            Err(e) => {
                tracing::warn!("Failed to prepare {}: {}", remote, e);
                self.current().record_error(dir.relative.clone(), e);
                return Ok(VisitResult::SkipSubtree);
            }
        };
        self.stack.push(Frame {
            op: SyncOperation::new(),
            remote_absent,
        });
        Ok(VisitResult::Continue)
    }

    fn visit_file(&mut self, file: &LocalEntry) -> Result<VisitResult> {
        if !file.is_file() {
            tracing::debug!("Skipping {} (not a regular file)", file.path.display());
            return Ok(VisitResult::Continue);
        }
        let engine = self.engine;
        let remote = self.remote_path(&file.relative);
        let existing = if self.parent_absent() {
            None
        } else {
            match engine.remote_lstat(&remote) {
                Ok(existing) => Some(existing),
                Err(e) if e.is_not_found() => None,
                Err(e) => {
                    self.current().record_error(file.relative.clone(), e);
                    return Ok(VisitResult::Continue);
                }
            }
        };

        let conflict = existing.as_ref().is_some_and(|r| r.is_dir() || r.is_symlink());
        let outcome = match &existing {
            None => Outcome::Created,
            Some(r) if r.is_file() && r.size() == file.size() && r.mtime_secs() == file.mtime_secs() => {
                Outcome::Unchanged
            }
            Some(_) => Outcome::Updated,
        };
        let commit = self.options.commit;
        let op = self.current();
        op.record(outcome, file.relative.clone());
        tracing::debug!("{:?}: {}", outcome, file.relative);
        if outcome == Outcome::Unchanged {
            return Ok(VisitResult::Continue);
        }
        op.increase_size(file.size());
        if !commit {
            return Ok(VisitResult::Continue);
        }

        if conflict {
            let removed = match &existing {
                Some(r) if r.is_dir() => engine.remove_recursive(&remote),
                _ => engine.fs().remove(&remote),
            };
            if let Err(e) = removed {
                self.current().record_error(file.relative.clone(), e);
                return Ok(VisitResult::Continue);
            }
        }
        if let Err(e) = engine.push(&file.path, &file.metadata, &remote) {
            tracing::warn!("Failed to upload {}: {}", file.path.display(), e);
            self.current().record_error(file.relative.clone(), e);
        }
        Ok(VisitResult::Continue)
    }

    fn post_visit_directory(&mut self, dir: &LocalEntry, error: Option<SyncError>) -> Result<VisitResult> {
        let Frame { mut op, remote_absent } = self.stack.pop().unwrap_or_default();
        if let Some(e) = error {
            op.record_error(ledger_key(&dir.relative), e);
        }
        if self.options.sync && !remote_absent {
            let remote = self.remote_path(&dir.relative);
            if let Err(e) = self.delete_remote_extras(dir, &remote, &mut op) {
                tracing::warn!("Failed to list {}: {}", remote, e);
                op.record_error(ledger_key(&dir.relative), e);
            }
        }
        match self.stack.last_mut() {
            Some(parent) => parent.op.add(op),
            None => self.result = Some(op),
        }
        Ok(VisitResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    struct Fixture {
        remote: TempDir,
        local: TempDir,
        engine: Engine<LocalBackend>,
    }

    fn fixture(raw_handles: bool) -> Fixture {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let fs = LocalBackend::new(remote.path())
            .unwrap()
            .with_raw_handles(raw_handles);
        Fixture {
            engine: Engine::new(Arc::new(fs)),
            remote,
            local,
        }
    }

    fn write_at(path: &Path, data: &[u8], mtime: i64) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, data).unwrap();
        filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    #[test]
    fn test_exists_and_mkdirs() {
        let f = fixture(true);
        assert!(!f.engine.exists("/a").unwrap());
        f.engine.mkdirs("/a/b/c", 0o755).unwrap();
        assert!(f.engine.exists("/a/b/c").unwrap());
        assert!(f.remote.path().join("a/b/c").is_dir());
        f.engine.mkdirs("/a/b/c", 0o755).unwrap();

        fs::write(f.remote.path().join("file"), b"x").unwrap();
        let err = f.engine.mkdirs("/file/sub", 0o755).unwrap_err();
        assert_eq!(err.code(), Some(StatusCode::NotADirectory));
    }

    #[test]
    fn test_remove_recursive() {
        let f = fixture(true);
        write_at(&f.remote.path().join("t/a/b.txt"), b"b", 1000);
        write_at(&f.remote.path().join("t/c.txt"), b"c", 1000);
        f.engine.remove_recursive("/t").unwrap();
        assert!(!f.remote.path().join("t").exists());
        assert!(f.engine.remove_recursive("/t").unwrap_err().is_not_found());
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_recursive_does_not_follow_symlinks() {
        let f = fixture(true);
        write_at(&f.remote.path().join("keep/x.txt"), b"x", 1000);
        std::os::unix::fs::symlink(f.remote.path().join("keep"), f.remote.path().join("link")).unwrap();
        f.engine.remove_recursive("/link").unwrap();
        assert!(f.remote.path().join("keep/x.txt").exists());
        assert!(fs::symlink_metadata(f.remote.path().join("link")).is_err());
    }

    #[test]
    fn test_get_and_put_file_both_modes() {
        for raw in [true, false] {
            let f = fixture(raw);
            let src = f.local.path().join("up.bin");
            write_at(&src, &b"payload".repeat(10_000), 1_500_000_000);

            let sent = f.engine.put_file(&src, "/").unwrap();
            assert_eq!(sent, 70_000);
            let remote = f.engine.fs().stat("/up.bin").unwrap();
            assert_eq!(remote.size(), 70_000);
            assert_eq!(remote.mtime_secs(), 1_500_000_000);

            let out_dir = f.local.path().join("down");
            fs::create_dir(&out_dir).unwrap();
            assert_eq!(f.engine.get_file("/up.bin", &out_dir).unwrap(), 70_000);
            let fetched = out_dir.join("up.bin");
            assert_eq!(fs::read(&fetched).unwrap(), fs::read(&src).unwrap());
            let meta = fs::metadata(&fetched).unwrap();
            assert_eq!(local_mtime_secs(&meta), 1_500_000_000);
        }
    }

    #[test]
    fn test_get_file_rejects_directory() {
        let f = fixture(true);
        fs::create_dir(f.remote.path().join("d")).unwrap();
        let err = f.engine.get_file("/d", f.local.path()).unwrap_err();
        assert_eq!(err.code(), Some(StatusCode::FileIsADirectory));
    }

    #[test]
    fn test_open_read_and_write_streams() {
        for raw in [true, false] {
            let f = fixture(raw);
            let mut writer = f.engine.open_write("/s.txt", 0o644, 0).unwrap();
            io::Write::write_all(&mut writer, b"streamed contents").unwrap();
            writer.close().unwrap();

            let mut reader = f.engine.open_read("/s.txt", 0).unwrap();
            let mut text = String::new();
            io::Read::read_to_string(&mut reader, &mut text).unwrap();
            reader.close().unwrap();
            assert_eq!(text, "streamed contents");
        }
    }

    #[test]
    fn test_offsets_need_raw_handles() {
        let f = fixture(false);
        fs::write(f.remote.path().join("x"), b"abc").unwrap();
        assert!(f.engine.open_read("/x", 1).err().unwrap().is_unsupported());
        assert!(f.engine.open_write("/x", 0o644, 1).err().unwrap().is_unsupported());
    }

    #[test]
    fn test_resume_get_and_put() {
        let f = fixture(true);
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(f.remote.path().join("big"), &data).unwrap();

        let partial = f.local.path().join("big");
        fs::write(&partial, &data[..12_345]).unwrap();
        assert_eq!(f.engine.resume_get("/big", &partial).unwrap(), (50_000 - 12_345) as u64);
        assert_eq!(fs::read(&partial).unwrap(), data);
        assert_eq!(f.engine.resume_get("/big", &partial).unwrap(), 0);

        fs::write(f.remote.path().join("big"), &data[..7]).unwrap();
        assert_eq!(f.engine.resume_put(&partial, "/big").unwrap(), (50_000 - 7) as u64);
        assert_eq!(fs::read(f.remote.path().join("big")).unwrap(), data);
    }

    #[test]
    fn test_transfer_mode_needs_capability() {
        let mut f = fixture(true);
        assert!(f.engine.set_transfer_mode(TransferMode::Text).unwrap_err().is_unsupported());
        assert_eq!(f.engine.transfer_mode(), TransferMode::Binary);
        assert!(f.engine.set_eol_policy(&[EolPolicy::RemoteLf]).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_download_dry_run_creates_nothing() {
        let f = fixture(true);
        write_at(&f.remote.path().join("sub/a.txt"), b"a", 1000);
        let target = f.local.path().join("new");

        let op = f
            .engine
            .download("/", &target, SyncOptions::new(true, true, false))
            .unwrap();
        assert_eq!(op.created(), &["sub/a.txt".to_string()]);
        assert_eq!(op.size(), 1);
        assert!(!target.exists());
    }

    #[test]
    fn test_download_replaces_local_file_with_directory() {
        let f = fixture(true);
        write_at(&f.remote.path().join("d/inner.txt"), b"inner", 1000);
        write_at(&f.local.path().join("d"), b"not a dir", 1000);

        let op = f.engine.download("/", f.local.path(), SyncOptions::default()).unwrap();
        assert_eq!(op.deleted(), &["d".to_string()]);
        assert_eq!(op.created(), &["d/inner.txt".to_string()]);
        assert!(f.local.path().join("d/inner.txt").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_download_failed_removal_is_not_deleted() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture(true);
        write_at(&f.remote.path().join("d/inner.txt"), b"inner", 1000);
        let locked = f.local.path().join("locked");
        write_at(&locked.join("d"), b"not a dir", 1000);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();
        // Permission bits do not stop root.
        if fs::write(locked.join("writable"), b"").is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let op = f.engine.download("/", &locked, SyncOptions::default()).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(op.deleted().is_empty());
        assert!(op.errors().contains_key("d"));
        assert!(locked.join("d").is_file());
    }

    #[test]
    fn test_upload_marks_remote_subtree_deleted_deepest_first() {
        let f = fixture(true);
        write_at(&f.remote.path().join("old/deep/x.txt"), b"x", 1000);
        fs::create_dir(f.local.path().join("src")).unwrap();

        let op = f
            .engine
            .upload(&f.local.path().join("src"), "/", SyncOptions::new(true, true, true))
            .unwrap();
        assert_eq!(op.deleted(), &["old/deep/x.txt", "old/deep", "old"]);
        assert!(!f.remote.path().join("old").exists());
    }

    #[test]
    fn test_mtime_equality_is_whole_seconds() {
        let f = fixture(true);
        write_at(&f.remote.path().join("a.txt"), b"same", 2000);
        let local = f.local.path().join("a.txt");
        fs::write(&local, b"same").unwrap();
        let at = UNIX_EPOCH + Duration::from_millis(2_000_700);
        filetime::set_file_mtime(&local, FileTime::from_system_time(at)).unwrap();

        let op = f
            .engine
            .download("/", f.local.path(), SyncOptions::new(false, false, false))
            .unwrap();
        assert_eq!(op.unchanged(), &["a.txt".to_string()]);
    }
}

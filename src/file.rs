//! Remote file metadata.

use chrono::{DateTime, Local};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::path::basename;

/// POSIX file type mask.
pub const S_IFMT: u32 = 0o170000;

/// Kind of a remote filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Fifo,
    Socket,
    CharDevice,
    BlockDevice,
    Unknown,
}

impl FileKind {
    /// Decode the type bits of a POSIX mode.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            0o060000 => FileKind::BlockDevice,
            0o020000 => FileKind::CharDevice,
            0o010000 => FileKind::Fifo,
            0o140000 => FileKind::Socket,
            0o120000 => FileKind::Symlink,
            0o040000 => FileKind::Directory,
            0o100000 => FileKind::File,
            _ => FileKind::Unknown,
        }
    }

    pub fn to_mode_bits(&self) -> u32 {
        match self {
            FileKind::BlockDevice => 0o060000,
            FileKind::CharDevice => 0o020000,
            FileKind::Fifo => 0o010000,
            FileKind::Socket => 0o140000,
            FileKind::Symlink => 0o120000,
            FileKind::Directory => 0o040000,
            FileKind::File => 0o100000,
            FileKind::Unknown => 0,
        }
    }

    /// Leading character of an `ls -l` listing.
    pub fn type_char(&self) -> char {
        match self {
            FileKind::BlockDevice => 'b',
            FileKind::CharDevice => 'c',
            FileKind::Fifo => 'p',
            FileKind::Socket => 'S',
            FileKind::Symlink => 'l',
            FileKind::Directory => 'd',
            FileKind::File => '-',
            FileKind::Unknown => '?',
        }
    }
}

/// One entry in a remote tree. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    path: String,
    name: String,
    kind: FileKind,
    size: u64,
    modified_at: SystemTime,
    created_at: SystemTime,
    accessed_at: SystemTime,
    uid: u32,
    gid: u32,
    permissions: u32,
}

impl RemoteFile {
    pub fn new(kind: FileKind, path: impl Into<String>) -> Self {
        let path = path.into();
        let name = basename(&path).to_string();
        Self {
            path,
            name,
            kind,
            size: 0,
            modified_at: UNIX_EPOCH,
            created_at: UNIX_EPOCH,
            accessed_at: UNIX_EPOCH,
            uid: 0,
            gid: 0,
            permissions: 0,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_modified(mut self, at: SystemTime) -> Self {
        self.modified_at = at;
        self
    }

    pub fn with_created(mut self, at: SystemTime) -> Self {
        self.created_at = at;
        self
    }

    pub fn with_accessed(mut self, at: SystemTime) -> Self {
        self.accessed_at = at;
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Permission bits; type bits in `mode` are dropped.
    pub fn with_permissions(mut self, mode: u32) -> Self {
        self.permissions = mode & 0o7777;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn modified_at(&self) -> SystemTime {
        self.modified_at
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn accessed_at(&self) -> SystemTime {
        self.accessed_at
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn permissions(&self) -> u32 {
        self.permissions
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    /// Modification time truncated to whole seconds since the epoch.
    ///
    /// Sync equality compares at this granularity because SFTP v3 only
    /// carries seconds.
    pub fn mtime_secs(&self) -> i64 {
        system_time_secs(self.modified_at)
    }

    /// `ls -l` style mode, e.g. `drwxr-xr-x`.
    pub fn permissions_string(&self) -> String {
        let mut out = String::with_capacity(10);
        out.push(self.kind.type_char());
        for shift in [6u32, 3, 0] {
            let bits = (self.permissions >> shift) & 0o7;
            out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        out
    }

    /// Octal mask with a leading zero, e.g. `0644`.
    pub fn mask_string(&self) -> String {
        format!("0{:03o}", self.permissions & 0o777)
    }
}

impl fmt::Display for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let modified: DateTime<Local> = self.modified_at.into();
        write!(
            f,
            "{}\t{}\t{}",
            self.name,
            self.size,
            modified.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// Whole seconds since the epoch, negative before it.
pub fn system_time_secs(at: SystemTime) -> i64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => {
            let before = e.duration();
            let secs = before.as_secs() as i64;
            if before.subsec_nanos() > 0 {
                -secs - 1
            } else {
                -secs
            }
        }
    }
}

//! Open flags and text-mode transfer settings.

/// POSIX `open(2)` values (Linux numbering).
pub mod posix {
    pub const O_RDONLY: u32 = 0;
    pub const O_WRONLY: u32 = 0o1;
    pub const O_RDWR: u32 = 0o2;
    pub const O_ACCMODE: u32 = 0o3;
    pub const O_CREAT: u32 = 0o100;
    pub const O_EXCL: u32 = 0o200;
    pub const O_TRUNC: u32 = 0o1000;
    pub const O_APPEND: u32 = 0o2000;
}

bitflags::bitflags! {
    /// File-handle semantics requested from a backend.
    ///
    /// The bit values are the ordinal encoding: flag `i` in declaration
    /// order is `1 << i`, which matches SFTP v3 `pflags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const APPEND = 1 << 2;
        const CREATE = 1 << 3;
        const TRUNCATE = 1 << 4;
        const EXCLUSIVE = 1 << 5;
        const TEXT = 1 << 6;
    }
}

impl OpenFlags {
    /// Ordinal bit encoding.
    pub fn to_bits(self) -> u32 {
        self.bits()
    }

    /// Decode the ordinal encoding; unknown bits are dropped.
    pub fn from_ordinal_bits(bits: u32) -> Self {
        Self::from_bits_truncate(bits)
    }

    /// POSIX `open(2)` flags. `TEXT` has no POSIX equivalent.
    pub fn to_posix(self) -> u32 {
        let mut out = match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (true, true) => posix::O_RDWR,
            (false, true) => posix::O_WRONLY,
            _ => posix::O_RDONLY,
        };
        if self.contains(Self::APPEND) {
            out |= posix::O_APPEND;
        }
        if self.contains(Self::CREATE) {
            out |= posix::O_CREAT;
        }
        if self.contains(Self::TRUNCATE) {
            out |= posix::O_TRUNC;
        }
        if self.contains(Self::EXCLUSIVE) {
            out |= posix::O_EXCL;
        }
        out
    }

    pub fn from_posix(value: u32) -> Self {
        let mut flags = match value & posix::O_ACCMODE {
            posix::O_WRONLY => Self::WRITE,
            posix::O_RDWR => Self::READ | Self::WRITE,
            _ => Self::READ,
        };
        if value & posix::O_APPEND != 0 {
            flags |= Self::APPEND;
        }
        if value & posix::O_CREAT != 0 {
            flags |= Self::CREATE;
        }
        if value & posix::O_TRUNC != 0 {
            flags |= Self::TRUNCATE;
        }
        if value & posix::O_EXCL != 0 {
            flags |= Self::EXCLUSIVE;
        }
        flags
    }

    /// Flags for replacing a file's contents.
    pub fn overwrite() -> Self {
        Self::WRITE | Self::CREATE | Self::TRUNCATE
    }
}

/// How file contents are transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    #[default]
    Binary,
    Text,
}

/// Line-ending translation preference for text transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EolPolicy {
    /// Always use the remote convention, whatever the server advertises.
    ForceRemote,
    RemoteLf,
    RemoteCr,
    RemoteCrLf,
    LocalLf,
    LocalCr,
    LocalCrLf,
}

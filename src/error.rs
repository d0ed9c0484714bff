//! Error types for remsync.
//!
//! Backends report failures as SFTP-style status codes; local I/O failures
//! carry the operation and path that failed. Missing backend capabilities
//! are always `Unsupported`, never a status error.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Status codes a backend may report, numbered as in the SFTP drafts.
///
/// Codes outside the known set are kept as `Vendor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Eof,
    NoSuchFile,
    PermissionDenied,
    Failure,
    BadMessage,
    NoConnection,
    ConnectionLost,
    OpUnsupported,
    InvalidHandle,
    NoSuchPath,
    FileAlreadyExists,
    WriteProtect,
    NoMedia,
    NoSpaceOnFilesystem,
    QuotaExceeded,
    UnknownPrincipal,
    LockConflict,
    DirNotEmpty,
    NotADirectory,
    InvalidFilename,
    LinkLoop,
    CannotDelete,
    InvalidParameter,
    FileIsADirectory,
    ByteRangeLockConflict,
    ByteRangeLockRefused,
    DeletePending,
    FileCorrupt,
    OwnerInvalid,
    GroupInvalid,
    NoMatchingByteRangeLock,
    Vendor(u32),
}

const KNOWN_CODES: [StatusCode; 32] = [
    StatusCode::Ok,
    StatusCode::Eof,
    StatusCode::NoSuchFile,
    StatusCode::PermissionDenied,
    StatusCode::Failure,
    StatusCode::BadMessage,
    StatusCode::NoConnection,
    StatusCode::ConnectionLost,
    StatusCode::OpUnsupported,
    StatusCode::InvalidHandle,
    StatusCode::NoSuchPath,
    StatusCode::FileAlreadyExists,
    StatusCode::WriteProtect,
    StatusCode::NoMedia,
    StatusCode::NoSpaceOnFilesystem,
    StatusCode::QuotaExceeded,
    StatusCode::UnknownPrincipal,
    StatusCode::LockConflict,
    StatusCode::DirNotEmpty,
    StatusCode::NotADirectory,
    StatusCode::InvalidFilename,
    StatusCode::LinkLoop,
    StatusCode::CannotDelete,
    StatusCode::InvalidParameter,
    StatusCode::FileIsADirectory,
    StatusCode::ByteRangeLockConflict,
    StatusCode::ByteRangeLockRefused,
    StatusCode::DeletePending,
    StatusCode::FileCorrupt,
    StatusCode::OwnerInvalid,
    StatusCode::GroupInvalid,
    StatusCode::NoMatchingByteRangeLock,
];

impl StatusCode {
    /// Map a numeric server code to a status code.
    pub fn from_code(code: u32) -> Self {
        KNOWN_CODES
            .get(code as usize)
            .copied()
            .unwrap_or(StatusCode::Vendor(code))
    }

    /// Numeric server code.
    pub fn code(&self) -> u32 {
        match self {
            StatusCode::Vendor(code) => *code,
            known => KNOWN_CODES
                .iter()
                .position(|c| c == known)
                .map(|i| i as u32)
                .unwrap_or(u32::MAX),
        }
    }

    /// Stable identifier, e.g. `no-such-file` or `vendor-42`.
    pub fn name(&self) -> String {
        let name = match self {
            StatusCode::Ok => "ok",
            StatusCode::Eof => "eof",
            StatusCode::NoSuchFile => "no-such-file",
            StatusCode::PermissionDenied => "permission-denied",
            StatusCode::Failure => "failure",
            StatusCode::BadMessage => "bad-message",
            StatusCode::NoConnection => "no-connection",
            StatusCode::ConnectionLost => "connection-lost",
            StatusCode::OpUnsupported => "op-unsupported",
            StatusCode::InvalidHandle => "invalid-handle",
            StatusCode::NoSuchPath => "no-such-path",
            StatusCode::FileAlreadyExists => "file-already-exists",
            StatusCode::WriteProtect => "write-protect",
            StatusCode::NoMedia => "no-media",
            StatusCode::NoSpaceOnFilesystem => "no-space-on-filesystem",
            StatusCode::QuotaExceeded => "quota-exceeded",
            StatusCode::UnknownPrincipal => "unknown-principal",
            StatusCode::LockConflict => "lock-conflict",
            StatusCode::DirNotEmpty => "dir-not-empty",
            StatusCode::NotADirectory => "not-a-directory",
            StatusCode::InvalidFilename => "invalid-filename",
            StatusCode::LinkLoop => "link-loop",
            StatusCode::CannotDelete => "cannot-delete",
            StatusCode::InvalidParameter => "invalid-parameter",
            StatusCode::FileIsADirectory => "file-is-a-directory",
            StatusCode::ByteRangeLockConflict => "byte-range-lock-conflict",
            StatusCode::ByteRangeLockRefused => "byte-range-lock-refused",
            StatusCode::DeletePending => "delete-pending",
            StatusCode::FileCorrupt => "file-corrupt",
            StatusCode::OwnerInvalid => "owner-invalid",
            StatusCode::GroupInvalid => "group-invalid",
            StatusCode::NoMatchingByteRangeLock => "no-matching-byte-range-lock",
            StatusCode::Vendor(code) => return format!("vendor-{}", code),
        };
        name.to_string()
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            StatusCode::NoSuchFile | StatusCode::NoSuchPath => io::ErrorKind::NotFound,
            StatusCode::PermissionDenied | StatusCode::WriteProtect => {
                io::ErrorKind::PermissionDenied
            }
            StatusCode::FileAlreadyExists => io::ErrorKind::AlreadyExists,
            StatusCode::OpUnsupported => io::ErrorKind::Unsupported,
            StatusCode::Eof => io::ErrorKind::UnexpectedEof,
            StatusCode::NoConnection | StatusCode::ConnectionLost => {
                io::ErrorKind::ConnectionAborted
            }
            StatusCode::InvalidParameter | StatusCode::InvalidFilename => {
                io::ErrorKind::InvalidInput
            }
            _ => io::ErrorKind::Other,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Status reported by the backend.
    #[error("{}", format_status(.code, .path.as_deref(), .message.as_deref()))]
    Status {
        code: StatusCode,
        path: Option<String>,
        message: Option<String>,
    },

    /// Local filesystem or transport failure.
    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The backend lacks the capability the operation needs.
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// Raised while iterating a directory stream or inside a walk.
    #[error("Directory iteration failed: {0}")]
    Iteration(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn format_status(code: &StatusCode, path: Option<&str>, message: Option<&str>) -> String {
    match (path, message) {
        (Some(path), Some(msg)) => format!("{}: {} ({})", path, msg, code),
        (Some(path), None) => format!("{}: {}", path, code),
        (None, Some(msg)) => format!("{} ({})", msg, code),
        (None, None) => code.to_string(),
    }
}

impl SyncError {
    pub fn status(code: StatusCode, path: impl Into<String>) -> Self {
        SyncError::Status {
            code,
            path: Some(path.into()),
            message: None,
        }
    }

    pub fn status_msg(code: StatusCode, path: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Status {
            code,
            path: Some(path.into()),
            message: Some(message.into()),
        }
    }

    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Recover an error that crossed a `std::io` boundary.
    ///
    /// A `SyncError` carried inside the `io::Error` comes back unchanged;
    /// anything else is wrapped as `Io`.
    pub fn from_io(op: &'static str, path: impl Into<PathBuf>, err: io::Error) -> Self {
        let carries_sync_error = err.get_ref().is_some_and(|inner| inner.is::<SyncError>());
        if carries_sync_error {
            if let Some(inner) = err.into_inner() {
                if let Ok(sync) = inner.downcast::<SyncError>() {
                    return *sync;
                }
            }
            return SyncError::Iteration("lost inner error".to_string());
        }
        SyncError::io(op, path, err)
    }

    /// Status code, if this is a backend status error.
    pub fn code(&self) -> Option<StatusCode> {
        match self {
            SyncError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True for "no such file" in any of its forms.
    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::Status { code, .. } => {
                matches!(code, StatusCode::NoSuchFile | StatusCode::NoSuchPath)
            }
            SyncError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, SyncError::Unsupported(_))
            || self.code() == Some(StatusCode::OpUnsupported)
    }
}

impl From<SyncError> for io::Error {
    fn from(err: SyncError) -> Self {
        let kind = match &err {
            SyncError::Status { code, .. } => code.io_kind(),
            SyncError::Io { source, .. } => source.kind(),
            SyncError::Unsupported(_) => io::ErrorKind::Unsupported,
            SyncError::Iteration(_) | SyncError::Config(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

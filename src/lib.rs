//! remsync - remote filesystem sync and streaming.
//!
//! A backend implements a small set of filesystem primitives (`RemoteFs`);
//! on top of that the `Engine` provides directory download and upload with
//! change classification, dry runs, tree walking, and plain
//! `Read` / `Write` streams over remote files whether or not the backend
//! supports random-access handles.
//!
//! ```no_run
//! use remsync::{Engine, LocalBackend, SyncOptions};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> remsync::Result<()> {
//! let backend = LocalBackend::new("/srv/mirror")?;
//! let engine = Engine::new(Arc::new(backend));
//! let op = engine.download("/", Path::new("./copy"), SyncOptions::new(true, true, true))?;
//! println!("{}", op);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod file;
pub mod flags;
pub mod operation;
pub mod path;
pub mod stream;
pub mod sync;
pub mod visit;

pub use backend::{Capabilities, Handle, LocalBackend, RemoteFs};
#[cfg(feature = "ssh")]
pub use backend::Ssh2Backend;
pub use config::{Config, TransferConfig};
pub use error::{Result, StatusCode, SyncError};
pub use file::{FileKind, RemoteFile};
pub use flags::{EolPolicy, OpenFlags, TransferMode};
pub use operation::{Outcome, SyncOperation, SyncReport};
pub use sync::{Engine, SyncOptions};
pub use visit::{walk, walk_local, FileVisitor, LocalEntry, LocalVisitor, VisitResult};

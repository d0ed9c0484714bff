//! Configuration.
//!
//! Loaded from TOML; every field has a default so an empty or missing file
//! is valid.
//!
//! ```toml
//! [transfer]
//! buffer_size = 65536
//! pipe_capacity = 32
//! preserve_times = false
//!
//! [log]
//! level = "debug"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

/// Default chunk size for handle reads and writes (32KB)
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Default number of chunks a pipe holds before the writer blocks
pub const DEFAULT_PIPE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub transfer: TransferConfig,
    pub log: LogConfig,
}

/// Settings for moving file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Bytes per handle read/write call
    pub buffer_size: usize,

    /// Chunks buffered between a pipe's worker thread and its stream
    pub pipe_capacity: usize,

    /// Mode for files created without a source mode
    pub file_permissions: u32,

    /// Mode for directories created by sync and `mkdirs`
    pub dir_permissions: u32,

    /// Copy modification times to the target after a transfer
    pub preserve_times: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            file_permissions: 0o644,
            dir_permissions: 0o755,
            preserve_times: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `tracing` filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| SyncError::Config(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| SyncError::io("read config", path, e))?;
        Self::from_toml(&text).map_err(|e| match e {
            SyncError::Config(msg) => SyncError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// `<config_dir>/remsync/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("remsync").join("config.toml"))
    }

    /// Load the per-user config file, or defaults when there is none.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer.buffer_size == 0 {
            return Err(SyncError::Config("transfer.buffer_size must be > 0".to_string()));
        }
        if self.transfer.pipe_capacity == 0 {
            return Err(SyncError::Config("transfer.pipe_capacity must be > 0".to_string()));
        }
        if self.transfer.file_permissions > 0o7777 || self.transfer.dir_permissions > 0o7777 {
            return Err(SyncError::Config("permissions must fit in 0o7777".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.transfer.buffer_size, 32768);
        assert_eq!(config.transfer.pipe_capacity, 16);
        assert_eq!(config.transfer.file_permissions, 0o644);
        assert_eq!(config.transfer.dir_permissions, 0o755);
        assert!(config.transfer.preserve_times);
        assert_eq!(config.log.level, "warn");
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_override() {
        let config = Config::from_toml(
            r#"
            [transfer]
            buffer_size = 4096
            preserve_times = false
            "#,
        )
        .unwrap();
        assert_eq!(config.transfer.buffer_size, 4096);
        assert!(!config.transfer.preserve_times);
        assert_eq!(config.transfer.pipe_capacity, DEFAULT_PIPE_CAPACITY);
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let err = Config::from_toml("[transfer]\nbuffer_size = 0\n").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = Config::from_toml("[transfer]\nchunk = 1\n").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[log]\nlevel = \"debug\"\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.log.level, "debug");

        let missing = Config::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(missing.is_not_found());
    }
}

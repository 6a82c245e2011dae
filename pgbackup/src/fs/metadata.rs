//! File metadata captured at backup time and reapplied on restore.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Default mode for restored files when none was recorded
pub const DEFAULT_FILE_MODE: u32 = 0o600;

/// Default mode for restored directories when none was recorded
pub const DEFAULT_DIR_MODE: u32 = 0o700;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Last modified time (seconds since Unix epoch)
    pub mtime: i64,

    /// Unix permission bits
    pub mode: u32,

    pub is_dir: bool,
}

impl FileMetadata {
    /// Extract metadata from a path, following symlinks
    pub fn from_path(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path).map_err(|e| EngineError::file("stat", path, e))?;

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs() as i64);

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode() & 0o7777
        };

        #[cfg(not(unix))]
        let mode = if metadata.is_dir() {
            DEFAULT_DIR_MODE
        } else {
            DEFAULT_FILE_MODE
        };

        Ok(Self {
            size: metadata.len(),
            mtime,
            mode,
            is_dir: metadata.is_dir(),
        })
    }
}

/// Apply permission bits to a restored file or directory
#[cfg(unix)]
pub fn apply_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| EngineError::file("set permissions of", path, e))
}

#[cfg(not(unix))]
pub fn apply_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

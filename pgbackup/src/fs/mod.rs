//! File system helpers: data directory walking, metadata, stored file
//! formats.

pub mod copy;
pub mod metadata;
pub mod pagefile;
pub mod walker;

use crate::utils::errors::{EngineError, Result};
use std::path::Path;

/// Write `data` to `path` through a temporary file and a rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.tmp", name));
    {
        let mut file = std::fs::File::create(&tmp).map_err(|e| EngineError::file("create", &tmp, e))?;
        file.write_all(data).map_err(|e| EngineError::file("write", &tmp, e))?;
        file.sync_all().map_err(|e| EngineError::file("sync", &tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| EngineError::file("rename", &tmp, e))?;
    Ok(())
}

/// True when `dir` is missing or has no entries.
pub fn dir_is_empty(dir: &Path) -> Result<bool> {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(EngineError::file("read directory", dir, e)),
    }
}

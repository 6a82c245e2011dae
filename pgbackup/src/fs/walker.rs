//! Data directory traversal.
//!
//! Collects files, directories and tablespace links of a PGDATA tree with
//! the metadata needed for backup. Tablespace links under `pg_tblspc` are
//! reported as links and their targets are walked under the link's path.

use super::metadata::FileMetadata;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Directories whose content is never copied (the directory itself is).
pub const EXCLUDED_DIR_CONTENT: &[&str] = &[
    "pg_wal",
    "pg_xlog",
    "pg_replslot",
    "pg_stat_tmp",
    "pg_dynshmem",
    "pg_notify",
    "pg_serial",
    "pg_snapshots",
    "pg_subtrans",
];

/// Files never copied, matched by name anywhere in the tree.
pub const EXCLUDED_FILES: &[&str] = &[
    "postmaster.pid",
    "postmaster.opts",
    "backup_label",
    "tablespace_map",
    "pg_internal.init",
    "ptrack.map",
    "ptrack.map.mmap",
    "ptrack.map.tmp",
];

const TEMP_PREFIX: &str = "pgsql_tmp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "target")]
pub enum FileKind {
    File,
    Dir,
    Link(String),
}

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Paths to skip, absolute or relative to the root
    pub exclude_paths: Vec<PathBuf>,

    /// Keep PostgreSQL runtime files and directory contents
    pub include_runtime: bool,
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path on disk
    pub path: PathBuf,

    /// Path relative to the root, '/'-separated
    pub relative_path: String,

    pub kind: FileKind,

    pub metadata: FileMetadata,
}

impl FileInfo {
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }
}

fn relative_string(path: &Path, root: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Check if a relative path is excluded by the PostgreSQL rules or the
/// user's list.
fn should_exclude(rel: &str, is_dir: bool, root: &Path, options: &WalkOptions) -> bool {
    for excluded in &options.exclude_paths {
        let excluded_rel = if excluded.is_absolute() {
            match excluded.strip_prefix(root) {
                Ok(stripped) => relative_string(stripped, Path::new("")),
                Err(_) => continue,
            }
        } else {
            relative_string(excluded, Path::new(""))
        };
        if rel == excluded_rel || rel.starts_with(&format!("{}/", excluded_rel)) {
            return true;
        }
    }

    if options.include_runtime {
        return false;
    }

    let name = rel.rsplit('/').next().unwrap_or(rel);
    if name.starts_with(TEMP_PREFIX) {
        return true;
    }
    if !is_dir && EXCLUDED_FILES.contains(&name) {
        return true;
    }
    if let Some((parent, _)) = rel.rsplit_once('/') {
        let parent_name = parent.rsplit('/').next().unwrap_or(parent);
        // top-level runtime directories only
        if !parent.contains('/') && EXCLUDED_DIR_CONTENT.contains(&parent_name) {
            return true;
        }
    }
    false
}

fn is_tablespace_link(rel: &str) -> bool {
    matches!(rel.split_once('/'), Some(("pg_tblspc", oid)) if !oid.contains('/'))
}

fn walk_into(
    dir: &Path,
    prefix: &str,
    root: &Path,
    options: &WalkOptions,
    out: &mut Vec<FileInfo>,
) -> Result<()> {
    let mut walker = WalkDir::new(dir).follow_links(false).sort_by_file_name().into_iter();

    while let Some(entry) = walker.next() {
        let entry: DirEntry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
            EngineError::file("walk", &path, e.into())
        })?;
        if entry.depth() == 0 {
            continue;
        }
        let inner = relative_string(entry.path(), dir);
        let rel = if prefix.is_empty() {
            inner
        } else {
            format!("{}/{}", prefix, inner)
        };
        let file_type = entry.file_type();

        if should_exclude(&rel, file_type.is_dir(), root, options) {
            if file_type.is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        let path = entry.path().to_path_buf();
        if file_type.is_symlink() {
            let target = std::fs::read_link(&path).map_err(|e| EngineError::file("read link", &path, e))?;
            let resolved = match std::fs::metadata(&path) {
                Ok(resolved) => resolved,
                // broken link
                Err(_) => continue,
            };
            if resolved.is_dir() {
                let metadata = FileMetadata::from_path(&path)?;
                if is_tablespace_link(&rel) {
                    out.push(FileInfo {
                        path: path.clone(),
                        relative_path: rel.clone(),
                        kind: FileKind::Link(target.to_string_lossy().into_owned()),
                        metadata,
                    });
                } else {
                    out.push(FileInfo {
                        path: path.clone(),
                        relative_path: rel.clone(),
                        kind: FileKind::Dir,
                        metadata,
                    });
                }
                let resolved_dir = if target.is_absolute() {
                    target
                } else {
                    path.parent().unwrap_or(root).join(target)
                };
                walk_into(&resolved_dir, &rel, root, options, out)?;
                continue;
            }
        }

        let metadata = FileMetadata::from_path(&path)?;
        let kind = if metadata.is_dir {
            FileKind::Dir
        } else {
            FileKind::File
        };
        out.push(FileInfo {
            path,
            relative_path: rel,
            kind,
            metadata,
        });
    }
    Ok(())
}

/// Walk a data directory.
///
/// Entries come back in path order with each directory before its content.
pub fn walk_pgdata(root: &Path, options: &WalkOptions) -> Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_into(root, "", root, options, &mut files)?;
    Ok(files)
}

/// Calculate total size of all regular files
pub fn total_size(files: &[FileInfo]) -> u64 {
    files.iter().filter(|f| f.is_file()).map(|f| f.metadata.size).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn names(files: &[FileInfo]) -> Vec<&str> {
        files.iter().map(|f| f.relative_path.as_str()).collect()
    }

    #[test]
    fn test_walk_empty_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_pgdata(temp_dir.path(), &WalkOptions::default())?;
        assert!(files.is_empty());
        Ok(())
    }

    #[test]
    fn test_runtime_files_are_skipped() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir_all(root.join("base/1/pgsql_tmp"))?;
        fs::create_dir_all(root.join("pg_wal/archive_status"))?;
        fs::write(root.join("base/1/16384"), b"rel")?;
        fs::write(root.join("base/1/pgsql_tmp/pgsql_tmp1.0"), b"tmp")?;
        fs::write(root.join("pg_wal/000000010000000000000001"), b"wal")?;
        fs::write(root.join("postmaster.pid"), b"123")?;
        fs::write(root.join("PG_VERSION"), b"16")?;

        let files = walk_pgdata(root, &WalkOptions::default())?;
        assert_eq!(
            names(&files),
            vec!["PG_VERSION", "base", "base/1", "base/1/16384", "pg_wal"]
        );
        Ok(())
    }

    #[test]
    fn test_exclude_paths() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir_all(root.join("log"))?;
        fs::write(root.join("log/postgresql.log"), b"x")?;
        fs::write(root.join("postgresql.conf"), b"x")?;
        fs::write(root.join("postgresql.auto.conf"), b"x")?;

        let options = WalkOptions {
            exclude_paths: vec![PathBuf::from("log"), root.join("postgresql.conf")],
            include_runtime: false,
        };
        let files = walk_pgdata(root, &options)?;
        assert_eq!(names(&files), vec!["postgresql.auto.conf"]);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_tablespace_links_are_followed() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("data");
        let spc = temp_dir.path().join("spc");
        fs::create_dir_all(root.join("pg_tblspc"))?;
        fs::create_dir_all(spc.join("PG_16_202307071/5"))?;
        fs::write(spc.join("PG_16_202307071/5/16500"), b"rel")?;
        std::os::unix::fs::symlink(&spc, root.join("pg_tblspc/16400"))?;

        let files = walk_pgdata(&root, &WalkOptions::default())?;
        let link = files.iter().find(|f| f.relative_path == "pg_tblspc/16400").unwrap();
        assert_eq!(link.kind, FileKind::Link(spc.to_string_lossy().into_owned()));
        assert!(files
            .iter()
            .any(|f| f.relative_path == "pg_tblspc/16400/PG_16_202307071/5/16500" && f.is_file()));
        assert_eq!(total_size(&files), 3);
        Ok(())
    }
}

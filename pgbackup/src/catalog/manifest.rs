//! Per-backup file manifest and page header map.
//!
//! `file-manifest` is JSON lines, one [`FileEntry`] per entry of the data
//! directory. Both files are written under a `.partial` name while the copy
//! runs and renamed into place once everything is synced, so a finished
//! name always means a complete file.

use crate::fs::pagefile::{decode_headers, encode_headers, PageEntry, PAGE_ENTRY_SIZE};
use crate::fs::walker::{FileInfo, FileKind};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const MANIFEST_FILE: &str = "file-manifest";
pub const HEADER_MAP_FILE: &str = "page-header-map";
pub const DATABASE_DIR: &str = "database";

const PARTIAL_SUFFIX: &str = ".partial";

/// `write_size` of a file that did not change since the parent and has no
/// stored copy in this backup.
pub const BYTES_INVALID: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// PGDATA-relative path, '/'-separated
    pub path: String,
    pub kind: FileKind,
    /// Size in the source data directory
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    /// CRC32 of the file content, or of the stored pages for datafiles
    pub crc: u32,
    /// Bytes stored in this backup, `BYTES_INVALID` when unchanged
    pub write_size: i64,
    /// Main-fork relation segment stored page by page
    #[serde(default)]
    pub is_datafile: bool,
    /// Length of the relation segment in pages
    #[serde(default)]
    pub n_blocks: Option<u32>,
    /// Offset of this file's headers in `page-header-map`
    #[serde(default)]
    pub hdr_off: u64,
    #[serde(default)]
    pub n_headers: u32,
    #[serde(default)]
    pub hdr_crc: u32,
    #[serde(default)]
    pub compressed: bool,
}

impl FileEntry {
    /// Entry for a walked path with nothing stored yet.
    pub fn from_info(info: &FileInfo) -> Self {
        Self {
            path: info.relative_path.clone(),
            kind: info.kind.clone(),
            size: if info.is_file() { info.metadata.size } else { 0 },
            mode: info.metadata.mode,
            mtime: info.metadata.mtime,
            crc: 0,
            write_size: 0,
            is_datafile: false,
            n_blocks: None,
            hdr_off: 0,
            n_headers: 0,
            hdr_crc: 0,
            compressed: false,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        self.write_size == BYTES_INVALID
    }

    pub fn has_stored_copy(&self) -> bool {
        self.kind == FileKind::File && !self.is_unchanged()
    }

    /// Location of the stored copy inside a backup directory.
    pub fn stored_path(&self, backup_dir: &Path) -> PathBuf {
        backup_dir.join(DATABASE_DIR).join(&self.path)
    }
}

struct WriterState {
    manifest: BufWriter<File>,
    manifest_crc: crc32fast::Hasher,
    headers: BufWriter<File>,
    headers_pos: u64,
    entries: usize,
}

/// Incremental writer shared by copy workers.
pub struct ManifestWriter {
    dir: PathBuf,
    state: Mutex<WriterState>,
}

/// What a finished manifest amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestSummary {
    pub crc: u32,
    pub entries: usize,
}

fn partial(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}{}", name, PARTIAL_SUFFIX))
}

fn create_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| EngineError::file("create", path, e))
}

impl ManifestWriter {
    pub fn create(backup_dir: &Path) -> Result<Self> {
        let manifest = create_file(&partial(backup_dir, MANIFEST_FILE))?;
        let headers = create_file(&partial(backup_dir, HEADER_MAP_FILE))?;
        Ok(Self {
            dir: backup_dir.to_path_buf(),
            state: Mutex::new(WriterState {
                manifest: BufWriter::new(manifest),
                manifest_crc: crc32fast::Hasher::new(),
                headers: BufWriter::new(headers),
                headers_pos: 0,
                entries: 0,
            }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, WriterState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::Worker("manifest writer lock poisoned".to_string()))
    }

    /// Append page headers; returns their offset and checksum.
    pub fn append_headers(&self, entries: &[PageEntry]) -> Result<(u64, u32)> {
        let bytes = encode_headers(entries);
        let crc = crc32fast::hash(&bytes);
        let mut state = self.lock()?;
        let offset = state.headers_pos;
        state.headers.write_all(&bytes)?;
        state.headers_pos += bytes.len() as u64;
        Ok((offset, crc))
    }

    pub fn add(&self, entry: &FileEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut state = self.lock()?;
        state.manifest.write_all(&line)?;
        state.manifest_crc.update(&line);
        state.entries += 1;
        Ok(())
    }

    /// Sync both files and move them to their final names.
    pub fn finish(self) -> Result<ManifestSummary> {
        let state = self
            .state
            .into_inner()
            .map_err(|_| EngineError::Worker("manifest writer lock poisoned".to_string()))?;
        let WriterState {
            manifest,
            manifest_crc,
            headers,
            entries,
            ..
        } = state;

        for (writer, name) in [(manifest, MANIFEST_FILE), (headers, HEADER_MAP_FILE)] {
            let path = partial(&self.dir, name);
            let file = writer
                .into_inner()
                .map_err(|e| EngineError::file("write", &path, e.into_error()))?;
            file.sync_all().map_err(|e| EngineError::file("sync", &path, e))?;
            let target = self.dir.join(name);
            std::fs::rename(&path, &target).map_err(|e| EngineError::file("rename", &path, e))?;
        }

        Ok(ManifestSummary {
            crc: manifest_crc.finalize(),
            entries,
        })
    }
}

/// Write a complete manifest in one go.
pub fn write_manifest(backup_dir: &Path, entries: &[FileEntry], headers: &[u8]) -> Result<ManifestSummary> {
    let mut body = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut body, entry)?;
        body.push(b'\n');
    }
    crate::fs::write_atomic(&backup_dir.join(HEADER_MAP_FILE), headers)?;
    crate::fs::write_atomic(&backup_dir.join(MANIFEST_FILE), &body)?;
    Ok(ManifestSummary {
        crc: crc32fast::hash(&body),
        entries: entries.len(),
    })
}

pub fn read_manifest(backup_dir: &Path) -> Result<Vec<FileEntry>> {
    let path = backup_dir.join(MANIFEST_FILE);
    let file = File::open(&path).map_err(|e| EngineError::file("open", &path, e))?;
    let mut entries = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| EngineError::file("read", &path, e))?;
        if line.is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line).map_err(|e| {
            EngineError::Corruption(format!(
                "Manifest \"{}\" line {} is invalid: {}",
                path.display(),
                n + 1,
                e
            ))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

pub fn manifest_crc(backup_dir: &Path) -> Result<u32> {
    crate::fs::copy::file_crc(&backup_dir.join(MANIFEST_FILE))
}

/// Read and verify the page headers of one datafile entry.
pub fn read_headers(backup_dir: &Path, entry: &FileEntry) -> Result<Vec<PageEntry>> {
    if entry.n_headers == 0 {
        return Ok(Vec::new());
    }
    let path = backup_dir.join(HEADER_MAP_FILE);
    let mut file = File::open(&path).map_err(|e| EngineError::file("open", &path, e))?;
    let map_len = file
        .metadata()
        .map_err(|e| EngineError::file("stat", &path, e))?
        .len();
    let want = entry.n_headers as u64 * PAGE_ENTRY_SIZE as u64;
    if entry.hdr_off.checked_add(want).map_or(true, |end| end > map_len) {
        return Err(EngineError::Corruption(format!(
            "Page headers of \"{}\" are beyond the end of \"{}\"",
            entry.path,
            path.display()
        )));
    }
    let mut raw = vec![0u8; want as usize];
    file.seek(SeekFrom::Start(entry.hdr_off))
        .and_then(|_| file.read_exact(&mut raw))
        .map_err(|e| {
            EngineError::Corruption(format!("Cannot read page headers of \"{}\": {}", entry.path, e))
        })?;
    if crc32fast::hash(&raw) != entry.hdr_crc {
        return Err(EngineError::Corruption(format!(
            "Page headers of \"{}\" have invalid checksum",
            entry.path
        )));
    }
    decode_headers(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::Lsn;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn entry(path: &str) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            kind: FileKind::File,
            size: 8192,
            mode: 0o600,
            mtime: 1_700_000_000,
            crc: 7,
            write_size: 8192,
            is_datafile: true,
            n_blocks: Some(1),
            hdr_off: 0,
            n_headers: 0,
            hdr_crc: 0,
            compressed: false,
        }
    }

    #[tokio::test]
    async fn test_concurrent_writers_and_headers() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(ManifestWriter::create(dir.path()).unwrap());

        let mut handles = Vec::new();
        for i in 0..8u32 {
            let writer = Arc::clone(&writer);
            handles.push(tokio::task::spawn_blocking(move || {
                let pages = vec![PageEntry {
                    block: i,
                    compressed_size: 100 + i,
                    pos: 0,
                    lsn: Lsn(0x100 * i as u64),
                    crc: i,
                }];
                let (off, crc) = writer.append_headers(&pages).unwrap();
                let mut e = entry(&format!("base/5/{}", 16384 + i));
                e.hdr_off = off;
                e.hdr_crc = crc;
                e.n_headers = 1;
                writer.add(&e).unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(!dir.path().join(MANIFEST_FILE).exists());

        let writer = Arc::try_unwrap(writer).ok().unwrap();
        let summary = writer.finish().unwrap();
        assert_eq!(summary.entries, 8);
        assert_eq!(manifest_crc(dir.path()).unwrap(), summary.crc);

        let entries = read_manifest(dir.path()).unwrap();
        assert_eq!(entries.len(), 8);
        for e in &entries {
            let headers = read_headers(dir.path(), e).unwrap();
            assert_eq!(format!("base/5/{}", 16384 + headers[0].block), e.path);
        }
    }

    #[test]
    fn test_damaged_header_map_is_reported() {
        let dir = TempDir::new().unwrap();
        let pages = vec![PageEntry {
            block: 0,
            compressed_size: 8192,
            pos: 0,
            lsn: Lsn(1),
            crc: 1,
        }];
        let headers = encode_headers(&pages);
        let mut e = entry("base/5/16384");
        e.n_headers = 1;
        e.hdr_crc = crc32fast::hash(&headers);
        write_manifest(dir.path(), &[e.clone()], &headers).unwrap();

        let mut raw = std::fs::read(dir.path().join(HEADER_MAP_FILE)).unwrap();
        raw[2] ^= 0xFF;
        std::fs::write(dir.path().join(HEADER_MAP_FILE), raw).unwrap();
        let err = read_headers(dir.path(), &e).unwrap_err();
        assert!(err.to_string().contains("invalid checksum"));

        e.n_headers = u32::MAX;
        let err = read_headers(dir.path(), &e).unwrap_err();
        assert!(err.to_string().contains("beyond the end"));
    }
}

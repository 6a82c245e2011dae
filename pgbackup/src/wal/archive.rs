//! WAL archive of one instance: `<root>/wal/<instance>/`.
//!
//! The same type reads a live `pg_wal` directory, which holds plain
//! segments in the same naming scheme.

use super::reader::SegmentSource;
use super::record::WalPageHeader;
use super::segment::{
    archive_file_kind, history_file_name, ArchiveFileKind, SegmentName, COMPRESSED_SUFFIX,
};
use super::timeline::TimelineHistory;
use crate::pg::TimeLineId;
use crate::utils::errors::{EngineError, Result, WalError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Stored,
    /// Identical content was already archived.
    AlreadyArchived,
}

/// Validity of an archived segment, discovered on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentState {
    Valid,
    Corrupt(String),
    Absent,
}

#[derive(Debug, Clone)]
pub struct WalArchive {
    dir: PathBuf,
    seg_size: u32,
    system_id: u64,
    compress: bool,
    level: i32,
}

impl WalArchive {
    pub fn new(dir: impl Into<PathBuf>, seg_size: u32, system_id: u64) -> Self {
        Self {
            dir: dir.into(),
            seg_size,
            system_id,
            compress: false,
            level: 3,
        }
    }

    /// Store pushed segments zstd-compressed.
    pub fn with_compression(mut self, enabled: bool, level: i32) -> Self {
        self.compress = enabled;
        self.level = level;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn seg_size(&self) -> u32 {
        self.seg_size
    }

    /// Path of an archived file, whichever form it was stored in.
    fn locate(&self, name: &str) -> Option<PathBuf> {
        let plain = self.dir.join(name);
        if plain.is_file() {
            return Some(plain);
        }
        let packed = self.dir.join(format!("{}{}", name, COMPRESSED_SUFFIX));
        packed.is_file().then_some(packed)
    }

    /// Read an archived file, decompressing if needed.
    pub fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.locate(name) else {
            return Ok(None);
        };
        let raw = fs::read(&path).map_err(|e| EngineError::file("read", &path, e))?;
        if path.extension().and_then(|e| e.to_str()) == Some("zst") {
            let data = zstd::decode_all(raw.as_slice()).map_err(|e| WalError::SegmentCorrupt {
                name: name.to_string(),
                reason: format!("cannot decompress: {}", e),
            })?;
            return Ok(Some(data));
        }
        Ok(Some(raw))
    }

    /// Check the first page header of a segment image.
    fn check_header(&self, name: &str, data: &[u8], full_size: bool) -> Result<()> {
        let corrupt = |reason: String| WalError::SegmentCorrupt {
            name: name.to_string(),
            reason,
        };
        if full_size && data.len() != self.seg_size as usize {
            return Err(corrupt(format!(
                "invalid size {}, expected {}",
                data.len(),
                self.seg_size
            ))
            .into());
        }
        let header = WalPageHeader::parse(data)
            .ok_or_else(|| corrupt("cannot read page header".to_string()))?;
        if !header.has_known_magic() {
            return Err(corrupt(format!("invalid magic number {:04X}", header.magic)).into());
        }
        let long = header
            .long
            .ok_or_else(|| corrupt("first page lacks a long header".to_string()))?;
        if long.system_id != self.system_id {
            return Err(WalError::ForeignSystem {
                name: name.to_string(),
                expected: self.system_id,
                found: long.system_id,
            }
            .into());
        }
        Ok(())
    }

    /// Archive `src`, keeping its file name.
    pub fn push(&self, src: &Path, overwrite: bool) -> Result<PushOutcome> {
        let name = src
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| EngineError::Precondition(format!("Invalid WAL file path \"{}\"", src.display())))?
            .to_string();
        let kind = archive_file_kind(&name);
        if kind == ArchiveFileKind::Other {
            return Err(EngineError::Precondition(format!(
                "\"{}\" is not a WAL file name",
                name
            )));
        }

        let data = fs::read(src).map_err(|e| EngineError::file("read", src, e))?;
        match kind {
            ArchiveFileKind::Segment => self.check_header(&name, &data, true)?,
            ArchiveFileKind::Partial => self.check_header(&name, &data, false)?,
            _ => {}
        }

        fs::create_dir_all(&self.dir).map_err(|e| EngineError::file("create directory", &self.dir, e))?;

        if let Some(existing) = self.read_file(&name)? {
            if crc32fast::hash(&existing) == crc32fast::hash(&data) {
                info!("WAL file \"{}\" already exists in archive with the same checksum, skip", name);
                return Ok(PushOutcome::AlreadyArchived);
            }
            if !overwrite {
                return Err(EngineError::Precondition(format!(
                    "WAL file \"{}\" already exists in the archive with different checksum",
                    name
                )));
            }
            warn!("Overwriting WAL file \"{}\" in archive", name);
            for candidate in [self.dir.join(&name), self.dir.join(format!("{}{}", name, COMPRESSED_SUFFIX))] {
                if candidate.exists() {
                    fs::remove_file(&candidate).map_err(|e| EngineError::file("remove", &candidate, e))?;
                }
            }
        }

        let packable = matches!(kind, ArchiveFileKind::Segment | ArchiveFileKind::Partial);
        let (stored_name, payload) = if self.compress && packable {
            let packed = zstd::encode_all(data.as_slice(), self.level)
                .map_err(|e| EngineError::Compression(e.to_string()))?;
            (format!("{}{}", name, COMPRESSED_SUFFIX), packed)
        } else {
            (name.clone(), data)
        };

        let target = self.dir.join(&stored_name);
        let tmp = self.dir.join(format!(".{}.tmp.{}", stored_name, std::process::id()));
        {
            let mut file = fs::File::create(&tmp).map_err(|e| EngineError::file("create", &tmp, e))?;
            file.write_all(&payload).map_err(|e| EngineError::file("write", &tmp, e))?;
            file.sync_all().map_err(|e| EngineError::file("sync", &tmp, e))?;
        }
        fs::rename(&tmp, &target).map_err(|e| EngineError::file("rename", &tmp, e))?;
        debug!("Archived WAL file \"{}\"", stored_name);
        Ok(PushOutcome::Stored)
    }

    /// Restore an archived file to `dest`.
    pub fn get(&self, name: &str, dest: &Path) -> Result<()> {
        let data = self.read_file(name)?.ok_or_else(|| WalError::SegmentMissing {
            name: name.to_string(),
        })?;
        let tmp = dest.with_extension("pgbackup-tmp");
        fs::write(&tmp, &data).map_err(|e| EngineError::file("write", &tmp, e))?;
        fs::rename(&tmp, dest).map_err(|e| EngineError::file("rename", &tmp, e))?;
        Ok(())
    }

    /// Inspect one segment without reading any record.
    pub fn segment_state(&self, name: &SegmentName) -> Result<SegmentState> {
        let file = name.to_string();
        let data = match self.read_file(&file) {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(SegmentState::Absent),
            Err(EngineError::Wal(WalError::SegmentCorrupt { reason, .. })) => {
                return Ok(SegmentState::Corrupt(reason))
            }
            Err(e) => return Err(e),
        };
        match self.check_header(&file, &data, true) {
            Ok(()) => Ok(SegmentState::Valid),
            Err(EngineError::Wal(WalError::SegmentCorrupt { reason, .. })) => {
                Ok(SegmentState::Corrupt(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Full segments present in the archive, sorted by position then timeline.
    pub fn list_segments(&self) -> Result<Vec<SegmentName>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::file("read directory", &self.dir, e)),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            if archive_file_kind(name) == ArchiveFileKind::Segment {
                if let Some(seg) = SegmentName::parse(name, self.seg_size) {
                    out.push(seg);
                }
            }
        }
        out.sort_by_key(|s| (s.segno, s.tli));
        out.dedup();
        Ok(out)
    }

    /// History of `tli`; timeline 1 and timelines without a history file
    /// have no ancestors.
    pub fn read_history(&self, tli: TimeLineId) -> Result<TimelineHistory> {
        if tli <= 1 {
            return Ok(TimelineHistory::single(tli.max(1)));
        }
        let name = history_file_name(tli);
        match self.read_file(&name)? {
            Some(raw) => {
                let content = String::from_utf8_lossy(&raw);
                TimelineHistory::parse(tli, &content).map_err(|reason| {
                    WalError::SegmentCorrupt {
                        name: name.clone(),
                        reason,
                    }
                    .into()
                })
            }
            None => {
                warn!("Timeline history file \"{}\" is absent, assuming no ancestors", name);
                Ok(TimelineHistory::single(tli))
            }
        }
    }

    /// Poll until `name` shows up in the archive.
    pub async fn wait_for_segment(
        &self,
        name: &SegmentName,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let file = name.to_string();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.locate(&file).is_some() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Timeout(format!(
                    "WAL segment {} could not be archived in {} seconds",
                    file,
                    timeout.as_secs()
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(EngineError::interrupted()),
            }
        }
    }

    /// Remove segments (any timeline) older than `keep_from`. History files
    /// are always kept. Returns the removed file names.
    pub fn purge_before(&self, keep_from: u64, dry_run: bool) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::file("read directory", &self.dir, e)),
        };
        let mut removed = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            let segno = match archive_file_kind(name) {
                ArchiveFileKind::Segment | ArchiveFileKind::Partial => {
                    SegmentName::parse(name, self.seg_size).map(|s| s.segno)
                }
                ArchiveFileKind::BackupHistory => {
                    SegmentName::parse(&name[..24], self.seg_size).map(|s| s.segno)
                }
                _ => None,
            };
            if let Some(segno) = segno {
                if segno < keep_from {
                    if !dry_run {
                        let path = entry.path();
                        fs::remove_file(&path).map_err(|e| EngineError::file("remove", &path, e))?;
                    }
                    removed.push(name.to_string());
                }
            }
        }
        removed.sort();
        if !removed.is_empty() {
            info!(
                "{} {} WAL files before segment number {}",
                if dry_run { "Would remove" } else { "Removed" },
                removed.len(),
                keep_from
            );
        }
        Ok(removed)
    }
}

impl SegmentSource for WalArchive {
    fn load_segment(&self, name: &SegmentName) -> Result<Option<Vec<u8>>> {
        self.read_file(&name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::{Lsn, RelFileNode};
    use crate::testutil::WalBuilder;
    use tempfile::TempDir;

    const SEG: u32 = 1024 * 1024;
    const SYSID: u64 = 42;

    fn segment_file(dir: &Path, sysid: u64) -> PathBuf {
        let mut wal = WalBuilder::new(sysid, 1, SEG, Lsn(SEG as u64));
        wal.insert(&[(RelFileNode { spc: 1663, db: 1, rel: 2 }, 0, 0)], &[]);
        wal.write_segments(dir).unwrap();
        dir.join(SegmentName::new(1, 1, SEG).to_string())
    }

    #[test]
    fn test_push_and_get() {
        let src = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let path = segment_file(src.path(), SYSID);
        let archive = WalArchive::new(root.path().join("wal"), SEG, SYSID).with_compression(true, 1);

        assert_eq!(archive.push(&path, false).unwrap(), PushOutcome::Stored);
        assert!(root.path().join("wal/000000010000000000000001.zst").exists());
        assert_eq!(archive.push(&path, false).unwrap(), PushOutcome::AlreadyArchived);

        let restored = src.path().join("restored");
        archive.get("000000010000000000000001", &restored).unwrap();
        assert_eq!(fs::read(&restored).unwrap(), fs::read(&path).unwrap());
        assert_eq!(archive.list_segments().unwrap(), vec![SegmentName::new(1, 1, SEG)]);
        assert_eq!(
            archive.segment_state(&SegmentName::new(1, 1, SEG)).unwrap(),
            SegmentState::Valid
        );
        assert_eq!(
            archive.segment_state(&SegmentName::new(1, 2, SEG)).unwrap(),
            SegmentState::Absent
        );
    }

    #[test]
    fn test_duplicate_with_different_content() {
        let src = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let path = segment_file(src.path(), SYSID);
        let archive = WalArchive::new(root.path(), SEG, SYSID);
        archive.push(&path, false).unwrap();

        let mut data = fs::read(&path).unwrap();
        data[100] ^= 0x01;
        fs::write(&path, &data).unwrap();
        let err = archive.push(&path, false).unwrap_err();
        assert!(err.to_string().contains("different checksum"));
        assert_eq!(archive.push(&path, true).unwrap(), PushOutcome::Stored);
        assert_eq!(archive.read_file("000000010000000000000001").unwrap().unwrap(), data);
    }

    #[test]
    fn test_push_rejects_foreign_segment() {
        let src = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let path = segment_file(src.path(), SYSID + 1);
        let archive = WalArchive::new(root.path(), SEG, SYSID);
        let err = archive.push(&path, false).unwrap_err();
        assert!(matches!(err, EngineError::Wal(WalError::ForeignSystem { .. })));
    }

    #[test]
    fn test_history_and_purge() {
        let root = TempDir::new().unwrap();
        let archive = WalArchive::new(root.path(), SEG, SYSID);
        fs::write(root.path().join("00000002.history"), "1\t0/3000158\tpromoted\n").unwrap();
        for name in [
            "000000010000000000000001",
            "000000010000000000000002",
            "000000020000000000000003",
            "000000010000000000000001.00000028.backup",
        ] {
            fs::write(root.path().join(name), b"x").unwrap();
        }

        let history = archive.read_history(2).unwrap();
        assert_eq!(history.tli_for_lsn(Lsn(0x100)), 1);

        let would = archive.purge_before(3, true).unwrap();
        assert_eq!(would.len(), 3);
        assert!(root.path().join("000000010000000000000001").exists());

        archive.purge_before(3, false).unwrap();
        assert!(!root.path().join("000000010000000000000002").exists());
        assert!(root.path().join("000000020000000000000003").exists());
        assert!(root.path().join("00000002.history").exists());
    }

    #[tokio::test]
    async fn test_wait_for_segment_times_out() {
        let root = TempDir::new().unwrap();
        let archive = WalArchive::new(root.path(), SEG, SYSID);
        let cancel = CancellationToken::new();
        let err = archive
            .wait_for_segment(&SegmentName::new(1, 5, SEG), Duration::from_millis(300), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));

        fs::write(root.path().join("000000010000000000000005"), b"x").unwrap();
        archive
            .wait_for_segment(&SegmentName::new(1, 5, SEG), Duration::from_secs(1), &cancel)
            .await
            .unwrap();
    }
}

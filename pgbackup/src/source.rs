//! The cluster being backed up or copied from.
//!
//! Everything the engine needs from a source goes through [`SourceNode`].
//! [`LocalSource`] serves a data directory on the local file system: it
//! reads `pg_control`, `pg_wal` and the PTRACK map directly.

use crate::pg::{ControlFileData, Lsn, TimeLineId};
use crate::tracking::PtrackMap;
use crate::utils::errors::{EngineError, Result};
use crate::wal::record::DecodedRecord;
use crate::wal::segment::history_file_name;
use crate::wal::{SegmentName, TimelineHistory, WalArchive, WalReader, DEFAULT_WAL_SEGMENT_SIZE};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupStartInfo {
    pub start_lsn: Lsn,
    pub tli: TimeLineId,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupStopInfo {
    pub stop_lsn: Lsn,
    pub recovery_time: Option<DateTime<Utc>>,
    pub recovery_xid: Option<u64>,
    pub backup_label: String,
    pub tablespace_map: Option<String>,
}

pub trait SourceNode: Send + Sync {
    fn pgdata(&self) -> &Path;

    fn system_identifier(&self) -> Result<u64>;

    fn server_version(&self) -> Option<String>;

    fn wal_segment_size(&self) -> u32;

    /// Begin a backup: the returned LSN is the replay start point.
    fn start_backup(&self, label: &str) -> Result<BackupStartInfo>;

    /// End a backup: everything up to the returned LSN must be replayed.
    fn stop_backup(&self, label: &str, start: &BackupStartInfo) -> Result<BackupStopInfo>;

    fn timeline_history(&self) -> Result<TimelineHistory>;

    /// Directory the cluster writes WAL into.
    fn wal_dir(&self) -> PathBuf {
        self.pgdata().join("pg_wal")
    }

    fn read_ptrack_map(&self) -> Result<Option<PtrackMap>>;

    /// Clear the PTRACK bitmap. The new watermark is the WAL insert
    /// position at the moment of clearing and is returned.
    fn ptrack_reset(&self) -> Result<Lsn>;

    fn slot_exists(&self, name: &str) -> Result<bool>;

    fn create_slot(&self, name: &str, temporary: bool) -> Result<()>;
}

/// Contents of `backup_label` for a backup starting at `start`.
pub fn backup_label(start: &BackupStartInfo, label: &str, seg_size: u32) -> String {
    format!(
        "START WAL LOCATION: {} (file {})\n\
         CHECKPOINT LOCATION: {}\n\
         BACKUP METHOD: streamed\n\
         BACKUP FROM: primary\n\
         START TIME: {}\n\
         LABEL: {}\n\
         START TIMELINE: {}\n",
        start.start_lsn,
        SegmentName::for_lsn(start.tli, start.start_lsn, seg_size),
        start.start_lsn,
        start.start_time.format("%Y-%m-%d %H:%M:%S UTC"),
        label,
        start.tli
    )
}

/// A data directory read straight from disk.
#[derive(Debug, Clone)]
pub struct LocalSource {
    pgdata: PathBuf,
    seg_size: u32,
}

impl LocalSource {
    pub fn new(pgdata: impl Into<PathBuf>) -> Self {
        Self {
            pgdata: pgdata.into(),
            seg_size: DEFAULT_WAL_SEGMENT_SIZE,
        }
    }

    pub fn with_segment_size(mut self, seg_size: u32) -> Self {
        self.seg_size = seg_size;
        self
    }

    fn control(&self) -> Result<ControlFileData> {
        ControlFileData::read_from_pgdata(&self.pgdata)
    }

    /// End of the valid WAL in `pg_wal` following `from`.
    fn scan_wal<F>(&self, from: Lsn, visit: F) -> Result<Lsn>
    where
        F: FnMut(&DecodedRecord),
    {
        let system_id = self.system_identifier()?;
        let history = self.timeline_history()?;
        let wal = WalArchive::new(self.wal_dir(), self.seg_size, system_id);
        WalReader::new(&wal, &history, self.seg_size, system_id).scan_to_end(from, visit)
    }
}

impl SourceNode for LocalSource {
    fn pgdata(&self) -> &Path {
        &self.pgdata
    }

    fn system_identifier(&self) -> Result<u64> {
        Ok(self.control()?.system_identifier)
    }

    fn server_version(&self) -> Option<String> {
        std::fs::read_to_string(self.pgdata.join("PG_VERSION"))
            .ok()
            .map(|v| v.trim().to_string())
    }

    fn wal_segment_size(&self) -> u32 {
        self.seg_size
    }

    fn start_backup(&self, label: &str) -> Result<BackupStartInfo> {
        let control = self.control()?;
        debug!("Backup '{}' starts at redo point {}", label, control.redo);
        Ok(BackupStartInfo {
            start_lsn: control.redo,
            tli: control.timeline,
            start_time: Utc::now(),
        })
    }

    fn stop_backup(&self, label: &str, start: &BackupStartInfo) -> Result<BackupStopInfo> {
        let mut recovery_time = None;
        let mut recovery_xid = None;
        let stop_lsn = self.scan_wal(start.start_lsn, |record| {
            if let Some(time) = record.xact_time() {
                recovery_time = Some(time);
                recovery_xid = Some(record.header.xid as u64);
            }
        })?;

        Ok(BackupStopInfo {
            stop_lsn,
            recovery_time: recovery_time.or(Some(start.start_time)),
            recovery_xid,
            backup_label: backup_label(start, label, self.seg_size),
            tablespace_map: None,
        })
    }

    fn timeline_history(&self) -> Result<TimelineHistory> {
        let tli = self.control()?.timeline;
        if tli <= 1 {
            return Ok(TimelineHistory::single(tli.max(1)));
        }
        let path = self.wal_dir().join(history_file_name(tli));
        let content =
            std::fs::read_to_string(&path).map_err(|e| EngineError::file("read", &path, e))?;
        TimelineHistory::parse(tli, &content).map_err(|reason| {
            EngineError::Corruption(format!("Invalid history file \"{}\": {}", path.display(), reason))
        })
    }

    fn read_ptrack_map(&self) -> Result<Option<PtrackMap>> {
        PtrackMap::read_from_pgdata(&self.pgdata)
    }

    fn ptrack_reset(&self) -> Result<Lsn> {
        let watermark = self.scan_wal(self.control()?.redo, |_| {})?;
        let path = self.pgdata.join(crate::tracking::ptrack::PTRACK_MAP_PATH);
        crate::fs::write_atomic(&path, &PtrackMap::cleared(watermark).to_bytes())?;
        Ok(watermark)
    }

    fn slot_exists(&self, name: &str) -> Result<bool> {
        Ok(self.pgdata.join("pg_replslot").join(name).is_dir())
    }

    fn create_slot(&self, name: &str, _temporary: bool) -> Result<()> {
        Err(EngineError::Unsupported(format!(
            "Cannot create replication slot \"{}\": a direct data directory source has no server connection",
            name
        )))
    }
}

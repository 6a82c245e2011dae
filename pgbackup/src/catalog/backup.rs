//! Backup records.

use crate::config::CompressAlg;
use crate::pg::{Lsn, TimeLineId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Backup identifier: Unix time of the backup start in base 36.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupId(pub u64);

const BASE36: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

impl BackupId {
    pub fn from_time(time: DateTime<Utc>) -> Self {
        BackupId(time.timestamp().max(0) as u64)
    }

    /// Identifier for a backup started at `now` that sorts after `last`.
    pub fn next(now: DateTime<Utc>, last: Option<BackupId>) -> Self {
        let candidate = Self::from_time(now);
        match last {
            Some(last) if candidate <= last => BackupId(last.0 + 1),
            _ => candidate,
        }
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("0");
        }
        let mut n = self.0;
        let mut digits = Vec::new();
        while n > 0 {
            digits.push(BASE36[(n % 36) as usize]);
            n /= 36;
        }
        digits.reverse();
        f.write_str(&String::from_utf8_lossy(&digits))
    }
}

impl FromStr for BackupId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 12 {
            return Err(format!("invalid backup ID \"{}\"", s));
        }
        u64::from_str_radix(s, 36)
            .map(BackupId)
            .map_err(|_| format!("invalid backup ID \"{}\"", s))
    }
}

impl Serialize for BackupId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BackupId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupMode {
    Full,
    Page,
    Delta,
    Ptrack,
}

impl BackupMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupMode::Full => "FULL",
            BackupMode::Page => "PAGE",
            BackupMode::Delta => "DELTA",
            BackupMode::Ptrack => "PTRACK",
        }
    }

    pub fn is_incremental(self) -> bool {
        self != BackupMode::Full
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(BackupMode::Full),
            "PAGE" => Ok(BackupMode::Page),
            "DELTA" => Ok(BackupMode::Delta),
            "PTRACK" => Ok(BackupMode::Ptrack),
            _ => Err(format!("Invalid backup-mode \"{}\"", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupStatus {
    Ok,
    Error,
    Running,
    Merging,
    Deleting,
    Done,
    Orphan,
    Corrupt,
}

impl BackupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Ok => "OK",
            BackupStatus::Error => "ERROR",
            BackupStatus::Running => "RUNNING",
            BackupStatus::Merging => "MERGING",
            BackupStatus::Deleting => "DELETING",
            BackupStatus::Done => "DONE",
            BackupStatus::Orphan => "ORPHAN",
            BackupStatus::Corrupt => "CORRUPT",
        }
    }

    /// Finished and not known to be broken: usable as a parent and for
    /// restore.
    pub fn is_valid(self) -> bool {
        matches!(self, BackupStatus::Ok | BackupStatus::Done)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OK" => Ok(BackupStatus::Ok),
            "ERROR" => Ok(BackupStatus::Error),
            "RUNNING" => Ok(BackupStatus::Running),
            "MERGING" => Ok(BackupStatus::Merging),
            "DELETING" => Ok(BackupStatus::Deleting),
            "DONE" => Ok(BackupStatus::Done),
            "ORPHAN" => Ok(BackupStatus::Orphan),
            "CORRUPT" => Ok(BackupStatus::Corrupt),
            _ => Err(format!("Invalid status \"{}\"", s)),
        }
    }
}

/// One backup of an instance, as persisted in `backup.control`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Backup {
    pub id: BackupId,
    pub parent_id: Option<BackupId>,
    pub mode: BackupMode,
    pub status: BackupStatus,
    pub tli: TimeLineId,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub recovery_time: Option<DateTime<Utc>>,
    pub recovery_xid: Option<u64>,
    pub system_identifier: u64,
    /// Bytes stored in the backup directory.
    pub data_bytes: u64,
    /// Bytes the stored files expand to.
    pub uncompressed_bytes: u64,
    pub wal_segment_size: u32,
    pub block_size: u32,
    pub compress_alg: CompressAlg,
    pub compress_level: i32,
    pub program_version: String,
    pub server_version: Option<String>,
    /// CRC32 of the finalized `file-manifest`.
    pub content_crc: Option<u32>,
    pub note: Option<String>,
}

impl Backup {
    pub fn new(id: BackupId, mode: BackupMode, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            parent_id: None,
            mode,
            status: BackupStatus::Running,
            tli: 0,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            start_time,
            end_time: None,
            recovery_time: None,
            recovery_xid: None,
            system_identifier: 0,
            data_bytes: 0,
            uncompressed_bytes: 0,
            wal_segment_size: crate::wal::DEFAULT_WAL_SEGMENT_SIZE,
            block_size: crate::pg::BLCKSZ as u32,
            compress_alg: CompressAlg::None,
            compress_level: 0,
            program_version: env!("CARGO_PKG_VERSION").to_string(),
            server_version: None,
            content_crc: None,
            note: None,
        }
    }

    /// Point in time the backup can recover to; start time while running.
    pub fn recovery_point(&self) -> DateTime<Utc> {
        self.recovery_time.unwrap_or(self.start_time)
    }
}

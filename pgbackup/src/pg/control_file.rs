//! Reader for the version-stable prefix of `global/pg_control`.

use super::{Lsn, TimeLineId};
use crate::utils::errors::{EngineError, Result};
use std::fmt;
use std::path::Path;

/// Location of the control file inside a data directory.
pub const PG_CONTROL_PATH: &str = "global/pg_control";

/// Bytes written by PostgreSQL for the control file.
pub const PG_CONTROL_FILE_SIZE: usize = 8192;

const PREFIX_LEN: usize = 56;

/// `DBState` from pg_control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Startup,
    Shutdowned,
    ShutdownedInRecovery,
    Shutdowning,
    InCrashRecovery,
    InArchiveRecovery,
    InProduction,
    Unknown(u32),
}

impl ClusterState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => ClusterState::Startup,
            1 => ClusterState::Shutdowned,
            2 => ClusterState::ShutdownedInRecovery,
            3 => ClusterState::Shutdowning,
            4 => ClusterState::InCrashRecovery,
            5 => ClusterState::InArchiveRecovery,
            6 => ClusterState::InProduction,
            other => ClusterState::Unknown(other),
        }
    }

    fn to_raw(self) -> u32 {
        match self {
            ClusterState::Startup => 0,
            ClusterState::Shutdowned => 1,
            ClusterState::ShutdownedInRecovery => 2,
            ClusterState::Shutdowning => 3,
            ClusterState::InCrashRecovery => 4,
            ClusterState::InArchiveRecovery => 5,
            ClusterState::InProduction => 6,
            ClusterState::Unknown(raw) => raw,
        }
    }

    /// True when the cluster was stopped cleanly.
    pub fn is_shut_down(self) -> bool {
        matches!(
            self,
            ClusterState::Shutdowned | ClusterState::ShutdownedInRecovery
        )
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterState::Startup => "starting up",
            ClusterState::Shutdowned => "shut down",
            ClusterState::ShutdownedInRecovery => "shut down in recovery",
            ClusterState::Shutdowning => "shutting down",
            ClusterState::InCrashRecovery => "in crash recovery",
            ClusterState::InArchiveRecovery => "in archive recovery",
            ClusterState::InProduction => "in production",
            ClusterState::Unknown(_) => "unrecognized status code",
        };
        f.write_str(name)
    }
}

/// Fields shared by every supported control file version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFileData {
    pub system_identifier: u64,
    pub pg_control_version: u32,
    pub catalog_version: u32,
    pub state: ClusterState,
    pub time: i64,
    pub checkpoint: Lsn,
    pub redo: Lsn,
    pub timeline: TimeLineId,
    pub prev_timeline: TimeLineId,
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

impl ControlFileData {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < PREFIX_LEN {
            return None;
        }
        Some(Self {
            system_identifier: u64_at(buf, 0),
            pg_control_version: u32_at(buf, 8),
            catalog_version: u32_at(buf, 12),
            state: ClusterState::from_raw(u32_at(buf, 16)),
            time: u64_at(buf, 24) as i64,
            checkpoint: Lsn(u64_at(buf, 32)),
            redo: Lsn(u64_at(buf, 40)),
            timeline: u32_at(buf, 48),
            prev_timeline: u32_at(buf, 52),
        })
    }

    /// Read the control file of a data directory.
    pub fn read_from_pgdata(pgdata: &Path) -> Result<Self> {
        let path = pgdata.join(PG_CONTROL_PATH);
        let buf = std::fs::read(&path).map_err(|e| EngineError::file("read", &path, e))?;
        Self::parse(&buf).ok_or_else(|| {
            EngineError::Corruption(format!(
                "Control file \"{}\" is truncated ({} bytes)",
                path.display(),
                buf.len()
            ))
        })
    }

    /// Serialize into a full-size control file image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; PG_CONTROL_FILE_SIZE];
        buf[0..8].copy_from_slice(&self.system_identifier.to_le_bytes());
        buf[8..12].copy_from_slice(&self.pg_control_version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.catalog_version.to_le_bytes());
        buf[16..20].copy_from_slice(&self.state.to_raw().to_le_bytes());
        buf[24..32].copy_from_slice(&(self.time as u64).to_le_bytes());
        buf[32..40].copy_from_slice(&self.checkpoint.0.to_le_bytes());
        buf[40..48].copy_from_slice(&self.redo.0.to_le_bytes());
        buf[48..52].copy_from_slice(&self.timeline.to_le_bytes());
        buf[52..56].copy_from_slice(&self.prev_timeline.to_le_bytes());
        buf
    }
}

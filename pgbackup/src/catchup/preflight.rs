//! Checks run before catchup touches the destination.

use super::CatchupOptions;
use crate::catalog::lock::process_exists;
use crate::catalog::BackupMode;
use crate::fs::dir_is_empty;
use crate::fs::walker::{FileInfo, FileKind};
use crate::pg::{ControlFileData, Lsn, TimeLineId};
use crate::source::SourceNode;
use crate::utils::errors::{EngineError, Result};
use crate::wal::{check_catchup_timelines, TimelineHistory};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Slot name used by `--perm-slot` without `--slot`.
pub const DEFAULT_PERMANENT_SLOT: &str = "pgbackup_perm_slot";
/// Slot name used by `--temp-slot` without `--slot`.
pub const DEFAULT_TEMPORARY_SLOT: &str = "pgbackup_slot";

/// Replication slot the copy streams through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotPlan {
    None,
    Existing(String),
    Create { name: String, temporary: bool },
}

/// Resolve the slot flags against the slots the source already has.
pub fn plan_slot(source: &dyn SourceNode, options: &CatchupOptions) -> Result<SlotPlan> {
    if options.perm_slot && options.temp_slot {
        return Err(EngineError::Precondition(
            "You cannot specify \"--perm-slot\" option with the \"--temp-slot\" option".to_string(),
        ));
    }
    if options.perm_slot {
        let name = options
            .slot
            .clone()
            .unwrap_or_else(|| DEFAULT_PERMANENT_SLOT.to_string());
        if source.slot_exists(&name)? {
            return Err(EngineError::Precondition(format!(
                "replication slot \"{}\" already exists",
                name
            )));
        }
        return Ok(SlotPlan::Create { name, temporary: false });
    }
    if options.temp_slot {
        let name = options
            .slot
            .clone()
            .unwrap_or_else(|| DEFAULT_TEMPORARY_SLOT.to_string());
        return Ok(SlotPlan::Create { name, temporary: true });
    }
    match &options.slot {
        Some(name) if !source.slot_exists(name)? => Err(EngineError::Precondition(format!(
            "replication slot \"{}\" does not exist",
            name
        ))),
        Some(name) => Ok(SlotPlan::Existing(name.clone())),
        None => Ok(SlotPlan::None),
    }
}

/// Where an incremental catchup continues from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestinationState {
    pub redo: Lsn,
    pub tli: TimeLineId,
}

fn running_postmaster(dest: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(dest.join("postmaster.pid")).ok()?;
    let pid: u32 = content.lines().next()?.trim().parse().ok()?;
    process_exists(pid).then_some(pid)
}

/// Check the destination can take this catchup mode. Incremental modes
/// return the destination's position.
pub fn check_destination(
    mode: BackupMode,
    dest: &Path,
    system_id: u64,
    source_history: &TimelineHistory,
) -> Result<Option<DestinationState>> {
    if mode == BackupMode::Full {
        if !dir_is_empty(dest)? {
            return Err(EngineError::Precondition(format!(
                "Destination directory \"{}\" is not empty, FULL catchup needs an empty directory",
                dest.display()
            )));
        }
        return Ok(None);
    }

    if dir_is_empty(dest)? {
        return Err(EngineError::Precondition(format!(
            "Destination directory \"{}\" is empty, run a FULL catchup first",
            dest.display()
        )));
    }
    if let Some(pid) = running_postmaster(dest) {
        return Err(EngineError::Precondition(format!(
            "Postmaster with pid {} is running in destination directory \"{}\"",
            pid,
            dest.display()
        )));
    }
    if dest.join("backup_label").exists() {
        return Err(EngineError::Precondition(format!(
            "Destination directory contains \"backup_label\" file: \"{}\" was never started after the previous catchup",
            dest.display()
        )));
    }
    let control = ControlFileData::read_from_pgdata(dest)?;
    if !control.state.is_shut_down() {
        return Err(EngineError::Precondition(format!(
            "Postmaster in destination directory \"{}\" must be stopped cleanly (state: {})",
            dest.display(),
            control.state
        )));
    }
    if control.system_identifier != system_id {
        return Err(EngineError::Chain(format!(
            "Database identifiers mismatch: source has system identifier {}, but destination \"{}\" has {}",
            system_id,
            dest.display(),
            control.system_identifier
        )));
    }
    check_catchup_timelines(source_history, control.timeline, control.redo)?;
    info!(
        "Destination redo point {} on timeline {}",
        control.redo, control.timeline
    );
    Ok(Some(DestinationState {
        redo: control.redo,
        tli: control.timeline,
    }))
}

/// Every tablespace of the source needs a mapping when both sides live on
/// one machine. Returns the mapped location of each link.
pub fn check_tablespaces(
    files: &[FileInfo],
    mapping: &[(PathBuf, PathBuf)],
) -> Result<Vec<(String, PathBuf)>> {
    let mut links = Vec::new();
    for file in files {
        let FileKind::Link(target) = &file.kind else {
            continue;
        };
        let Some((_, new)) = mapping.iter().find(|(old, _)| old == Path::new(target)) else {
            return Err(EngineError::Precondition(format!(
                "Local catchup executed, but source database contains tablespace (\"{}\"), that is not listed in the map",
                target
            )));
        };
        links.push((file.relative_path.clone(), new.clone()));
    }
    Ok(links)
}

/// Validate `--waldir` against the destination's `pg_wal`.
pub fn check_waldir(mode: BackupMode, dest: &Path, waldir: Option<&Path>) -> Result<()> {
    let pg_wal = dest.join("pg_wal");
    let Some(waldir) = waldir else {
        if pg_wal.is_symlink() {
            warn!(
                "Destination pg_wal is a symlink to \"{}\", keeping it",
                std::fs::read_link(&pg_wal)
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            );
        }
        return Ok(());
    };
    if !waldir.is_absolute() {
        return Err(EngineError::Config(format!(
            "WAL directory location must be an absolute path: \"{}\"",
            waldir.display()
        )));
    }
    if mode == BackupMode::Full {
        if !dir_is_empty(waldir)? {
            return Err(EngineError::Precondition(format!(
                "WAL directory \"{}\" is not empty",
                waldir.display()
            )));
        }
        return Ok(());
    }
    match std::fs::read_link(&pg_wal) {
        Ok(current) if current == waldir => Ok(()),
        Ok(current) => Err(EngineError::Precondition(format!(
            "WAL directory does not equal to symlinked pg_wal path {} (requested \"{}\")",
            current.display(),
            waldir.display()
        ))),
        Err(_) => Err(EngineError::Precondition(format!(
            "WAL directory does not equal to symlinked pg_wal path {}: \"{}\" is not a symlink",
            waldir.display(),
            pg_wal.display()
        ))),
    }
}

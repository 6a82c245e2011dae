//! Walking parent links.

use crate::catalog::{Backup, BackupId, BackupStatus, InstanceCatalog};
use crate::pg::Lsn;
use crate::utils::errors::{EngineError, Result};
use crate::wal::TimelineHistory;
use std::collections::HashSet;

/// Health of the ancestors of a backup (the backup itself excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainState {
    Intact,
    /// `child` names a parent that is not in the catalog.
    MissingParent { child: BackupId, parent: BackupId },
    /// Nearest ancestor that is not usable.
    BrokenAncestor { ancestor: BackupId, status: BackupStatus },
}

/// The backup and its ancestors, newest first, ending at the FULL base.
pub fn ancestry(catalog: &InstanceCatalog, id: BackupId) -> Result<Vec<&Backup>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = catalog.get(id)?;
    loop {
        if !seen.insert(current.id) {
            return Err(EngineError::Corruption(format!(
                "Backup {} has a cyclic parent chain through backup {}",
                id, current.id
            )));
        }
        chain.push(current);
        let Some(parent_id) = current.parent_id else {
            if current.mode.is_incremental() {
                return Err(EngineError::Corruption(format!(
                    "Incremental backup {} has no parent",
                    current.id
                )));
            }
            return Ok(chain);
        };
        current = catalog.find(parent_id).ok_or_else(|| {
            EngineError::Chain(format!(
                "Backup {} has missing parent {}",
                current.id, parent_id
            ))
        })?;
    }
}

/// Classify the ancestors of `id`.
pub fn chain_state(catalog: &InstanceCatalog, id: BackupId) -> Result<ChainState> {
    let mut seen = HashSet::new();
    let mut current = catalog.get(id)?;
    while let Some(parent_id) = current.parent_id {
        if !seen.insert(current.id) {
            return Err(EngineError::Corruption(format!(
                "Backup {} has a cyclic parent chain through backup {}",
                id, current.id
            )));
        }
        let Some(parent) = catalog.find(parent_id) else {
            return Ok(ChainState::MissingParent {
                child: current.id,
                parent: parent_id,
            });
        };
        if !parent.status.is_valid() {
            return Ok(ChainState::BrokenAncestor {
                ancestor: parent.id,
                status: parent.status,
            });
        }
        current = parent;
    }
    Ok(ChainState::Intact)
}

/// FULL base first, `id` last; every member must be usable.
pub fn restore_chain(catalog: &InstanceCatalog, id: BackupId) -> Result<Vec<&Backup>> {
    let mut chain = ancestry(catalog, id)?;
    chain.reverse();
    for backup in &chain {
        if !backup.status.is_valid() {
            return Err(EngineError::Chain(format!(
                "Backup {} has status {}, backup {} cannot be restored",
                backup.id, backup.status, id
            )));
        }
    }
    Ok(chain)
}

/// True when the backup lies on the given timeline history.
pub fn on_history(backup: &Backup, history: &TimelineHistory) -> bool {
    backup.tli == history.current() || history.contains_point(backup.tli, backup.stop_lsn)
}

/// Newest usable backup to build an incremental on.
pub fn select_parent<'a>(
    catalog: &'a InstanceCatalog,
    history: &TimelineHistory,
) -> Result<&'a Backup> {
    for backup in catalog.list() {
        if !backup.status.is_valid() || !on_history(backup, history) {
            continue;
        }
        if matches!(chain_state(catalog, backup.id), Ok(ChainState::Intact)) {
            return Ok(backup);
        }
    }
    Err(EngineError::Chain(
        "Valid full backup on current timeline is not found. Create new FULL backup before an incremental one."
            .to_string(),
    ))
}

/// An incremental must start where its parent stopped or later.
pub fn check_start_after_parent(parent: &Backup, start_lsn: Lsn) -> Result<()> {
    if start_lsn < parent.stop_lsn {
        return Err(EngineError::Chain(format!(
            "Current START LSN {} is lower than STOP LSN {} of parent backup {}",
            start_lsn, parent.stop_lsn, parent.id
        )));
    }
    Ok(())
}

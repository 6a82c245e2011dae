//! Backup validation.
//!
//! A backup is checked against itself (manifest checksum, every stored
//! file, WAL between its start and stop) and against its ancestry. Chains
//! are processed root first, so a failed ancestor turns every live
//! descendant ORPHAN without re-reading the descendant's files. Passing the
//! self-check sets OK, which also clears an earlier CORRUPT or ORPHAN once
//! the underlying problem is repaired.

use crate::catalog::manifest::{manifest_crc, read_headers, read_manifest, FileEntry};
use crate::catalog::{Backup, BackupId, BackupStatus, CatalogContext, InstanceCatalog};
use crate::chain::{self, ChainState};
use crate::fs::copy::read_stored;
use crate::fs::pagefile::read_page;
use crate::pg::Lsn;
use crate::utils::errors::{EngineError, Result, WalError};
use crate::utils::pool::run_bounded;
use crate::wal::{WalArchive, WalReader};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::path::Path;
use tracing::{info, warn};

/// Point a restore should recover to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTarget {
    Time(DateTime<Utc>),
    Lsn(Lsn),
    Xid(u64),
}

impl RecoveryTarget {
    /// Whether a backup ending at this point can serve the target.
    fn admits(&self, backup: &Backup) -> bool {
        match self {
            RecoveryTarget::Time(t) => backup.recovery_point() <= *t,
            RecoveryTarget::Lsn(lsn) => backup.stop_lsn <= *lsn,
            RecoveryTarget::Xid(xid) => backup.recovery_xid.map_or(true, |x| x <= *xid),
        }
    }

    /// The backup already ends exactly at the target.
    fn reached_by(&self, backup: &Backup) -> bool {
        match self {
            RecoveryTarget::Time(t) => backup.recovery_time == Some(*t),
            RecoveryTarget::Lsn(lsn) => backup.stop_lsn == *lsn,
            RecoveryTarget::Xid(xid) => backup.recovery_xid == Some(*xid),
        }
    }

    /// Setting lines for `postgresql.auto.conf`.
    pub fn recovery_setting(&self) -> String {
        match self {
            RecoveryTarget::Time(t) => format!(
                "recovery_target_time = '{}'",
                t.format("%Y-%m-%d %H:%M:%S+00")
            ),
            RecoveryTarget::Lsn(lsn) => format!("recovery_target_lsn = '{}'", lsn),
            RecoveryTarget::Xid(xid) => format!("recovery_target_xid = '{}'", xid),
        }
    }
}

impl fmt::Display for RecoveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryTarget::Time(t) => write!(f, "time {}", t.format("%Y-%m-%d %H:%M:%S+00")),
            RecoveryTarget::Lsn(lsn) => write!(f, "lsn {}", lsn),
            RecoveryTarget::Xid(xid) => write!(f, "xid {}", xid),
        }
    }
}

/// Parse a recovery target time. Accepts RFC 3339 and
/// `YYYY-MM-DD HH:MM:SS[+TZ]`; a missing zone means UTC.
pub fn parse_target_time(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%#z", "%Y-%m-%d %H:%M:%S%:z"] {
        if let Ok(t) = DateTime::parse_from_str(raw, format) {
            return Ok(t.with_timezone(&Utc));
        }
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|t| t.and_utc())
        .map_err(|_| EngineError::Config(format!("Invalid recovery target time \"{}\"", raw)))
}

fn check_file(backup_dir: &Path, entry: &FileEntry) -> Result<()> {
    if !entry.has_stored_copy() {
        return Ok(());
    }
    let stored = entry.stored_path(backup_dir);
    if !stored.is_file() {
        return Err(EngineError::Corruption(format!(
            "Backup file \"{}\" is not found",
            stored.display()
        )));
    }
    let crc = if entry.is_datafile {
        let headers = read_headers(backup_dir, entry)?;
        let mut file = File::open(&stored).map_err(|e| EngineError::file("open", &stored, e))?;
        let mut hasher = crc32fast::Hasher::new();
        for header in &headers {
            let page = read_page(&mut file, header).map_err(|e| {
                EngineError::Corruption(format!(
                    "Invalid CRC of backup file \"{}\": {}",
                    stored.display(),
                    e
                ))
            })?;
            hasher.update(&page);
        }
        hasher.finalize()
    } else {
        read_stored(&stored, entry.compressed, std::io::sink())?.crc
    };
    if crc != entry.crc {
        return Err(EngineError::Corruption(format!(
            "Invalid CRC of backup file \"{}\": {:08X} vs {:08X}",
            stored.display(),
            crc,
            entry.crc
        )));
    }
    Ok(())
}

fn check_wal(archive: &WalArchive, backup: &Backup) -> Result<()> {
    let history = archive.read_history(backup.tli)?;
    let mut reader = WalReader::new(archive, &history, archive.seg_size(), backup.system_identifier);
    reader.for_each_record(backup.start_lsn, backup.stop_lsn, |_| Ok(true))?;
    Ok(())
}

/// Verify one backup on its own.
async fn check_backup(
    ctx: &CatalogContext,
    catalog: &InstanceCatalog,
    backup: &Backup,
) -> Result<()> {
    if backup.mode.is_incremental() && backup.parent_id.is_none() {
        return Err(EngineError::Corruption(format!(
            "Incremental backup {} has no parent",
            backup.id
        )));
    }
    if backup.system_identifier != catalog.config.system_identifier {
        return Err(EngineError::Chain(format!(
            "Database identifiers mismatch: backup {} has system identifier {}, instance '{}' has {}",
            backup.id, backup.system_identifier, catalog.name, catalog.config.system_identifier
        )));
    }

    let archive = catalog.archive(ctx);
    if let Some(parent) = backup.parent_id.and_then(|id| catalog.find(id)) {
        chain::check_start_after_parent(parent, backup.start_lsn)?;
        let history = archive.read_history(backup.tli)?;
        if !chain::on_history(parent, &history) {
            return Err(EngineError::Chain(format!(
                "Parent backup {} on timeline {} is not in the timeline history of backup {}",
                parent.id, parent.tli, backup.id
            )));
        }
    }

    let dir = catalog.backup_dir(backup.id);
    let crc = manifest_crc(&dir)?;
    if backup.content_crc != Some(crc) {
        return Err(EngineError::Corruption(format!(
            "Manifest of backup {} has invalid checksum",
            backup.id
        )));
    }

    let entries = read_manifest(&dir)?;
    let worker_dir = dir.clone();
    run_bounded(
        entries,
        ctx.config.performance.threads,
        &ctx.cancel,
        move |entry| check_file(&worker_dir, &entry),
    )
    .await?;

    if let Err(e) = check_wal(&archive, backup) {
        warn!(
            "There are not enough WAL records to consistently restore backup {} from START LSN: {} to STOP LSN: {}",
            backup.id, backup.start_lsn, backup.stop_lsn
        );
        return Err(e);
    }
    Ok(())
}

fn skipped(status: BackupStatus) -> bool {
    matches!(
        status,
        BackupStatus::Running | BackupStatus::Merging | BackupStatus::Deleting | BackupStatus::Error
    )
}

/// Nearest problem above the backup being processed.
enum Upstream {
    Sound,
    Missing(BackupId),
    Broken(BackupId, BackupStatus),
}

/// Validate `id` and its ancestors; results land in `memo`.
async fn validate_chain(
    ctx: &CatalogContext,
    catalog: &mut InstanceCatalog,
    id: BackupId,
    memo: &mut HashMap<BackupId, BackupStatus>,
) -> Result<BackupStatus> {
    let mut lineage = Vec::new();
    let mut seen = HashSet::new();
    let mut upstream = Upstream::Sound;
    let mut current = Some(id);
    while let Some(cur) = current {
        if !seen.insert(cur) {
            warn!("Backup {} has a cyclic parent chain through backup {}", id, cur);
            let start = lineage.iter().position(|b| *b == cur).unwrap_or(0);
            for member in lineage.split_off(start) {
                if !memo.contains_key(&member) {
                    catalog.set_status(member, BackupStatus::Corrupt)?;
                    memo.insert(member, BackupStatus::Corrupt);
                }
            }
            upstream = Upstream::Broken(cur, BackupStatus::Corrupt);
            break;
        }
        let Some(backup) = catalog.find(cur) else {
            upstream = Upstream::Missing(cur);
            break;
        };
        lineage.push(cur);
        if memo.contains_key(&cur) {
            break;
        }
        current = backup.parent_id;
    }

    let mut status = memo.get(&id).copied().unwrap_or(BackupStatus::Ok);
    for backup_id in lineage.into_iter().rev() {
        status = match memo.get(&backup_id) {
            Some(known) => *known,
            None => {
                let backup = catalog.get(backup_id)?.clone();
                let status = match &upstream {
                    _ if skipped(backup.status) => {
                        info!("Skipping backup {}, it has status: {}", backup.id, backup.status);
                        backup.status
                    }
                    Upstream::Missing(parent) => {
                        warn!("Backup {} has missing parent {}", backup.id, parent);
                        BackupStatus::Orphan
                    }
                    Upstream::Broken(ancestor, ancestor_status) => {
                        warn!(
                            "Backup {} is orphan because its parent {} has status: {}",
                            backup.id, ancestor, ancestor_status
                        );
                        BackupStatus::Orphan
                    }
                    Upstream::Sound => {
                        info!("Validating backup {}", backup.id);
                        match check_backup(ctx, catalog, &backup).await {
                            Ok(()) => {
                                info!("Backup {} data files are valid", backup.id);
                                BackupStatus::Ok
                            }
                            Err(e @ EngineError::Interrupted(_)) => return Err(e),
                            Err(e) => {
                                warn!("{}", e);
                                warn!("Backup {} data files are corrupted", backup.id);
                                BackupStatus::Corrupt
                            }
                        }
                    }
                };
                catalog.set_status(backup.id, status)?;
                memo.insert(backup.id, status);
                status
            }
        };
        if !status.is_valid() && matches!(upstream, Upstream::Sound) {
            upstream = Upstream::Broken(backup_id, status);
        }
    }
    Ok(status)
}

/// Error describing why `id` ended up with `status`.
fn invalid_backup(catalog: &InstanceCatalog, id: BackupId, status: BackupStatus) -> EngineError {
    match status {
        BackupStatus::Corrupt => EngineError::Corruption(format!("Backup {} is corrupt", id)),
        BackupStatus::Orphan => match chain::chain_state(catalog, id) {
            Ok(ChainState::MissingParent { child, parent }) if child == id => {
                EngineError::Chain(format!("Backup {} is orphan: it has missing parent {}", id, parent))
            }
            Ok(ChainState::BrokenAncestor { ancestor, status }) => EngineError::Chain(format!(
                "Backup {} is orphan because its parent {} has status: {}",
                id, ancestor, status
            )),
            _ => EngineError::Chain(format!("Backup {} is orphan", id)),
        },
        other => EngineError::Chain(format!("Backup {} has status {}", id, other)),
    }
}

/// Validate one backup together with its ancestors.
pub async fn validate_backup(
    ctx: &CatalogContext,
    catalog: &mut InstanceCatalog,
    id: BackupId,
) -> Result<BackupStatus> {
    catalog.get(id)?;
    let mut memo = HashMap::new();
    let status = validate_chain(ctx, catalog, id, &mut memo).await?;
    if status == BackupStatus::Ok {
        info!("Backup {} is valid", id);
        Ok(status)
    } else {
        Err(invalid_backup(catalog, id, status))
    }
}

/// Validate every backup of an instance, each chain once.
pub async fn validate_instance(ctx: &CatalogContext, catalog: &mut InstanceCatalog) -> Result<()> {
    let ids: Vec<BackupId> = catalog.iter().map(|b| b.id).collect();
    let mut memo = HashMap::new();
    let mut invalid = 0;
    for id in ids {
        let status = validate_chain(ctx, catalog, id, &mut memo).await?;
        if status != BackupStatus::Ok {
            invalid += 1;
        }
    }
    if invalid > 0 {
        return Err(EngineError::Chain(format!(
            "Some backups are not valid ({} of {})",
            invalid,
            memo.len()
        )));
    }
    info!("All backups of instance '{}' are valid", catalog.name);
    Ok(())
}

/// Backup a restore to `target` would start from.
pub fn select_for_target(
    catalog: &InstanceCatalog,
    target: Option<&RecoveryTarget>,
    backup_id: Option<BackupId>,
) -> Result<BackupId> {
    if let Some(id) = backup_id {
        let backup = catalog.get(id)?;
        if let Some(target) = target {
            if !target.admits(backup) {
                return Err(EngineError::Precondition(format!(
                    "Backup {} ends after recovery target {}",
                    id, target
                )));
            }
        }
        return Ok(id);
    }
    catalog
        .list()
        .into_iter()
        .find(|b| b.status.is_valid() && target.map_or(true, |t| t.admits(b)))
        .map(|b| b.id)
        .ok_or_else(|| match target {
            Some(_) => EngineError::NotFound("Backup satisfying target options is not found.".to_string()),
            None => EngineError::NotFound(format!(
                "There are no valid backups in instance '{}'",
                catalog.name
            )),
        })
}

/// Check the archive holds WAL from `backup` up to `target`.
pub fn check_target_reachable(
    ctx: &CatalogContext,
    catalog: &InstanceCatalog,
    backup: &Backup,
    target: &RecoveryTarget,
) -> Result<()> {
    let archive = catalog.archive(ctx);
    let latest_tli = archive
        .list_segments()?
        .iter()
        .map(|s| s.tli)
        .max()
        .unwrap_or(backup.tli)
        .max(backup.tli);
    let mut history = archive.read_history(latest_tli)?;
    if !history.contains_point(backup.tli, backup.stop_lsn) {
        history = archive.read_history(backup.tli)?;
    }

    let mut reached = target.reached_by(backup);
    let mut reader = WalReader::new(&archive, &history, archive.seg_size(), backup.system_identifier);
    let end = reader.scan_to_end(backup.start_lsn, |record| {
        if reached {
            return;
        }
        reached = match target {
            RecoveryTarget::Time(t) => record.xact_time().is_some_and(|time| time >= *t),
            RecoveryTarget::Lsn(lsn) => record.end >= *lsn,
            RecoveryTarget::Xid(xid) => {
                record.xact_kind().is_some() && record.header.xid as u64 == *xid
            }
        };
    })?;
    if end < backup.stop_lsn {
        return Err(WalError::RecordInvalid {
            lsn: end,
            reason: format!(
                "There are not enough WAL records to consistently restore backup {}",
                backup.id
            ),
        }
        .into());
    }
    if !reached {
        return Err(WalError::RecordInvalid {
            lsn: end,
            reason: format!("Not enough WAL records to {}", target),
        }
        .into());
    }
    info!("WAL up to {} is available, last record ends at {}", target, end);
    Ok(())
}

/// Validate the backup serving `target` and the WAL leading to it.
pub async fn validate_target(
    ctx: &CatalogContext,
    catalog: &mut InstanceCatalog,
    target: &RecoveryTarget,
    backup_id: Option<BackupId>,
) -> Result<BackupId> {
    let id = select_for_target(catalog, Some(target), backup_id)?;
    validate_backup(ctx, catalog, id).await?;
    let backup = catalog.get(id)?.clone();
    check_target_reachable(ctx, catalog, &backup, target)?;
    info!("Backup {} is valid for recovery to {}", id, target);
    Ok(id)
}

/// Validate under the instance lock: one backup, a recovery target, or
/// the whole instance.
pub async fn validate(
    ctx: &CatalogContext,
    instance: &str,
    backup_id: Option<BackupId>,
    target: Option<RecoveryTarget>,
) -> Result<()> {
    let mut catalog = ctx.open_instance(instance)?;
    let lock = catalog.lock("validate")?;
    catalog.fail_abandoned(&lock)?;
    match (backup_id, target) {
        (_, Some(target)) => {
            validate_target(ctx, &mut catalog, &target, backup_id).await?;
        }
        (Some(id), None) => {
            validate_backup(ctx, &mut catalog, id).await?;
        }
        (None, None) => validate_instance(ctx, &mut catalog).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BackupMode;
    use crate::testutil::{Harness, TEST_SEG_SIZE};
    use crate::wal::SegmentName;
    use chrono::TimeZone;

    fn flip_byte(path: &Path, offset: u64) {
        use std::io::{Read, Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path).unwrap();
        let mut byte = [0u8; 1];
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&[byte[0] ^ 0xFF]).unwrap();
    }

    /// FULL -> PAGE -> PTRACK, all OK.
    async fn three_chain(h: &mut Harness) -> (Backup, Backup, Backup) {
        h.cluster.enable_ptrack();
        let full = h.backup(BackupMode::Full).await.unwrap();
        h.cluster.update_page("base/5/16384", 1);
        h.cluster.checkpoint();
        let page = h.backup(BackupMode::Page).await.unwrap();
        h.cluster.update_page("base/5/16390", 0);
        h.cluster.checkpoint();
        let ptrack = h.backup(BackupMode::Ptrack).await.unwrap();
        (full, page, ptrack)
    }

    #[tokio::test]
    async fn test_corrupt_middle_orphans_descendant() {
        let mut h = Harness::new();
        let (full, page, ptrack) = three_chain(&mut h).await;
        assert_eq!(ptrack.parent_id, Some(page.id));
        let stored = h.backup_dir(page.id).join("database/base/5/16384");
        flip_byte(&stored, 100);

        let mut catalog = h.catalog();
        let err = validate_backup(&h.ctx, &mut catalog, ptrack.id).await.unwrap_err();
        assert!(err.to_string().contains("is orphan"));
        assert!(err.to_string().contains(&page.id.to_string()));
        assert_eq!(catalog.get(full.id).unwrap().status, BackupStatus::Ok);
        assert_eq!(catalog.get(page.id).unwrap().status, BackupStatus::Corrupt);
        assert_eq!(catalog.get(ptrack.id).unwrap().status, BackupStatus::Orphan);

        let err = validate_backup(&h.ctx, &mut catalog, page.id).await.unwrap_err();
        assert!(err.to_string().contains("is corrupt"));

        // same verdict on a second pass
        let err = validate_instance(&h.ctx, &mut catalog).await.unwrap_err();
        assert!(err.to_string().contains("Some backups are not valid"));
        let reloaded = h.catalog();
        assert_eq!(reloaded.get(page.id).unwrap().status, BackupStatus::Corrupt);
        assert_eq!(reloaded.get(ptrack.id).unwrap().status, BackupStatus::Orphan);

        // repairing the file brings the chain back
        flip_byte(&stored, 100);
        validate_instance(&h.ctx, &mut catalog).await.unwrap();
        assert_eq!(catalog.get(ptrack.id).unwrap().status, BackupStatus::Ok);
    }

    #[tokio::test]
    async fn test_missing_parent() {
        let mut h = Harness::new();
        let full = h.backup(BackupMode::Full).await.unwrap();
        h.cluster.update_page("base/5/16384", 0);
        h.cluster.checkpoint();
        let delta = h.backup(BackupMode::Delta).await.unwrap();
        std::fs::remove_dir_all(h.backup_dir(full.id)).unwrap();

        let mut catalog = h.catalog();
        let err = validate_backup(&h.ctx, &mut catalog, delta.id).await.unwrap_err();
        assert!(err.to_string().contains("has missing parent"));
        assert_eq!(catalog.get(delta.id).unwrap().status, BackupStatus::Orphan);
    }

    #[tokio::test]
    async fn test_start_before_parent_stop_is_corruption() {
        let mut h = Harness::new();
        let full = h.backup(BackupMode::Full).await.unwrap();
        h.cluster.update_page("base/5/16384", 0);
        h.cluster.checkpoint();
        let mut delta = h.backup(BackupMode::Delta).await.unwrap();

        let mut catalog = h.catalog();
        delta.start_lsn = full.start_lsn;
        catalog.save(&delta).unwrap();
        let err = check_backup(&h.ctx, &catalog, &delta).await.unwrap_err();
        assert!(err.to_string().contains("is lower than STOP LSN"));

        let err = validate_backup(&h.ctx, &mut catalog, delta.id).await.unwrap_err();
        assert!(err.to_string().contains("is corrupt"));
        assert_eq!(catalog.get(full.id).unwrap().status, BackupStatus::Ok);
        assert_eq!(catalog.get(delta.id).unwrap().status, BackupStatus::Corrupt);
    }

    #[tokio::test]
    async fn test_parent_off_timeline_is_corruption() {
        let mut h = Harness::new();
        let full = h.backup(BackupMode::Full).await.unwrap();
        h.cluster.update_page("base/5/16384", 0);
        h.cluster.checkpoint();
        let mut delta = h.backup(BackupMode::Delta).await.unwrap();

        let mut catalog = h.catalog();
        delta.tli = 7;
        catalog.save(&delta).unwrap();
        let err = check_backup(&h.ctx, &catalog, &delta).await.unwrap_err();
        assert!(err.to_string().contains("is not in the timeline history"));

        assert!(validate_backup(&h.ctx, &mut catalog, delta.id).await.is_err());
        assert_eq!(catalog.get(full.id).unwrap().status, BackupStatus::Ok);
        assert_eq!(catalog.get(delta.id).unwrap().status, BackupStatus::Corrupt);
    }

    #[tokio::test]
    async fn test_parent_cycle_does_not_stop_instance_pass() {
        use crate::chain::tests::record;

        let h = Harness::new();
        let full = h.backup(BackupMode::Full).await.unwrap();
        let mut catalog = h.catalog();
        let a = record(10, BackupMode::Page, None, BackupStatus::Ok);
        let b = record(20, BackupMode::Page, Some(a.id), BackupStatus::Ok);
        let c = record(30, BackupMode::Page, Some(b.id), BackupStatus::Ok);
        let mut a = a;
        a.parent_id = Some(b.id);
        for backup in [a.clone(), b.clone(), c.clone()] {
            catalog.create(backup).unwrap();
        }

        let err = validate_instance(&h.ctx, &mut catalog).await.unwrap_err();
        assert!(err.to_string().contains("Some backups are not valid (3 of 4)"));
        assert_eq!(catalog.get(full.id).unwrap().status, BackupStatus::Ok);
        assert_eq!(catalog.get(a.id).unwrap().status, BackupStatus::Corrupt);
        assert_eq!(catalog.get(b.id).unwrap().status, BackupStatus::Corrupt);
        assert_eq!(catalog.get(c.id).unwrap().status, BackupStatus::Orphan);

        let reloaded = h.catalog();
        assert_eq!(reloaded.get(a.id).unwrap().status, BackupStatus::Corrupt);

        let err = validate_backup(&h.ctx, &mut catalog, c.id).await.unwrap_err();
        assert!(err.to_string().contains("is orphan"));
    }

    #[tokio::test]
    async fn test_wal_gap_is_corruption() {
        let h = Harness::new();
        let full = h.backup(BackupMode::Full).await.unwrap();
        let segment = SegmentName::for_lsn(full.tli, full.start_lsn, TEST_SEG_SIZE);
        std::fs::remove_file(h.ctx.wal_dir("node").join(segment.to_string())).unwrap();

        let mut catalog = h.catalog();
        let err = validate_backup(&h.ctx, &mut catalog, full.id).await.unwrap_err();
        assert!(err.to_string().contains("is corrupt"));
        assert_eq!(catalog.get(full.id).unwrap().status, BackupStatus::Corrupt);
    }

    #[tokio::test]
    async fn test_damaged_manifest_is_corruption() {
        let h = Harness::new();
        let full = h.backup(BackupMode::Full).await.unwrap();
        let manifest = h.backup_dir(full.id).join(crate::catalog::manifest::MANIFEST_FILE);
        let mut content = std::fs::read_to_string(&manifest).unwrap();
        content.push('\n');
        std::fs::write(&manifest, content).unwrap();

        let mut catalog = h.catalog();
        assert!(validate_backup(&h.ctx, &mut catalog, full.id).await.is_err());
        assert_eq!(catalog.get(full.id).unwrap().status, BackupStatus::Corrupt);
    }

    #[tokio::test]
    async fn test_recovery_targets() {
        let mut h = Harness::new();
        let full = h.backup(BackupMode::Full).await.unwrap();
        let when = Utc.timestamp_opt(Utc::now().timestamp() + 3600, 0).unwrap();
        h.cluster.update_page("base/5/16384", 3);
        h.cluster.commit(900, when);
        h.cluster.flush();

        let mut catalog = h.catalog();
        let id = validate_target(&h.ctx, &mut catalog, &RecoveryTarget::Time(when), None)
            .await
            .unwrap();
        assert_eq!(id, full.id);
        validate_target(&h.ctx, &mut catalog, &RecoveryTarget::Xid(900), None)
            .await
            .unwrap();

        let later = RecoveryTarget::Time(when + chrono::Duration::days(1));
        let err = validate_target(&h.ctx, &mut catalog, &later, None).await.unwrap_err();
        assert!(err.to_string().contains("Not enough WAL records to time"));

        let far = RecoveryTarget::Lsn(Lsn(h.cluster.wal_position().0 + 0x100_0000));
        let err = validate_target(&h.ctx, &mut catalog, &far, None).await.unwrap_err();
        assert!(err.to_string().contains("Not enough WAL records to lsn"));

        let early = RecoveryTarget::Time(Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap());
        let err = validate_target(&h.ctx, &mut catalog, &early, None).await.unwrap_err();
        assert!(err.to_string().contains("Backup satisfying target options is not found."));
    }

    #[tokio::test]
    async fn test_target_reached_across_promotion() {
        let mut h = Harness::new();
        let full = h.backup(BackupMode::Full).await.unwrap();
        h.cluster.promote(2);
        let when = Utc.timestamp_opt(Utc::now().timestamp() + 3600, 0).unwrap();
        h.cluster.update_page("base/5/16384", 3);
        h.cluster.commit(950, when);
        h.cluster.flush();

        let mut catalog = h.catalog();
        let id = validate_target(&h.ctx, &mut catalog, &RecoveryTarget::Xid(950), None)
            .await
            .unwrap();
        assert_eq!(id, full.id);

        // without the history file timeline 2 cannot be followed from the backup
        std::fs::remove_file(h.ctx.wal_dir("node").join("00000002.history")).unwrap();
        let err = validate_target(&h.ctx, &mut catalog, &RecoveryTarget::Xid(950), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Not enough WAL records to"));
        assert_eq!(catalog.get(full.id).unwrap().status, BackupStatus::Ok);
    }

    #[test]
    fn test_parse_target_time() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        assert_eq!(parse_target_time("2024-05-01 10:30:00").unwrap(), expected);
        assert_eq!(parse_target_time("2024-05-01 12:30:00+02").unwrap(), expected);
        assert_eq!(parse_target_time("2024-05-01T10:30:00Z").unwrap(), expected);
        assert!(parse_target_time("yesterday").is_err());
    }
}

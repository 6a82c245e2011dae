//! Retention and deletion.
//!
//! Redundancy keeps the newest N FULL chains, the window keeps whatever is
//! needed to recover to any point of the last D days. A backup survives
//! when either policy wants it, and every ancestor of a survivor survives
//! with it. RUNNING and MERGING backups are never touched.

use crate::catalog::{BackupId, BackupMode, BackupStatus, CatalogContext, InstanceCatalog};
use crate::pg::Lsn;
use crate::utils::errors::{EngineError, Result};
use crate::wal::WalArchive;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub redundancy: Option<u32>,
    pub window_days: Option<u32>,
}

impl RetentionPolicy {
    /// Instance settings override the catalog-wide configuration.
    pub fn for_instance(ctx: &CatalogContext, catalog: &InstanceCatalog) -> Self {
        Self {
            redundancy: catalog.config.redundancy(&ctx.config),
            window_days: catalog.config.window_days(&ctx.config),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.redundancy.is_none() && self.window_days.is_none()
    }
}

/// Outcome of applying a policy to a catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Oldest first
    pub keep: Vec<BackupId>,
    /// Newest first, the order they are deleted in
    pub expire: Vec<BackupId>,
}

fn untouchable(status: BackupStatus) -> bool {
    matches!(
        status,
        BackupStatus::Running | BackupStatus::Merging | BackupStatus::Deleting
    )
}

/// Decide which backups `policy` retains at time `now`.
pub fn plan(catalog: &InstanceCatalog, policy: RetentionPolicy, now: DateTime<Utc>) -> Result<RetentionPlan> {
    if policy.is_empty() {
        return Err(EngineError::Config(format!(
            "Retention policy is not set for instance '{}': configure redundancy or window",
            catalog.name
        )));
    }
    let boundary = policy
        .window_days
        .map(|days| now - Duration::days(i64::from(days)));

    let mut wanted: HashSet<BackupId> = HashSet::new();
    let mut newer_fulls = 0u32;
    let mut anchored = false;
    for backup in catalog.list() {
        let by_redundancy = policy.redundancy.is_some_and(|n| newer_fulls < n);
        let by_window = match boundary {
            Some(boundary) if backup.recovery_point() >= boundary => true,
            // recovering to the boundary itself needs the newest backup before it
            Some(_) if !anchored && backup.status.is_valid() => {
                anchored = true;
                true
            }
            _ => false,
        };
        if by_redundancy || by_window || untouchable(backup.status) {
            wanted.insert(backup.id);
        }
        if backup.mode == BackupMode::Full && backup.status.is_valid() {
            newer_fulls += 1;
        }
    }

    let mut keep: HashSet<BackupId> = HashSet::new();
    for id in &wanted {
        let mut current = Some(*id);
        while let Some(id) = current {
            if !keep.insert(id) {
                break;
            }
            current = catalog.find(id).and_then(|b| b.parent_id);
        }
    }

    let mut plan = RetentionPlan::default();
    for backup in catalog.iter() {
        if keep.contains(&backup.id) {
            plan.keep.push(backup.id);
        } else {
            plan.expire.push(backup.id);
        }
    }
    plan.expire.reverse();
    Ok(plan)
}

/// Options of `delete --delete-expired`.
#[derive(Debug, Clone, Default)]
pub struct ExpireOptions {
    /// Override the configured policy
    pub redundancy: Option<u32>,
    pub window_days: Option<u32>,
    /// Also remove WAL no retained backup needs
    pub purge_wal: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpireReport {
    pub expired: Vec<BackupId>,
    pub kept: Vec<BackupId>,
    pub wal_removed: Vec<String>,
}

/// Remove WAL older than the start segment of the oldest remaining backup.
pub fn purge_wal(catalog: &InstanceCatalog, archive: &WalArchive, dry_run: bool) -> Result<Vec<String>> {
    let oldest_start = catalog
        .iter()
        .filter(|b| b.status != BackupStatus::Deleting && b.start_lsn != Lsn::INVALID)
        .map(|b| b.start_lsn)
        .min();
    let Some(oldest_start) = oldest_start else {
        warn!(
            "Instance '{}' has no backups, WAL archive is left as is",
            catalog.name
        );
        return Ok(Vec::new());
    };
    let keep_from = oldest_start.segment_number(archive.seg_size());
    info!("Oldest WAL needed starts at {} (segment number {})", oldest_start, keep_from);
    archive.purge_before(keep_from, dry_run)
}

/// Delete backups the retention policy no longer needs.
pub fn delete_expired(ctx: &CatalogContext, instance: &str, options: &ExpireOptions) -> Result<ExpireReport> {
    let mut catalog = ctx.open_instance(instance)?;
    let lock = catalog.lock("delete")?;
    catalog.fail_abandoned(&lock)?;

    let configured = RetentionPolicy::for_instance(ctx, &catalog);
    let policy = RetentionPolicy {
        redundancy: options.redundancy.or(configured.redundancy),
        window_days: options.window_days.or(configured.window_days),
    };
    let plan = plan(&catalog, policy, Utc::now())?;
    if plan.expire.is_empty() {
        info!("There are no backups to delete by retention policy");
    }
    for id in &plan.expire {
        if options.dry_run {
            info!("Backup {} would be deleted by retention policy", id);
        } else {
            catalog.delete(*id)?;
        }
    }

    let wal_removed = if options.purge_wal {
        let archive = catalog.archive(ctx);
        purge_wal(&catalog, &archive, options.dry_run)?
    } else {
        Vec::new()
    };
    Ok(ExpireReport {
        expired: plan.expire,
        kept: plan.keep,
        wal_removed,
    })
}

/// Delete one backup. Refused while it is the parent of another backup.
pub fn delete_backup(ctx: &CatalogContext, instance: &str, id: BackupId) -> Result<()> {
    let mut catalog = ctx.open_instance(instance)?;
    let lock = catalog.lock("delete")?;
    catalog.fail_abandoned(&lock)?;
    let status = catalog.get(id)?.status;
    if untouchable(status) {
        return Err(EngineError::Precondition(format!(
            "Cannot delete backup {} with status {}",
            id, status
        )));
    }
    catalog.delete(id)
}

/// Delete every backup in `status`, with its descendants.
pub fn delete_by_status(ctx: &CatalogContext, instance: &str, status: BackupStatus) -> Result<Vec<BackupId>> {
    let mut catalog = ctx.open_instance(instance)?;
    let lock = catalog.lock("delete")?;
    catalog.fail_abandoned(&lock)?;
    if untouchable(status) {
        return Err(EngineError::Precondition(format!(
            "Backups with status {} cannot be deleted",
            status
        )));
    }
    catalog.delete_by_status(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::{catalog_with, id_at};
    use crate::testutil::Harness;
    use chrono::TimeZone;

    const DAY: i64 = 86_400;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn redundancy(n: u32) -> RetentionPolicy {
        RetentionPolicy {
            redundancy: Some(n),
            window_days: None,
        }
    }

    #[test]
    fn test_redundancy_keeps_newest_chains() {
        use BackupMode::*;
        use BackupStatus::*;
        let (_d, _c, inst) = catalog_with(&[
            (0, Full, None, Ok),
            (10, Page, Some(0), Ok),
            (20, Full, None, Ok),
            (30, Delta, Some(20), Ok),
        ]);
        let plan = plan(&inst, redundancy(1), at(40)).unwrap();
        assert_eq!(plan.keep, vec![id_at(20), id_at(30)]);
        assert_eq!(plan.expire, vec![id_at(10), id_at(0)]);

        let plan = super::plan(&inst, redundancy(2), at(40)).unwrap();
        assert!(plan.expire.is_empty());
    }

    #[test]
    fn test_window_keeps_boundary_backup() {
        use BackupMode::*;
        use BackupStatus::*;
        let (_d, _c, inst) = catalog_with(&[
            (0, Full, None, Ok),
            (100, Page, Some(0), Ok),
            (DAY / 2, Full, None, Ok),
            (DAY * 3 / 2, Full, None, Ok),
            (DAY * 3 / 2 + 100, Delta, Some(DAY * 3 / 2), Ok),
        ]);
        let policy = RetentionPolicy {
            redundancy: None,
            window_days: Some(1),
        };
        let plan = plan(&inst, policy, at(2 * DAY)).unwrap();
        assert_eq!(plan.keep, vec![id_at(DAY / 2), id_at(DAY * 3 / 2), id_at(DAY * 3 / 2 + 100)]);
        assert_eq!(plan.expire, vec![id_at(100), id_at(0)]);
    }

    #[test]
    fn test_ancestors_of_running_backups_stay() {
        use BackupMode::*;
        use BackupStatus::*;
        let (_d, _c, inst) = catalog_with(&[
            (0, Full, None, Ok),
            (10, Full, None, Ok),
            (20, Page, Some(0), Running),
        ]);
        let plan = plan(&inst, redundancy(1), at(30)).unwrap();
        assert!(plan.expire.is_empty());
    }

    #[test]
    fn test_policy_required() {
        let (_d, _c, inst) = catalog_with(&[]);
        let err = plan(&inst, RetentionPolicy::default(), at(0)).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_delete_expired_purges_wal() {
        let mut h = Harness::new();
        let first = h.backup(BackupMode::Full).await.unwrap();
        h.cluster.switch_wal();
        h.cluster.update_page("base/5/16384", 0);
        h.cluster.switch_wal();
        h.cluster.checkpoint();
        let second = h.backup(BackupMode::Full).await.unwrap();
        let archive = h.catalog().archive(&h.ctx);
        let before = archive.list_segments().unwrap();

        let options = ExpireOptions {
            redundancy: Some(1),
            purge_wal: true,
            ..Default::default()
        };
        let report = delete_expired(&h.ctx, "node", &options).unwrap();
        assert_eq!(report.expired, vec![first.id]);
        assert_eq!(report.kept, vec![second.id]);
        assert!(!report.wal_removed.is_empty());
        assert!(!h.backup_dir(first.id).exists());

        let after = archive.list_segments().unwrap();
        assert!(after.len() < before.len());
        let keep_from = second.start_lsn.segment_number(archive.seg_size());
        assert!(after.iter().all(|s| s.segno >= keep_from));
        crate::validate::validate(&h.ctx, "node", None, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_refuses_parent_and_keeps_wal() {
        let mut h = Harness::new();
        let full = h.backup(BackupMode::Full).await.unwrap();
        h.cluster.update_page("base/5/16384", 2);
        h.cluster.checkpoint();
        let delta = h.backup(BackupMode::Delta).await.unwrap();
        let archive = h.catalog().archive(&h.ctx);
        let segments = archive.list_segments().unwrap();

        let err = delete_backup(&h.ctx, "node", full.id).unwrap_err();
        assert!(err.to_string().contains("it is the parent of backup"));
        delete_backup(&h.ctx, "node", delta.id).unwrap();
        assert!(!h.backup_dir(delta.id).exists());
        assert_eq!(archive.list_segments().unwrap(), segments);
        delete_backup(&h.ctx, "node", full.id).unwrap();
    }

    #[tokio::test]
    async fn test_delete_by_status() {
        let mut h = Harness::new();
        let full = h.backup(BackupMode::Full).await.unwrap();
        h.cluster.update_page("base/5/16384", 2);
        h.cluster.checkpoint();
        let delta = h.backup(BackupMode::Delta).await.unwrap();
        h.catalog().set_status(full.id, BackupStatus::Error).unwrap();

        let deleted = delete_by_status(&h.ctx, "node", BackupStatus::Error).unwrap();
        assert_eq!(deleted, vec![full.id, delta.id]);
        assert!(h.catalog().list().is_empty());
    }
}

//! Backup catalog.
//!
//! Layout under the catalog root:
//!
//! ```text
//! backups/<instance>/instance.toml
//! backups/<instance>/<backup-id>/{backup.control, file-manifest, page-header-map, database/...}
//! wal/<instance>/<segment files>
//! ```
//!
//! An instance's backups are held in an id-keyed arena; parents are id
//! references, never pointers.

pub mod backup;
pub mod control;
pub mod instance;
pub mod lock;
pub mod manifest;

pub use backup::{Backup, BackupId, BackupMode, BackupStatus};
pub use instance::InstanceConfig;
pub use lock::InstanceLock;

use crate::config::Config;
use crate::source::SourceNode;
use crate::utils::errors::{EngineError, Result};
use crate::wal::WalArchive;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const BACKUPS_DIR: &str = "backups";
pub const WAL_DIR: &str = "wal";
/// Suffixes of the directories a merge swaps through.
pub const MERGE_SUFFIX: &str = "merge";
pub const RETIRED_SUFFIX: &str = "retired";

/// Explicit handle on one backup catalog.
#[derive(Debug, Clone)]
pub struct CatalogContext {
    pub root: PathBuf,
    pub config: Config,
    pub cancel: CancellationToken,
}

impl CatalogContext {
    pub fn new(root: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            root: root.into(),
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn instance_dir(&self, instance: &str) -> PathBuf {
        self.root.join(BACKUPS_DIR).join(instance)
    }

    pub fn wal_dir(&self, instance: &str) -> PathBuf {
        self.root.join(WAL_DIR).join(instance)
    }

    /// Create an empty catalog.
    pub fn init(&self) -> Result<()> {
        if !crate::fs::dir_is_empty(&self.root)? {
            return Err(EngineError::Precondition(format!(
                "Backup catalog '{}' already exists and is not empty",
                self.root.display()
            )));
        }
        for dir in [self.root.join(BACKUPS_DIR), self.root.join(WAL_DIR)] {
            std::fs::create_dir_all(&dir).map_err(|e| EngineError::file("create", &dir, e))?;
        }
        info!("Backup catalog '{}' successfully initialized", self.root.display());
        Ok(())
    }

    fn check_initialized(&self) -> Result<()> {
        if !self.root.join(BACKUPS_DIR).is_dir() {
            return Err(EngineError::NotFound(format!(
                "Backup catalog '{}' is not initialized",
                self.root.display()
            )));
        }
        Ok(())
    }

    /// Register a data directory as a new instance.
    pub fn add_instance(&self, instance: &str, source: &dyn SourceNode) -> Result<InstanceConfig> {
        self.check_initialized()?;
        if instance.is_empty() || instance.contains('/') || instance.starts_with('.') {
            return Err(EngineError::Config(format!("Invalid instance name '{}'", instance)));
        }
        let dir = self.instance_dir(instance);
        if dir.exists() {
            return Err(EngineError::Precondition(format!(
                "Instance '{}' backup directory already exists: '{}'",
                instance,
                dir.display()
            )));
        }

        let config = InstanceConfig {
            system_identifier: source.system_identifier()?,
            pgdata: source.pgdata().to_path_buf(),
            wal_segment_size: source.wal_segment_size(),
            block_size: crate::pg::BLCKSZ as u32,
            compress_alg: None,
            compress_level: None,
            retention_redundancy: None,
            retention_window: None,
        };

        let wal_dir = self.wal_dir(instance);
        for d in [&dir, &wal_dir] {
            std::fs::create_dir_all(d).map_err(|e| EngineError::file("create", d, e))?;
        }
        config.save(&dir)?;
        info!("Instance '{}' successfully initialized", instance);
        Ok(config)
    }

    pub fn instances(&self) -> Result<Vec<String>> {
        self.check_initialized()?;
        let dir = self.root.join(BACKUPS_DIR);
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| EngineError::file("read directory", &dir, e))? {
            let entry = entry?;
            if entry.path().join(instance::INSTANCE_CONFIG_FILE).is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn open_instance(&self, instance: &str) -> Result<InstanceCatalog> {
        InstanceCatalog::load(self, instance)
    }
}

/// Backups of one instance.
#[derive(Debug)]
pub struct InstanceCatalog {
    pub name: String,
    pub dir: PathBuf,
    pub wal_dir: PathBuf,
    pub config: InstanceConfig,
    backups: BTreeMap<BackupId, Backup>,
}

impl InstanceCatalog {
    pub fn load(ctx: &CatalogContext, instance: &str) -> Result<Self> {
        ctx.check_initialized()?;
        let dir = ctx.instance_dir(instance);
        if !dir.join(instance::INSTANCE_CONFIG_FILE).is_file() {
            return Err(EngineError::NotFound(format!(
                "Instance '{}' does not exist in this backup catalog",
                instance
            )));
        }
        let config = InstanceConfig::load(&dir)?;

        let mut backups = BTreeMap::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| EngineError::file("read directory", &dir, e))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(id) = name.parse::<BackupId>() else {
                continue;
            };
            match control::read(&entry.path(), id) {
                Ok(backup) => {
                    backups.insert(id, backup);
                }
                Err(e) => warn!("Skipping backup directory \"{}\": {}", entry.path().display(), e),
            }
        }

        Ok(Self {
            name: instance.to_string(),
            dir,
            wal_dir: ctx.wal_dir(instance),
            config,
            backups,
        })
    }

    pub fn lock(&self, operation: &str) -> Result<InstanceLock> {
        InstanceLock::acquire(&self.dir, &self.name, operation)
    }

    /// Clean up after a process that died holding the lock: settle an
    /// interrupted merge, then mark RUNNING backups as ERROR. Only valid
    /// while holding the lock, when no live process can own them.
    pub fn fail_abandoned(&mut self, _lock: &InstanceLock) -> Result<Vec<BackupId>> {
        self.recover_merge()?;
        let abandoned: Vec<BackupId> = self
            .backups
            .values()
            .filter(|b| b.status == BackupStatus::Running)
            .map(|b| b.id)
            .collect();
        for id in &abandoned {
            warn!("Backup {} has status RUNNING but no owner, changing it to ERROR", id);
            self.set_status(*id, BackupStatus::Error)?;
        }
        Ok(abandoned)
    }

    /// Finish a merge whose merged copy reached `<id>/`, or roll back one
    /// that did not. Backups still MERGING are then deleted or set back
    /// to OK accordingly; a merge only starts on a validated chain.
    fn recover_merge(&mut self) -> Result<()> {
        let mut work_dirs = Vec::new();
        let mut retired_dirs = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(|e| EngineError::file("read directory", &self.dir, e))? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            let Some((stem, suffix)) = name.rsplit_once('.') else {
                continue;
            };
            let Ok(id) = stem.parse::<BackupId>() else {
                continue;
            };
            match suffix {
                MERGE_SUFFIX => work_dirs.push(id),
                RETIRED_SUFFIX => retired_dirs.push(id),
                _ => {}
            }
        }

        let mut completed = false;
        for id in work_dirs {
            let work_dir = self.merge_dir(id);
            let target_dir = self.backup_dir(id);
            if !target_dir.exists() && work_dir.join(control::CONTROL_FILE).is_file() {
                warn!("Completing interrupted merge of backup {}", id);
                std::fs::rename(&work_dir, &target_dir)
                    .map_err(|e| EngineError::file("rename", &work_dir, e))?;
                self.backups.insert(id, control::read(&target_dir, id)?);
                completed = true;
            } else {
                warn!("Removing leftover merge directory \"{}\"", work_dir.display());
                std::fs::remove_dir_all(&work_dir)
                    .map_err(|e| EngineError::file("remove", &work_dir, e))?;
            }
        }
        let mut superseded = Vec::new();
        for id in retired_dirs {
            let retired = self.retired_dir(id);
            let target_dir = self.backup_dir(id);
            if target_dir.exists() {
                completed = true;
                superseded.push(retired);
            } else {
                warn!("Restoring backup {} after an interrupted merge", id);
                std::fs::rename(&retired, &target_dir)
                    .map_err(|e| EngineError::file("rename", &retired, e))?;
                self.backups.insert(id, control::read(&target_dir, id)?);
            }
        }

        let mut merging: Vec<BackupId> = self
            .backups
            .values()
            .filter(|b| b.status == BackupStatus::Merging)
            .map(|b| b.id)
            .collect();
        // newest first, so children go before their parents
        merging.sort_by(|a, b| b.cmp(a));
        for id in merging {
            if completed {
                warn!("Backup {} was merged away by an interrupted merge, deleting it", id);
                self.delete(id)?;
            } else {
                warn!("Backup {} was left MERGING by an interrupted merge, changing it to OK", id);
                self.set_status(id, BackupStatus::Ok)?;
            }
        }
        for retired in superseded {
            std::fs::remove_dir_all(&retired).map_err(|e| EngineError::file("remove", &retired, e))?;
        }
        Ok(())
    }

    pub fn archive(&self, ctx: &CatalogContext) -> WalArchive {
        WalArchive::new(
            &self.wal_dir,
            self.config.wal_segment_size,
            self.config.system_identifier,
        )
        .with_compression(
            ctx.config.compression.archive_wal,
            ctx.config.compression.level,
        )
    }

    pub fn backup_dir(&self, id: BackupId) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Where a merge builds the new copy of backup `id`.
    pub fn merge_dir(&self, id: BackupId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, MERGE_SUFFIX))
    }

    /// Where backup `id` is parked while its merged copy takes its place.
    pub fn retired_dir(&self, id: BackupId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, RETIRED_SUFFIX))
    }

    /// Backups, newest first.
    pub fn list(&self) -> Vec<&Backup> {
        self.backups.values().rev().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Backup> {
        self.backups.values()
    }

    pub fn contains(&self, id: BackupId) -> bool {
        self.backups.contains_key(&id)
    }

    pub fn find(&self, id: BackupId) -> Option<&Backup> {
        self.backups.get(&id)
    }

    pub fn get(&self, id: BackupId) -> Result<&Backup> {
        self.backups.get(&id).ok_or_else(|| {
            EngineError::NotFound(format!(
                "Backup {} is not found in instance '{}'",
                id, self.name
            ))
        })
    }

    pub fn last_id(&self) -> Option<BackupId> {
        self.backups.keys().next_back().copied()
    }

    /// Direct children of a backup.
    pub fn children(&self, id: BackupId) -> Vec<BackupId> {
        self.backups
            .values()
            .filter(|b| b.parent_id == Some(id))
            .map(|b| b.id)
            .collect()
    }

    /// All descendants, parents before children.
    pub fn descendants(&self, id: BackupId) -> Vec<BackupId> {
        let mut out = Vec::new();
        let mut queue = vec![id];
        while let Some(current) = queue.pop() {
            for child in self.children(current) {
                if child != id && !out.contains(&child) {
                    out.push(child);
                    queue.push(child);
                }
            }
        }
        out.sort();
        out
    }

    /// Create the directory and RUNNING record of a new backup.
    pub fn create(&mut self, backup: Backup) -> Result<PathBuf> {
        if self.backups.contains_key(&backup.id) {
            return Err(EngineError::Precondition(format!(
                "Backup {} already exists",
                backup.id
            )));
        }
        let dir = self.backup_dir(backup.id);
        let data = dir.join(manifest::DATABASE_DIR);
        std::fs::create_dir_all(&data).map_err(|e| EngineError::file("create", &data, e))?;
        control::write(&dir, &backup)?;
        self.backups.insert(backup.id, backup);
        Ok(dir)
    }

    /// Persist a modified record.
    pub fn save(&mut self, backup: &Backup) -> Result<()> {
        control::write(&self.backup_dir(backup.id), backup)?;
        self.backups.insert(backup.id, backup.clone());
        Ok(())
    }

    pub fn set_status(&mut self, id: BackupId, status: BackupStatus) -> Result<()> {
        let mut backup = self.get(id)?.clone();
        if backup.status == status {
            return Ok(());
        }
        backup.status = status;
        self.save(&backup)
    }

    /// Delete one backup. Refused while any backup still names it as parent.
    pub fn delete(&mut self, id: BackupId) -> Result<()> {
        self.get(id)?;
        if let Some(child) = self.children(id).first() {
            return Err(EngineError::Chain(format!(
                "Cannot delete backup {}: it is the parent of backup {}",
                id, child
            )));
        }
        self.remove(id)
    }

    fn remove(&mut self, id: BackupId) -> Result<()> {
        self.set_status(id, BackupStatus::Deleting)?;
        let dir = self.backup_dir(id);
        std::fs::remove_dir_all(&dir).map_err(|e| EngineError::file("remove", &dir, e))?;
        self.backups.remove(&id);
        info!("Backup {} is deleted", id);
        Ok(())
    }

    /// Delete a backup together with everything built on top of it,
    /// newest first.
    pub fn delete_with_descendants(&mut self, id: BackupId) -> Result<Vec<BackupId>> {
        self.get(id)?;
        let mut doomed = self.descendants(id);
        doomed.push(id);
        doomed.sort();
        for victim in doomed.iter().rev() {
            self.remove(*victim)?;
        }
        Ok(doomed)
    }

    /// Delete every backup in `status`, with its descendants.
    pub fn delete_by_status(&mut self, status: BackupStatus) -> Result<Vec<BackupId>> {
        let targets: Vec<BackupId> = self
            .backups
            .values()
            .filter(|b| b.status == status)
            .map(|b| b.id)
            .collect();
        let mut deleted = Vec::new();
        for id in targets {
            if self.contains(id) {
                deleted.extend(self.delete_with_descendants(id)?);
            }
        }
        if deleted.is_empty() {
            info!("There are no backups with status '{}'", status);
        }
        deleted.sort();
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LocalSource;
    use crate::testutil::write_pg_control;
    use chrono::{TimeZone, Utc};
    use std::path::Path;
    use tempfile::TempDir;

    fn catalog() -> (TempDir, CatalogContext, InstanceCatalog) {
        let dir = TempDir::new().unwrap();
        let ctx = CatalogContext::new(dir.path().join("catalog"), Config::default());
        ctx.init().unwrap();
        let pgdata = dir.path().join("pgdata");
        write_pg_control(&pgdata, 42, crate::pg::Lsn(0x1000028), 1, true);
        ctx.add_instance("node", &LocalSource::new(&pgdata)).unwrap();
        let inst = ctx.open_instance("node").unwrap();
        (dir, ctx, inst)
    }

    fn record(secs: i64, mode: BackupMode, parent: Option<BackupId>) -> Backup {
        let time = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        let mut b = Backup::new(BackupId::from_time(time), mode, time);
        b.parent_id = parent;
        b.status = BackupStatus::Ok;
        b.system_identifier = 42;
        b
    }

    #[test]
    fn test_init_twice_fails() {
        let (_dir, ctx, _) = catalog();
        let err = ctx.init().unwrap_err();
        assert!(err.to_string().contains("already exists"));
        let err = ctx
            .add_instance("node", &LocalSource::new(Path::new("/nowhere")))
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(ctx.instances().unwrap(), vec!["node".to_string()]);
    }

    #[test]
    fn test_create_reload_and_list() {
        let (_dir, ctx, mut inst) = catalog();
        let full = record(0, BackupMode::Full, None);
        let page = record(60, BackupMode::Page, Some(full.id));
        inst.create(full.clone()).unwrap();
        inst.create(page.clone()).unwrap();

        let reloaded = ctx.open_instance("node").unwrap();
        let ids: Vec<BackupId> = reloaded.list().iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![page.id, full.id]);
        assert_eq!(reloaded.get(page.id).unwrap().parent_id, Some(full.id));
        assert_eq!(reloaded.children(full.id), vec![page.id]);
    }

    #[test]
    fn test_broken_control_file_is_skipped() {
        let (_dir, ctx, mut inst) = catalog();
        let full = record(0, BackupMode::Full, None);
        inst.create(full.clone()).unwrap();
        std::fs::write(inst.backup_dir(full.id).join(control::CONTROL_FILE), "").unwrap();
        let reloaded = ctx.open_instance("node").unwrap();
        assert!(reloaded.list().is_empty());
    }

    #[test]
    fn test_delete_refuses_parent_of_live_child() {
        let (_dir, _ctx, mut inst) = catalog();
        let full = record(0, BackupMode::Full, None);
        let delta = record(60, BackupMode::Delta, Some(full.id));
        inst.create(full.clone()).unwrap();
        inst.create(delta.clone()).unwrap();

        let err = inst.delete(full.id).unwrap_err();
        assert!(err.to_string().contains("is the parent of backup"));

        inst.delete(delta.id).unwrap();
        assert!(!inst.backup_dir(delta.id).exists());
        inst.delete(full.id).unwrap();
        assert!(inst.list().is_empty());
    }

    #[test]
    fn test_delete_by_status_takes_descendants() {
        let (_dir, _ctx, mut inst) = catalog();
        let full = record(0, BackupMode::Full, None);
        let mut page = record(60, BackupMode::Page, Some(full.id));
        page.status = BackupStatus::Error;
        let ptrack = record(120, BackupMode::Ptrack, Some(page.id));
        for b in [&full, &page, &ptrack] {
            inst.create(b.clone()).unwrap();
        }
        let deleted = inst.delete_by_status(BackupStatus::Error).unwrap();
        assert_eq!(deleted, vec![page.id, ptrack.id]);
        assert!(inst.contains(full.id));
    }

    #[test]
    fn test_abandoned_running_becomes_error() {
        let (_dir, ctx, mut inst) = catalog();
        let mut full = record(0, BackupMode::Full, None);
        full.status = BackupStatus::Running;
        inst.create(full.clone()).unwrap();

        let lock = inst.lock("backup").unwrap();
        assert_eq!(inst.fail_abandoned(&lock).unwrap(), vec![full.id]);
        drop(lock);
        let reloaded = ctx.open_instance("node").unwrap();
        assert_eq!(reloaded.get(full.id).unwrap().status, BackupStatus::Error);
    }
}

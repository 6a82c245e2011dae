//! Restore a backup into an empty data directory.
//!
//! The chain is applied FULL first. Relation files take the pages each
//! backup stored and are cut to the length that backup recorded, so a
//! relation truncated between backups comes back at its later size. Files
//! missing from the target backup's manifest are never written.

use crate::catalog::manifest::{read_headers, read_manifest, FileEntry};
use crate::catalog::{Backup, BackupId, CatalogContext};
use crate::chain;
use crate::executor::progress::CopyProgress;
use crate::fs::copy::restore_file;
use crate::fs::metadata::apply_mode;
use crate::fs::pagefile::read_page;
use crate::fs::walker::FileKind;
use crate::pg::BLCKSZ;
use crate::utils::errors::{EngineError, Result};
use crate::utils::pool::run_bounded;
use crate::validate::{self, RecoveryTarget};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Latest valid backup (satisfying the target, if any) when unset
    pub backup_id: Option<BackupId>,
    pub target_dir: PathBuf,
    /// Old tablespace location to new location
    pub tablespace_mapping: Vec<(PathBuf, PathBuf)>,
    pub recovery_target: Option<RecoveryTarget>,
    /// Defaults to fetching from this catalog's archive
    pub restore_command: Option<String>,
    pub threads: Option<usize>,
    pub no_validate: bool,
}

#[derive(Debug, Clone)]
pub struct RestoreSummary {
    pub backup_id: BackupId,
    pub chain: Vec<BackupId>,
    pub files: usize,
}

/// Parse `OLDDIR=NEWDIR`.
pub fn parse_tablespace_mapping(raw: &str) -> Result<(PathBuf, PathBuf)> {
    match raw.split_once('=') {
        Some((old, new)) if !old.is_empty() && !new.is_empty() => {
            let (old, new) = (PathBuf::from(old), PathBuf::from(new));
            if !old.is_absolute() || !new.is_absolute() {
                return Err(EngineError::Config(format!(
                    "Tablespace mapping \"{}\" must use absolute paths",
                    raw
                )));
            }
            Ok((old, new))
        }
        _ => Err(EngineError::Config(format!(
            "Invalid tablespace mapping format \"{}\", must be \"OLDDIR=NEWDIR\"",
            raw
        ))),
    }
}

/// Where a tablespace link of the source should point after restore.
pub(crate) fn mapped_location(mapping: &[(PathBuf, PathBuf)], original: &Path) -> PathBuf {
    mapping
        .iter()
        .find(|(old, _)| old == original)
        .map(|(_, new)| new.clone())
        .unwrap_or_else(|| original.to_path_buf())
}

/// Write the pages one backup stored for a relation file and cut the file
/// to the length recorded there.
fn apply_datafile(backup_dir: &Path, entry: &FileEntry, dst: &Path) -> Result<()> {
    let headers = read_headers(backup_dir, entry)?;
    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(dst)
        .map_err(|e| EngineError::file("open", dst, e))?;
    if !headers.is_empty() {
        let stored = entry.stored_path(backup_dir);
        let mut input = File::open(&stored).map_err(|e| EngineError::file("open", &stored, e))?;
        for header in &headers {
            let page = read_page(&mut input, header).map_err(|e| {
                EngineError::Corruption(format!("Backup file \"{}\": {}", stored.display(), e))
            })?;
            out.seek(SeekFrom::Start(header.block as u64 * BLCKSZ as u64))
                .and_then(|_| out.write_all(&page))
                .map_err(|e| EngineError::file("write", dst, e))?;
        }
    }
    let len = entry.n_blocks.unwrap_or(0) as u64 * BLCKSZ as u64;
    out.set_len(len)
        .map_err(|e| EngineError::file("truncate", dst, e))?;
    Ok(())
}

struct ApplyJob {
    backup_dir: PathBuf,
    target_dir: PathBuf,
    progress: CopyProgress,
}

impl ApplyJob {
    fn apply(&self, entry: FileEntry) -> Result<()> {
        let dst = self.target_dir.join(&entry.path);
        if entry.is_datafile {
            apply_datafile(&self.backup_dir, &entry, &dst)?;
            let stored = entry.write_size.max(0) as u64;
            self.progress.file_done(&entry.path, stored, stored);
        } else {
            let outcome = restore_file(&entry.stored_path(&self.backup_dir), entry.compressed, &dst)?;
            if outcome.crc != entry.crc {
                return Err(EngineError::Corruption(format!(
                    "Invalid CRC of backup file \"{}\"",
                    entry.stored_path(&self.backup_dir).display()
                )));
            }
            self.progress.file_done(&entry.path, outcome.read_bytes, outcome.written_bytes);
        }
        Ok(())
    }
}

/// Create directories and tablespace links of the target manifest.
fn create_layout(
    entries: &[FileEntry],
    target_dir: &Path,
    mapping: &[(PathBuf, PathBuf)],
) -> Result<()> {
    let mut layout: Vec<&FileEntry> = entries.iter().filter(|e| e.kind != FileKind::File).collect();
    layout.sort_by(|a, b| a.path.cmp(&b.path));
    for entry in layout {
        let path = target_dir.join(&entry.path);
        match &entry.kind {
            FileKind::Link(original) => {
                let location = mapped_location(mapping, Path::new(original));
                if !crate::fs::dir_is_empty(&location)? {
                    return Err(EngineError::Precondition(format!(
                        "Restore tablespace destination is not empty: \"{}\"",
                        location.display()
                    )));
                }
                std::fs::create_dir_all(&location)
                    .map_err(|e| EngineError::file("create", &location, e))?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| EngineError::file("create", parent, e))?;
                }
                make_symlink(&location, &path)?;
                debug!("Linked \"{}\" to \"{}\"", entry.path, location.display());
            }
            _ => {
                std::fs::create_dir_all(&path).map_err(|e| EngineError::file("create", &path, e))?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| EngineError::file("create symlink", link, e))
}

#[cfg(not(unix))]
pub(crate) fn make_symlink(_target: &Path, link: &Path) -> Result<()> {
    Err(EngineError::Unsupported(format!(
        "Cannot create symlink \"{}\" on this platform",
        link.display()
    )))
}

fn write_recovery_settings(
    ctx: &CatalogContext,
    instance: &str,
    target_dir: &Path,
    options: &RestoreOptions,
) -> Result<()> {
    let restore_command = options.restore_command.clone().unwrap_or_else(|| {
        format!(
            "pgbackup archive-get -B {} --instance {} --wal-file-path=%p --wal-file-name=%f",
            ctx.root.display(),
            instance
        )
    });
    let mut settings = format!(
        "\n# recovery settings added by pgbackup restore\nrestore_command = '{}'\n",
        restore_command.replace('\'', "''")
    );
    if let Some(target) = &options.recovery_target {
        settings.push_str(&target.recovery_setting());
        settings.push_str("\nrecovery_target_action = 'promote'\n");
    }

    let conf = target_dir.join("postgresql.auto.conf");
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&conf)
        .map_err(|e| EngineError::file("open", &conf, e))?;
    file.write_all(settings.as_bytes())
        .map_err(|e| EngineError::file("write", &conf, e))?;
    let signal = target_dir.join("recovery.signal");
    std::fs::write(&signal, b"").map_err(|e| EngineError::file("write", &signal, e))?;
    Ok(())
}

/// Restore a backup of `instance` into `options.target_dir`.
pub async fn restore(
    ctx: &CatalogContext,
    instance: &str,
    options: &RestoreOptions,
) -> Result<RestoreSummary> {
    let mut catalog = ctx.open_instance(instance)?;
    let lock = catalog.lock("restore")?;
    catalog.fail_abandoned(&lock)?;

    let target = options.recovery_target.as_ref();
    let id = validate::select_for_target(&catalog, target, options.backup_id)?;
    if options.no_validate {
        info!("Backup {} validation is skipped", id);
    } else {
        match target {
            Some(target) => {
                validate::validate_target(ctx, &mut catalog, target, Some(id)).await?;
            }
            None => {
                validate::validate_backup(ctx, &mut catalog, id).await?;
            }
        }
    }

    let chain: Vec<Backup> = chain::restore_chain(&catalog, id)?.into_iter().cloned().collect();
    if !crate::fs::dir_is_empty(&options.target_dir)? {
        return Err(EngineError::Precondition(format!(
            "Restore destination is not empty: \"{}\"",
            options.target_dir.display()
        )));
    }
    std::fs::create_dir_all(&options.target_dir)
        .map_err(|e| EngineError::file("create", &options.target_dir, e))?;
    info!(
        "Restoring backup {} into \"{}\", chain of {} backups",
        id,
        options.target_dir.display(),
        chain.len()
    );

    let wanted = read_manifest(&catalog.backup_dir(id))?;
    create_layout(&wanted, &options.target_dir, &options.tablespace_mapping)?;
    let wanted_paths: HashSet<&str> = wanted
        .iter()
        .filter(|e| e.kind == FileKind::File)
        .map(|e| e.path.as_str())
        .collect();
    let threads = options.threads.unwrap_or(ctx.config.performance.threads);

    let mut written: HashMap<String, BackupId> = HashMap::new();
    for backup in &chain {
        let backup_dir = catalog.backup_dir(backup.id);
        let entries: Vec<FileEntry> = read_manifest(&backup_dir)?
            .into_iter()
            .filter(|e| e.has_stored_copy() && wanted_paths.contains(e.path.as_str()))
            .collect();
        for entry in &entries {
            written.insert(entry.path.clone(), backup.id);
        }
        debug!("Applying {} files of backup {}", entries.len(), backup.id);
        let job = Arc::new(ApplyJob {
            backup_dir,
            target_dir: options.target_dir.clone(),
            progress: CopyProgress::new(entries.len(), 0),
        });
        let worker = Arc::clone(&job);
        run_bounded(entries, threads, &ctx.cancel, move |entry| worker.apply(entry)).await?;
        info!("Backup {} applied: {}", backup.id, job.progress.summary());
    }

    for entry in &wanted {
        let path = options.target_dir.join(&entry.path);
        match entry.kind {
            FileKind::File if !written.contains_key(&entry.path) => {
                warn!("File \"{}\" has no stored copy in the chain of backup {}", entry.path, id);
            }
            FileKind::Link(_) => continue,
            _ => {}
        }
        if path.exists() {
            apply_mode(&path, entry.mode)?;
        }
    }

    write_recovery_settings(ctx, instance, &options.target_dir, options)?;
    info!("Restore of backup {} completed", id);
    drop(lock);
    Ok(RestoreSummary {
        backup_id: id,
        chain: chain.iter().map(|b| b.id).collect(),
        files: wanted_paths.len(),
    })
}

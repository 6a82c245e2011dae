//! Backup executor - takes FULL, PAGE, DELTA and PTRACK backups.
//!
//! A backup runs under the instance lock:
//! - the record is created RUNNING before the source is asked for a start point
//! - relation files are copied page by page, other files whole, by a bounded
//!   worker pool that appends to the manifest as it goes
//! - the record only becomes DONE once the stop segment is archived, and OK
//!   once validated
//!
//! Any failure after the record exists leaves it in ERROR with its files kept.

pub mod progress;

use crate::catalog::manifest::{FileEntry, ManifestWriter, BYTES_INVALID, DATABASE_DIR};
use crate::catalog::{Backup, BackupId, BackupMode, BackupStatus, CatalogContext, InstanceCatalog};
use crate::chain;
use crate::config::CompressAlg;
use crate::fs::copy::{file_crc, store_file};
use crate::fs::pagefile::PageWriter;
use crate::fs::walker::{total_size, walk_pgdata, FileInfo, FileKind, WalkOptions};
use crate::pg::page::{inspect, PageState};
use crate::pg::{relfile, Lsn, RelFileKey, BLCKSZ, control_file::PG_CONTROL_PATH};
use crate::source::SourceNode;
use crate::tracking::{
    page_tracker, ptrack_tracker, ChangeTracker, PageSelection, ParentFile, PtrackWindow,
    WalContext,
};
use crate::utils::errors::{EngineError, Result};
use crate::utils::pool::run_bounded;
use crate::validate;
use crate::wal::{SegmentName, TimelineHistory, WalArchive};
use chrono::Utc;
use progress::CopyProgress;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reads of a page that fails the header check before giving up.
const PAGE_READ_ATTEMPTS: usize = 3;

/// Options of one backup run
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub mode: BackupMode,
    /// Worker count; the configured default when unset
    pub threads: Option<usize>,
    pub note: Option<String>,
    /// Validate right after the backup; the configured default when unset
    pub validate: Option<bool>,
    /// Paths left out of the backup, absolute or PGDATA-relative
    pub exclude_paths: Vec<PathBuf>,
}

impl BackupOptions {
    pub fn new(mode: BackupMode) -> Self {
        Self {
            mode,
            threads: None,
            note: None,
            validate: None,
            exclude_paths: Vec::new(),
        }
    }
}

/// Visit the selected pages of a relation file in block order.
///
/// Reading stops quietly at the end of a file that shrank since it was
/// listed. Returns the number of bytes read.
pub(crate) fn for_each_selected_page<F>(
    path: &Path,
    n_blocks: u32,
    selection: &PageSelection,
    mut visit: F,
) -> Result<u64>
where
    F: FnMut(u32, &[u8]) -> Result<()>,
{
    let mut file = File::open(path).map_err(|e| EngineError::file("open", path, e))?;
    let mut page = vec![0u8; BLCKSZ];
    let mut read = 0u64;
    for blk in 0..n_blocks {
        if !selection.includes(blk) {
            continue;
        }
        let mut attempt = 0;
        loop {
            file.seek(SeekFrom::Start(blk as u64 * BLCKSZ as u64))
                .map_err(|e| EngineError::file("seek", path, e))?;
            match file.read_exact(&mut page) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    debug!("File \"{}\" shrank to less than {} blocks", path.display(), blk + 1);
                    return Ok(read);
                }
                Err(e) => return Err(EngineError::file("read", path, e)),
            }
            if inspect(&page) != PageState::Invalid {
                break;
            }
            attempt += 1;
            if attempt == PAGE_READ_ATTEMPTS {
                return Err(EngineError::Corruption(format!(
                    "Corruption detected in file \"{}\", block {}: page header is invalid",
                    path.display(),
                    blk
                )));
            }
        }
        read += BLCKSZ as u64;
        visit(blk, &page)?;
    }
    Ok(read)
}

/// Main-fork segment that can be copied page by page.
pub(crate) fn datafile_key(file: &FileInfo) -> Option<RelFileKey> {
    if !file.is_file() || file.metadata.size % BLCKSZ as u64 != 0 {
        return None;
    }
    relfile::classify(&file.relative_path)
}

/// Everything a copy worker needs; shared read-only between workers.
struct CopyJob {
    data_dir: PathBuf,
    tracker: ChangeTracker,
    parent_files: HashMap<String, FileEntry>,
    level: Option<i32>,
    manifest: Arc<ManifestWriter>,
    progress: CopyProgress,
}

impl CopyJob {
    fn backup_file(&self, file: FileInfo) -> Result<Option<FileEntry>> {
        let dst = self.data_dir.join(&file.relative_path);
        let result = match datafile_key(&file) {
            Some(key) => self.backup_datafile(&file, &key, &dst),
            None => self.backup_plain_file(&file, &dst),
        };
        let entry = match result {
            Ok(entry) => entry,
            Err(e) if e.is_not_found() && !file.path.exists() => {
                warn!("File \"{}\" is not found, skipping it", file.path.display());
                let _ = std::fs::remove_file(&dst);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.manifest.add(&entry)?;
        Ok(Some(entry))
    }

    fn backup_datafile(&self, file: &FileInfo, key: &RelFileKey, dst: &Path) -> Result<FileEntry> {
        let n_blocks = (file.metadata.size / BLCKSZ as u64) as u32;
        let parent = self
            .parent_files
            .get(&file.relative_path)
            .filter(|p| p.is_datafile)
            .map(|p| ParentFile {
                n_blocks: p.n_blocks.unwrap_or(0),
            });
        let selection = self
            .tracker
            .compute_changed_pages(key, &file.path, n_blocks, parent)?;

        let out = File::create(dst).map_err(|e| EngineError::file("create", dst, e))?;
        let mut writer = PageWriter::new(BufWriter::new(out), self.level);
        let read = for_each_selected_page(&file.path, n_blocks, &selection, |blk, page| {
            writer.write_page(blk, page)
        })?;
        let stream = writer.finish()?;
        let (hdr_off, hdr_crc) = self.manifest.append_headers(&stream.entries)?;
        self.progress
            .file_done(&file.relative_path, read, stream.stored_bytes);

        let mut entry = FileEntry::from_info(file);
        entry.crc = stream.content_crc;
        entry.write_size = stream.stored_bytes as i64;
        entry.is_datafile = true;
        entry.n_blocks = Some(n_blocks);
        entry.hdr_off = hdr_off;
        entry.n_headers = stream.entries.len() as u32;
        entry.hdr_crc = hdr_crc;
        entry.compressed = self.level.is_some();
        Ok(entry)
    }

    fn backup_plain_file(&self, file: &FileInfo, dst: &Path) -> Result<FileEntry> {
        let mut entry = FileEntry::from_info(file);
        if let Some(parent) = self.parent_files.get(&file.relative_path) {
            let comparable = parent.kind == FileKind::File
                && !parent.is_datafile
                && parent.size == file.metadata.size
                && file.relative_path != PG_CONTROL_PATH;
            if comparable {
                let crc = file_crc(&file.path)?;
                if crc == parent.crc {
                    entry.crc = crc;
                    entry.write_size = BYTES_INVALID;
                    self.progress.file_done(&file.relative_path, file.metadata.size, 0);
                    return Ok(entry);
                }
            }
        }
        let outcome = store_file(&file.path, dst, self.level)?;
        self.progress
            .file_done(&file.relative_path, outcome.read_bytes, outcome.written_bytes);
        entry.size = outcome.read_bytes;
        entry.crc = outcome.crc;
        entry.write_size = outcome.written_bytes as i64;
        entry.compressed = self.level.is_some();
        Ok(entry)
    }
}

/// Backup engine for one catalog and one source cluster.
pub struct BackupExecutor<'a> {
    ctx: &'a CatalogContext,
    source: &'a dyn SourceNode,
}

impl<'a> BackupExecutor<'a> {
    pub fn new(ctx: &'a CatalogContext, source: &'a dyn SourceNode) -> Self {
        Self { ctx, source }
    }

    /// Take a backup of `instance`; returns the finished record.
    pub async fn execute(&self, instance: &str, options: &BackupOptions) -> Result<Backup> {
        let mut catalog = self.ctx.open_instance(instance)?;
        let lock = catalog.lock("backup")?;
        catalog.fail_abandoned(&lock)?;

        let system_id = self.source.system_identifier()?;
        if system_id != catalog.config.system_identifier {
            return Err(EngineError::Chain(format!(
                "Database identifiers mismatch: instance '{}' has system identifier {}, but source has {}",
                instance, catalog.config.system_identifier, system_id
            )));
        }
        let history = self.source.timeline_history()?;
        let parent = if options.mode.is_incremental() {
            Some(chain::select_parent(&catalog, &history)?.clone())
        } else {
            None
        };

        let (alg, level) = catalog.config.compression(&self.ctx.config);
        let now = Utc::now();
        let mut backup = Backup::new(BackupId::next(now, catalog.last_id()), options.mode, now);
        backup.parent_id = parent.as_ref().map(|p| p.id);
        backup.system_identifier = system_id;
        backup.wal_segment_size = catalog.config.wal_segment_size;
        backup.block_size = catalog.config.block_size;
        backup.compress_alg = alg;
        backup.compress_level = level;
        backup.server_version = self.source.server_version();
        backup.note = options.note.clone();
        catalog.create(backup.clone())?;
        match &parent {
            Some(p) => info!(
                "Backup {} backup mode: {}, parent backup: {}",
                backup.id, backup.mode, p.id
            ),
            None => info!("Backup {} backup mode: {}", backup.id, backup.mode),
        }

        if let Err(e) = self
            .run(&mut catalog, &mut backup, parent.as_ref(), &history, options)
            .await
        {
            warn!("Backup {} is running, setting its status to ERROR", backup.id);
            backup.status = BackupStatus::Error;
            backup.end_time = Some(Utc::now());
            if let Err(save_err) = catalog.save(&backup) {
                warn!("Cannot save status of backup {}: {}", backup.id, save_err);
            }
            return Err(e);
        }

        let validate = options
            .validate
            .unwrap_or(self.ctx.config.backup.validate_after_backup);
        if validate {
            validate::validate_backup(self.ctx, &mut catalog, backup.id).await?;
        } else {
            info!("Backup {} completed", backup.id);
        }
        let finished = catalog.get(backup.id)?.clone();
        drop(lock);
        Ok(finished)
    }

    async fn run(
        &self,
        catalog: &mut InstanceCatalog,
        backup: &mut Backup,
        parent: Option<&Backup>,
        history: &TimelineHistory,
        options: &BackupOptions,
    ) -> Result<()> {
        let cancel = &self.ctx.cancel;
        let threads = options.threads.unwrap_or(self.ctx.config.performance.threads);
        let label = format!("pgbackup backup {}", backup.id);

        let start = self.source.start_backup(&label)?;
        backup.tli = start.tli;
        backup.start_lsn = start.start_lsn;
        catalog.save(backup)?;
        info!("Backup {} START LSN: {}, timeline {}", backup.id, start.start_lsn, start.tli);
        if let Some(parent) = parent {
            chain::check_start_after_parent(parent, start.start_lsn)?;
        }

        let archive = catalog.archive(self.ctx);
        let tracker = self
            .select_tracker(backup, parent, history, &archive, threads)
            .await?;
        if cancel.is_cancelled() {
            return Err(EngineError::interrupted());
        }

        let dir = catalog.backup_dir(backup.id);
        let data_dir = dir.join(DATABASE_DIR);
        let walk = WalkOptions {
            exclude_paths: options.exclude_paths.clone(),
            include_runtime: false,
        };
        let files = walk_pgdata(self.source.pgdata(), &walk)?;
        let parent_files: HashMap<String, FileEntry> = match parent {
            Some(p) => crate::catalog::manifest::read_manifest(&catalog.backup_dir(p.id))?
                .into_iter()
                .map(|e| (e.path.clone(), e))
                .collect(),
            None => HashMap::new(),
        };

        let manifest = Arc::new(ManifestWriter::create(&dir)?);
        let mut regular = Vec::new();
        for file in files {
            if file.is_file() {
                regular.push(file);
                continue;
            }
            let target = data_dir.join(&file.relative_path);
            std::fs::create_dir_all(&target).map_err(|e| EngineError::file("create", &target, e))?;
            manifest.add(&FileEntry::from_info(&file))?;
        }
        regular.sort_by_key(|f| f.metadata.size);
        info!(
            "Backup {}: {} files to process, {} in total",
            backup.id,
            regular.len(),
            progress::format_bytes(total_size(&regular))
        );

        let job = Arc::new(CopyJob {
            data_dir: data_dir.clone(),
            tracker,
            parent_files,
            level: (backup.compress_alg == CompressAlg::Zstd).then_some(backup.compress_level),
            manifest: Arc::clone(&manifest),
            progress: CopyProgress::new(regular.len(), total_size(&regular)),
        });
        let worker = Arc::clone(&job);
        let copied = run_bounded(regular, threads, cancel, move |file| worker.backup_file(file)).await?;
        info!("Backup {} data files are copied: {}", backup.id, job.progress.summary());

        let stop = self.source.stop_backup(&label, &start)?;
        let mut data_bytes: u64 = copied
            .iter()
            .flatten()
            .map(|e| e.write_size.max(0) as u64)
            .sum();
        let mut uncompressed_bytes = job.progress.bytes_read();
        for (name, content) in [
            ("backup_label", Some(&stop.backup_label)),
            ("tablespace_map", stop.tablespace_map.as_ref()),
        ] {
            let Some(content) = content else { continue };
            let path = data_dir.join(name);
            std::fs::write(&path, content).map_err(|e| EngineError::file("write", &path, e))?;
            manifest.add(&FileEntry {
                path: name.to_string(),
                kind: FileKind::File,
                size: content.len() as u64,
                mode: crate::fs::metadata::DEFAULT_FILE_MODE,
                mtime: Utc::now().timestamp(),
                crc: crc32fast::hash(content.as_bytes()),
                write_size: content.len() as i64,
                is_datafile: false,
                n_blocks: None,
                hdr_off: 0,
                n_headers: 0,
                hdr_crc: 0,
                compressed: false,
            })?;
            data_bytes += content.len() as u64;
            uncompressed_bytes += content.len() as u64;
        }
        drop(job);
        let manifest = Arc::try_unwrap(manifest)
            .map_err(|_| EngineError::Worker("manifest writer is still in use".to_string()))?;
        let summary = manifest.finish()?;

        backup.stop_lsn = stop.stop_lsn;
        backup.recovery_time = stop.recovery_time;
        backup.recovery_xid = stop.recovery_xid;
        backup.content_crc = Some(summary.crc);
        backup.data_bytes = data_bytes;
        backup.uncompressed_bytes = uncompressed_bytes;
        catalog.save(backup)?;
        info!("Backup {} STOP LSN: {}", backup.id, stop.stop_lsn);

        if stop.stop_lsn > start.start_lsn {
            let last = SegmentName::for_lsn(start.tli, Lsn(stop.stop_lsn.0 - 1), backup.wal_segment_size);
            info!("Wait for WAL segment {} to be archived", last);
            archive
                .wait_for_segment(&last, self.ctx.config.archive_timeout(), cancel)
                .await?;
        }

        backup.status = BackupStatus::Done;
        backup.end_time = Some(Utc::now());
        catalog.save(backup)?;

        if self.source.read_ptrack_map()?.is_some() {
            let watermark = self.source.ptrack_reset()?;
            debug!("Ptrack map reset at {}", watermark);
        }
        Ok(())
    }

    /// Block until the archive holds the segment with `lsn`.
    async fn wait_for_wal(&self, archive: &WalArchive, history: &TimelineHistory, lsn: Lsn) -> Result<()> {
        let segment = SegmentName::for_lsn(history.tli_for_lsn(lsn), lsn, archive.seg_size());
        debug!("Wait for WAL segment {} to be archived", segment);
        archive
            .wait_for_segment(&segment, self.ctx.config.archive_timeout(), &self.ctx.cancel)
            .await
    }

    async fn select_tracker(
        &self,
        backup: &Backup,
        parent: Option<&Backup>,
        history: &TimelineHistory,
        archive: &WalArchive,
        threads: usize,
    ) -> Result<ChangeTracker> {
        let Some(parent) = parent else {
            return Ok(ChangeTracker::Full);
        };
        let wal = WalContext {
            source: Arc::new(archive.clone()),
            history: Arc::new(history.clone()),
            system_id: backup.system_identifier,
            seg_size: backup.wal_segment_size,
        };
        match backup.mode {
            BackupMode::Full => Ok(ChangeTracker::Full),
            BackupMode::Delta => Ok(ChangeTracker::Delta {
                since: parent.start_lsn,
            }),
            BackupMode::Page => {
                if backup.start_lsn > parent.start_lsn {
                    self.wait_for_wal(archive, history, Lsn(backup.start_lsn.0 - 1))
                        .await?;
                }
                page_tracker(&wal, parent.start_lsn, backup.start_lsn, threads, &self.ctx.cancel)
                    .await
            }
            BackupMode::Ptrack => {
                let map = self.source.read_ptrack_map()?.ok_or_else(|| {
                    EngineError::Precondition(
                        "Ptrack is disabled in the source cluster, PTRACK backup is impossible"
                            .to_string(),
                    )
                })?;
                if map.watermark > parent.start_lsn && map.watermark <= backup.start_lsn {
                    self.wait_for_wal(archive, history, Lsn(map.watermark.0 - 1))
                        .await?;
                }
                let lower_what = format!("STOP LSN of parent backup {}", parent.id);
                let window = PtrackWindow {
                    lower: parent.stop_lsn,
                    lower_what: &lower_what,
                    upper: backup.start_lsn,
                    wal_from: parent.start_lsn,
                };
                ptrack_tracker(&map, window, &wal, threads, &self.ctx.cancel).await
            }
        }
    }
}

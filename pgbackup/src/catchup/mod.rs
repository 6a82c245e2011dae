//! Catchup - synchronize a plain data directory with a live source.
//!
//! The destination is not a catalog backup. FULL copies into an empty
//! directory; DELTA and PTRACK take a cleanly stopped copy made by an
//! earlier catchup and rewrite only the pages that changed since its redo
//! point, drop files the source no longer has, then bring over the WAL
//! the destination needs to become consistent. `global/pg_control` is
//! written last.

pub mod preflight;

use crate::catalog::BackupMode;
use crate::config::Config;
use crate::executor::progress::{format_bytes, CopyProgress};
use crate::executor::{datafile_key, for_each_selected_page};
use crate::fs::copy::file_crc;
use crate::fs::metadata::apply_mode;
use crate::fs::walker::{total_size, walk_pgdata, FileInfo, FileKind, WalkOptions};
use crate::pg::control_file::PG_CONTROL_PATH;
use crate::pg::{Lsn, RelFileKey, TimeLineId, BLCKSZ};
use crate::restore::make_symlink;
use crate::source::{BackupStartInfo, SourceNode};
use crate::tracking::{ptrack_tracker, ChangeTracker, ParentFile, PtrackWindow, WalContext};
use crate::utils::errors::{EngineError, Result, WalError};
use crate::utils::pool::run_bounded;
use crate::wal::segment::history_file_name;
use crate::wal::{SegmentName, TimelineHistory, WalArchive};
use preflight::{DestinationState, SlotPlan};
use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CATCHUP_LABEL: &str = "pgbackup catchup";

#[derive(Debug, Clone)]
pub struct CatchupOptions {
    pub mode: BackupMode,
    pub destination: PathBuf,
    pub threads: Option<usize>,
    /// Paths left out, absolute or PGDATA-relative
    pub exclude_paths: Vec<PathBuf>,
    pub tablespace_mapping: Vec<(PathBuf, PathBuf)>,
    /// Keep the destination's WAL here, behind a `pg_wal` symlink
    pub waldir: Option<PathBuf>,
    pub slot: Option<String>,
    pub perm_slot: bool,
    pub temp_slot: bool,
    /// Read and compare everything, write nothing
    pub dry_run: bool,
}

impl CatchupOptions {
    pub fn new(mode: BackupMode, destination: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            destination: destination.into(),
            threads: None,
            exclude_paths: Vec::new(),
            tablespace_mapping: Vec::new(),
            waldir: None,
            slot: None,
            perm_slot: false,
            temp_slot: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatchupSummary {
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub tli: TimeLineId,
    /// Files written, or that would be written in a dry run
    pub files_copied: usize,
    pub bytes_copied: u64,
    /// Destination paths the source no longer has
    pub removed: Vec<String>,
}

struct SyncJob {
    dest_root: PathBuf,
    tracker: ChangeTracker,
    /// Sizes of the destination's regular files
    dest_files: HashMap<String, u64>,
    dry_run: bool,
    progress: CopyProgress,
}

impl SyncJob {
    /// Bytes written for one source file; 0 when it was already in sync.
    fn sync_file(&self, file: FileInfo) -> Result<u64> {
        let dst = self.dest_root.join(&file.relative_path);
        let result = match datafile_key(&file) {
            Some(key) => self.sync_datafile(&file, &key, &dst),
            None => self.sync_plain_file(&file, &dst),
        };
        match result {
            Err(e) if e.is_not_found() && !file.path.exists() => {
                warn!("File \"{}\" is not found, skipping it", file.path.display());
                Ok(0)
            }
            other => other,
        }
    }

    fn sync_datafile(&self, file: &FileInfo, key: &RelFileKey, dst: &Path) -> Result<u64> {
        let n_blocks = (file.metadata.size / BLCKSZ as u64) as u32;
        let parent = self
            .dest_files
            .get(&file.relative_path)
            .filter(|size| *size % BLCKSZ as u64 == 0)
            .map(|size| ParentFile {
                n_blocks: (size / BLCKSZ as u64) as u32,
            });
        let selection = self
            .tracker
            .compute_changed_pages(key, &file.path, n_blocks, parent)?;

        let mut out = if self.dry_run {
            None
        } else {
            Some(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(dst)
                    .map_err(|e| EngineError::file("open", dst, e))?,
            )
        };
        let mut written = 0u64;
        let read = for_each_selected_page(&file.path, n_blocks, &selection, |blk, page| {
            if let Some(out) = out.as_mut() {
                out.seek(SeekFrom::Start(blk as u64 * BLCKSZ as u64))
                    .and_then(|_| out.write_all(page))
                    .map_err(|e| EngineError::file("write", dst, e))?;
            }
            written += BLCKSZ as u64;
            Ok(())
        })?;
        if let Some(out) = out {
            out.set_len(n_blocks as u64 * BLCKSZ as u64)
                .map_err(|e| EngineError::file("truncate", dst, e))?;
            apply_mode(dst, file.metadata.mode)?;
        }
        self.progress.file_done(&file.relative_path, read, written);
        Ok(written)
    }

    fn sync_plain_file(&self, file: &FileInfo, dst: &Path) -> Result<u64> {
        let size = file.metadata.size;
        if self.dest_files.get(&file.relative_path) == Some(&size)
            && file_crc(&file.path)? == file_crc(dst)?
        {
            self.progress.file_done(&file.relative_path, size, 0);
            return Ok(0);
        }
        if !self.dry_run {
            std::fs::copy(&file.path, dst).map_err(|e| EngineError::file("copy", &file.path, e))?;
        }
        self.progress.file_done(&file.relative_path, size, size);
        Ok(size)
    }
}

/// Catchup engine for one source cluster.
pub struct CatchupEngine<'a> {
    config: &'a Config,
    source: &'a dyn SourceNode,
    cancel: CancellationToken,
}

impl<'a> CatchupEngine<'a> {
    pub fn new(config: &'a Config, source: &'a dyn SourceNode) -> Self {
        Self {
            config,
            source,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self, options: &CatchupOptions) -> Result<CatchupSummary> {
        if options.mode == BackupMode::Page {
            return Err(EngineError::Unsupported(
                "PAGE mode is not supported by catchup, use DELTA or PTRACK".to_string(),
            ));
        }
        let dest = options.destination.as_path();
        let threads = options.threads.unwrap_or(self.config.performance.threads);
        let dry_run = options.dry_run;
        if dry_run {
            info!("Dry run: destination \"{}\" is not modified", dest.display());
        }

        let slot = preflight::plan_slot(self.source, options)?;
        let system_id = self.source.system_identifier()?;
        let history = self.source.timeline_history()?;
        let dest_state = preflight::check_destination(options.mode, dest, system_id, &history)?;
        preflight::check_waldir(options.mode, dest, options.waldir.as_deref())?;

        let walk = WalkOptions {
            exclude_paths: options.exclude_paths.clone(),
            include_runtime: false,
        };
        let files = walk_pgdata(self.source.pgdata(), &walk)?;
        let links: HashMap<String, PathBuf> =
            preflight::check_tablespaces(&files, &options.tablespace_mapping)?
                .into_iter()
                .collect();
        if dest_state.is_none() {
            for location in links.values() {
                if !crate::fs::dir_is_empty(location)? {
                    return Err(EngineError::Precondition(format!(
                        "Tablespace destination is not empty: \"{}\"",
                        location.display()
                    )));
                }
            }
        }

        match &slot {
            SlotPlan::Create { name, temporary } if !dry_run => {
                self.source.create_slot(name, *temporary)?;
                info!(
                    "Created {} replication slot \"{}\"",
                    if *temporary { "temporary" } else { "permanent" },
                    name
                );
            }
            SlotPlan::Existing(name) => info!("Using replication slot \"{}\"", name),
            _ => {}
        }

        let start = self.source.start_backup(CATCHUP_LABEL)?;
        info!("Catchup START LSN: {}, timeline {}", start.start_lsn, start.tli);
        if let Some(state) = dest_state {
            if start.start_lsn < state.redo {
                return Err(EngineError::Chain(format!(
                    "Current START LSN {} is lower than destination redo LSN {}, the source is behind the destination",
                    start.start_lsn, state.redo
                )));
            }
        }
        let tracker = self
            .select_tracker(options.mode, dest_state, &start, &history, system_id, threads)
            .await?;
        if self.cancel.is_cancelled() {
            return Err(EngineError::interrupted());
        }

        let dest_listing = match dest_state {
            Some(_) => walk_pgdata(dest, &walk)?,
            None => Vec::new(),
        };
        let removed = remove_stale(dest, &files, &dest_listing, dry_run)?;
        if !dry_run {
            self.create_layout(dest, &files, &links, options)?;
        }

        let dest_files: HashMap<String, u64> = dest_listing
            .iter()
            .filter(|f| f.is_file())
            .map(|f| (f.relative_path.clone(), f.metadata.size))
            .collect();
        let mut regular: Vec<FileInfo> = files
            .into_iter()
            .filter(|f| f.is_file() && f.relative_path != PG_CONTROL_PATH)
            .collect();
        regular.sort_by_key(|f| f.metadata.size);
        info!(
            "Catchup: {} files to compare, {} in total",
            regular.len(),
            format_bytes(total_size(&regular))
        );

        let job = Arc::new(SyncJob {
            dest_root: dest.to_path_buf(),
            tracker,
            dest_files,
            dry_run,
            progress: CopyProgress::new(regular.len(), total_size(&regular)),
        });
        let worker = Arc::clone(&job);
        let written = run_bounded(regular, threads, &self.cancel, move |file| worker.sync_file(file)).await?;
        info!("Catchup data files are synchronized: {}", job.progress.summary());

        let stop = self.source.stop_backup(CATCHUP_LABEL, &start)?;
        info!("Catchup STOP LSN: {}", stop.stop_lsn);

        if !dry_run {
            self.copy_wal(dest, &start, stop.stop_lsn, &history, system_id).await?;
            let src = self.source.pgdata().join(PG_CONTROL_PATH);
            let dst = dest.join(PG_CONTROL_PATH);
            std::fs::copy(&src, &dst).map_err(|e| EngineError::file("copy", &src, e))?;
            for (name, content) in [
                ("backup_label", Some(&stop.backup_label)),
                ("tablespace_map", stop.tablespace_map.as_ref()),
            ] {
                let Some(content) = content else { continue };
                let path = dest.join(name);
                std::fs::write(&path, content).map_err(|e| EngineError::file("write", &path, e))?;
            }
            if self.source.read_ptrack_map()?.is_some() {
                let watermark = self.source.ptrack_reset()?;
                debug!("Ptrack map reset at {}", watermark);
            }
        }

        let summary = CatchupSummary {
            start_lsn: start.start_lsn,
            stop_lsn: stop.stop_lsn,
            tli: start.tli,
            files_copied: written.iter().filter(|w| **w > 0).count(),
            bytes_copied: written.iter().sum(),
            removed,
        };
        info!(
            "Catchup completed: {} files {}, {} removed",
            summary.files_copied,
            if dry_run { "would be copied" } else { "copied" },
            summary.removed.len()
        );
        Ok(summary)
    }

    async fn select_tracker(
        &self,
        mode: BackupMode,
        dest: Option<DestinationState>,
        start: &BackupStartInfo,
        history: &TimelineHistory,
        system_id: u64,
        threads: usize,
    ) -> Result<ChangeTracker> {
        let Some(dest) = dest else {
            return Ok(ChangeTracker::Full);
        };
        match mode {
            BackupMode::Full => Ok(ChangeTracker::Full),
            BackupMode::Delta => Ok(ChangeTracker::Delta { since: dest.redo }),
            BackupMode::Ptrack => {
                let map = self.source.read_ptrack_map()?.ok_or_else(|| {
                    EngineError::Precondition(
                        "Ptrack is disabled in the source cluster, PTRACK catchup is impossible"
                            .to_string(),
                    )
                })?;
                let seg_size = self.source.wal_segment_size();
                let wal = WalContext {
                    source: Arc::new(WalArchive::new(self.source.wal_dir(), seg_size, system_id)),
                    history: Arc::new(history.clone()),
                    system_id,
                    seg_size,
                };
                // an older watermark only flags more pages than needed
                let window = PtrackWindow {
                    lower: Lsn::INVALID,
                    lower_what: "start of tracking",
                    upper: start.start_lsn,
                    wal_from: dest.redo,
                };
                ptrack_tracker(&map, window, &wal, threads, &self.cancel).await
            }
            BackupMode::Page => Err(EngineError::Unsupported(
                "PAGE mode is not supported by catchup".to_string(),
            )),
        }
    }

    fn create_layout(
        &self,
        dest: &Path,
        files: &[FileInfo],
        links: &HashMap<String, PathBuf>,
        options: &CatchupOptions,
    ) -> Result<()> {
        std::fs::create_dir_all(dest).map_err(|e| EngineError::file("create", dest, e))?;
        if let (Some(waldir), BackupMode::Full) = (&options.waldir, options.mode) {
            std::fs::create_dir_all(waldir).map_err(|e| EngineError::file("create", waldir, e))?;
            make_symlink(waldir, &dest.join("pg_wal"))?;
            info!("WAL directory is relocated to \"{}\"", waldir.display());
        }

        let mut layout: Vec<&FileInfo> = files.iter().filter(|f| !f.is_file()).collect();
        layout.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        for entry in layout {
            let path = dest.join(&entry.relative_path);
            match (&entry.kind, links.get(&entry.relative_path)) {
                (FileKind::Link(_), Some(location)) => {
                    std::fs::create_dir_all(location)
                        .map_err(|e| EngineError::file("create", location, e))?;
                    if std::fs::symlink_metadata(&path).is_err() {
                        make_symlink(location, &path)?;
                    }
                }
                _ => {
                    std::fs::create_dir_all(&path).map_err(|e| EngineError::file("create", &path, e))?;
                }
            }
        }
        Ok(())
    }

    /// Copy the segments covering `[start, stop)` and the current history
    /// file into the destination's `pg_wal`.
    async fn copy_wal(
        &self,
        dest: &Path,
        start: &BackupStartInfo,
        stop: Lsn,
        history: &TimelineHistory,
        system_id: u64,
    ) -> Result<()> {
        let seg_size = self.source.wal_segment_size();
        let src_dir = self.source.wal_dir();
        let dst_dir = dest.join("pg_wal");
        std::fs::create_dir_all(&dst_dir).map_err(|e| EngineError::file("create", &dst_dir, e))?;

        if stop > start.start_lsn {
            let first = start.start_lsn.segment_number(seg_size);
            let last = Lsn(stop.0 - 1).segment_number(seg_size);
            let stop_segment = SegmentName::new(history.tli_for_lsn(Lsn(stop.0 - 1)), last, seg_size);
            debug!("Wait for WAL segment {} in the source pg_wal", stop_segment);
            WalArchive::new(&src_dir, seg_size, system_id)
                .wait_for_segment(&stop_segment, self.config.stream_timeout(), &self.cancel)
                .await?;
            for segno in first..=last {
                let begin = Lsn(segno * seg_size as u64);
                let name = SegmentName::new(history.tli_for_lsn(begin.max(start.start_lsn)), segno, seg_size);
                let src = src_dir.join(name.to_string());
                if !src.exists() {
                    return Err(WalError::SegmentMissing {
                        name: name.to_string(),
                    }
                    .into());
                }
                std::fs::copy(&src, dst_dir.join(name.to_string()))
                    .map_err(|e| EngineError::file("copy", &src, e))?;
            }
            debug!("Copied WAL segments {}..={} into \"{}\"", first, last, dst_dir.display());
        }
        if history.current() > 1 {
            let name = history_file_name(history.current());
            let src = src_dir.join(&name);
            if src.exists() {
                std::fs::copy(&src, dst_dir.join(&name)).map_err(|e| EngineError::file("copy", &src, e))?;
            }
        }
        Ok(())
    }
}

/// Delete destination entries the source no longer has, deepest first.
fn remove_stale(
    dest: &Path,
    source_files: &[FileInfo],
    dest_files: &[FileInfo],
    dry_run: bool,
) -> Result<Vec<String>> {
    let wanted: HashSet<&str> = source_files.iter().map(|f| f.relative_path.as_str()).collect();
    let mut stale: Vec<&FileInfo> = dest_files
        .iter()
        .filter(|f| !wanted.contains(f.relative_path.as_str()) && f.relative_path != PG_CONTROL_PATH)
        .collect();
    stale.sort_by(|a, b| b.relative_path.cmp(&a.relative_path));

    let mut removed = Vec::with_capacity(stale.len());
    for entry in stale {
        let path = dest.join(&entry.relative_path);
        if dry_run {
            info!("Would remove \"{}\"", entry.relative_path);
        } else {
            let result = match entry.kind {
                FileKind::Dir => std::fs::remove_dir_all(&path),
                FileKind::File | FileKind::Link(_) => std::fs::remove_file(&path),
            };
            match result {
                Ok(()) => debug!("Removed \"{}\"", entry.relative_path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(EngineError::file("remove", &path, e)),
            }
        }
        removed.push(entry.relative_path.clone());
    }
    if !removed.is_empty() {
        info!("{} destination files are not in the source", removed.len());
    }
    Ok(removed)
}

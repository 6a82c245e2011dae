//! Fold a chain into one FULL backup that keeps the newest backup's id.
//!
//! The merged copy is built in `<id>.merge` next to the chain while every
//! member is MERGING, then swapped into place through `<id>.retired`; only
//! after that are the older members removed. A merge that dies midway is
//! settled by [`InstanceCatalog::fail_abandoned`].

use crate::catalog::manifest::{read_headers, read_manifest, FileEntry, ManifestWriter, DATABASE_DIR};
use crate::catalog::{control, Backup, BackupId, BackupMode, BackupStatus, CatalogContext, InstanceCatalog};
use crate::chain;
use crate::config::CompressAlg;
use crate::fs::pagefile::{read_page, PageEntry, PageWriter};
use crate::fs::walker::FileKind;
use crate::utils::errors::{EngineError, Result};
use crate::utils::pool::run_bounded;
use crate::validate;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

struct Member {
    dir: PathBuf,
    files: HashMap<String, FileEntry>,
}

struct MergeJob {
    /// Newest first.
    members: Vec<Member>,
    data_dir: PathBuf,
    level: Option<i32>,
    manifest: Arc<ManifestWriter>,
}

impl MergeJob {
    fn merge_file(&self, wanted: FileEntry) -> Result<FileEntry> {
        let dst = self.data_dir.join(&wanted.path);
        let entry = if wanted.is_datafile {
            self.merge_datafile(&wanted, &dst)?
        } else {
            self.merge_plain(&wanted, &dst)?
        };
        self.manifest.add(&entry)?;
        Ok(entry)
    }

    fn merge_plain(&self, wanted: &FileEntry, dst: &Path) -> Result<FileEntry> {
        for member in &self.members {
            let Some(entry) = member.files.get(&wanted.path) else {
                break;
            };
            if !entry.has_stored_copy() {
                continue;
            }
            let src = entry.stored_path(&member.dir);
            std::fs::copy(&src, dst).map_err(|e| EngineError::file("copy", &src, e))?;
            let mut merged = entry.clone();
            merged.mode = wanted.mode;
            merged.mtime = wanted.mtime;
            return Ok(merged);
        }
        Err(EngineError::Chain(format!(
            "File \"{}\" has no stored copy in the chain",
            wanted.path
        )))
    }

    fn merge_datafile(&self, wanted: &FileEntry, dst: &Path) -> Result<FileEntry> {
        let n_blocks = wanted.n_blocks.unwrap_or(0);
        let mut newest: BTreeMap<u32, (usize, PageEntry)> = BTreeMap::new();
        for (idx, member) in self.members.iter().enumerate() {
            let Some(entry) = member.files.get(&wanted.path).filter(|e| e.is_datafile) else {
                break;
            };
            for header in read_headers(&member.dir, entry)? {
                if header.block < n_blocks {
                    newest.entry(header.block).or_insert((idx, header));
                }
            }
        }

        let mut sources: HashMap<usize, File> = HashMap::new();
        let out = File::create(dst).map_err(|e| EngineError::file("create", dst, e))?;
        let mut writer = PageWriter::new(BufWriter::new(out), self.level);
        for (block, (idx, header)) in &newest {
            let member = &self.members[*idx];
            let file = match sources.entry(*idx) {
                std::collections::hash_map::Entry::Occupied(slot) => slot.into_mut(),
                std::collections::hash_map::Entry::Vacant(slot) => {
                    let stored = member.dir.join(DATABASE_DIR).join(&wanted.path);
                    let file = File::open(&stored).map_err(|e| EngineError::file("open", &stored, e))?;
                    slot.insert(file)
                }
            };
            let page = read_page(file, header).map_err(|e| {
                EngineError::Corruption(format!("Cannot merge \"{}\": {}", wanted.path, e))
            })?;
            writer.write_page(*block, &page)?;
        }
        let stream = writer.finish()?;
        let (hdr_off, hdr_crc) = self.manifest.append_headers(&stream.entries)?;

        let mut merged = wanted.clone();
        merged.crc = stream.content_crc;
        merged.write_size = stream.stored_bytes as i64;
        merged.hdr_off = hdr_off;
        merged.n_headers = stream.entries.len() as u32;
        merged.hdr_crc = hdr_crc;
        merged.compressed = self.level.is_some();
        Ok(merged)
    }
}

/// Build the merged copy of `chain` in `work_dir`.
async fn build_merged(
    ctx: &CatalogContext,
    catalog: &InstanceCatalog,
    chain: &[Backup],
    target: &Backup,
    work_dir: &Path,
) -> Result<Backup> {
    if work_dir.exists() {
        warn!("Removing leftover merge directory \"{}\"", work_dir.display());
        std::fs::remove_dir_all(work_dir).map_err(|e| EngineError::file("remove", work_dir, e))?;
    }
    let data_dir = work_dir.join(DATABASE_DIR);
    std::fs::create_dir_all(&data_dir).map_err(|e| EngineError::file("create", &data_dir, e))?;

    let wanted = read_manifest(&catalog.backup_dir(target.id))?;
    let mut members = Vec::with_capacity(chain.len());
    for backup in chain.iter().rev() {
        let dir = catalog.backup_dir(backup.id);
        let files = read_manifest(&dir)?
            .into_iter()
            .map(|e| (e.path.clone(), e))
            .collect();
        members.push(Member { dir, files });
    }

    let manifest = Arc::new(ManifestWriter::create(work_dir)?);
    let mut files = Vec::new();
    for entry in wanted {
        if entry.kind == FileKind::File {
            files.push(entry);
            continue;
        }
        let path = data_dir.join(&entry.path);
        std::fs::create_dir_all(&path).map_err(|e| EngineError::file("create", &path, e))?;
        manifest.add(&entry)?;
    }
    let job = Arc::new(MergeJob {
        members,
        data_dir,
        level: (target.compress_alg == CompressAlg::Zstd).then_some(target.compress_level),
        manifest: Arc::clone(&manifest),
    });
    let worker = Arc::clone(&job);
    let merged_files = run_bounded(files, ctx.config.performance.threads, &ctx.cancel, move |entry| {
        worker.merge_file(entry)
    })
    .await?;
    drop(job);
    let manifest = Arc::try_unwrap(manifest)
        .map_err(|_| EngineError::Worker("manifest writer is still in use".to_string()))?;
    let summary = manifest.finish()?;

    let mut merged = target.clone();
    merged.mode = BackupMode::Full;
    merged.parent_id = None;
    merged.status = BackupStatus::Ok;
    merged.content_crc = Some(summary.crc);
    merged.data_bytes = merged_files.iter().map(|e| e.write_size.max(0) as u64).sum();
    merged.uncompressed_bytes = merged_files.iter().map(|e| e.size).sum();
    control::write(work_dir, &merged)?;
    Ok(merged)
}

/// Merge the chain ending at `id` into a FULL backup with the same id.
pub async fn merge(ctx: &CatalogContext, instance: &str, id: BackupId) -> Result<Backup> {
    let mut catalog = ctx.open_instance(instance)?;
    let lock = catalog.lock("merge")?;
    catalog.fail_abandoned(&lock)?;

    let target = catalog.get(id)?.clone();
    if target.mode == BackupMode::Full {
        info!("Backup {} is full backup, nothing to merge", id);
        return Ok(target);
    }
    validate::validate_backup(ctx, &mut catalog, id).await?;

    let chain: Vec<Backup> = chain::restore_chain(&catalog, id)?.into_iter().cloned().collect();
    for member in chain.iter().filter(|b| b.id != id) {
        for child in catalog.children(member.id) {
            if !chain.iter().any(|b| b.id == child) {
                return Err(EngineError::Chain(format!(
                    "Cannot merge backup {}: backup {} has child {} outside of the merged chain",
                    id, member.id, child
                )));
            }
        }
    }
    info!(
        "Merging backup {} with its {} ancestors, full backup {}",
        id,
        chain.len() - 1,
        chain[0].id
    );
    for member in &chain {
        catalog.set_status(member.id, BackupStatus::Merging)?;
    }

    let work_dir = catalog.merge_dir(id);
    let merged = match build_merged(ctx, &catalog, &chain, &target, &work_dir).await {
        Ok(merged) => merged,
        Err(e) => {
            warn!("Merge of backup {} failed, leaving the chain as it was", id);
            for member in &chain {
                catalog.set_status(member.id, member.status)?;
            }
            if let Err(cleanup) = std::fs::remove_dir_all(&work_dir) {
                warn!("Cannot remove \"{}\": {}", work_dir.display(), cleanup);
            }
            return Err(e);
        }
    };

    // from the first rename until the retired copy is gone, the next
    // locked operation completes this merge
    let target_dir = catalog.backup_dir(id);
    let retired = catalog.retired_dir(id);
    std::fs::rename(&target_dir, &retired).map_err(|e| EngineError::file("rename", &target_dir, e))?;
    std::fs::rename(&work_dir, &target_dir).map_err(|e| EngineError::file("rename", &work_dir, e))?;
    catalog.save(&merged)?;

    for member in chain.iter().rev().filter(|b| b.id != id) {
        catalog.delete(member.id)?;
    }
    std::fs::remove_dir_all(&retired).map_err(|e| EngineError::file("remove", &retired, e))?;
    info!("Merge of backup {} completed", id);
    drop(lock);
    Ok(merged)
}

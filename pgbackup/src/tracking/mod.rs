//! Change tracking: which pages of a relation file changed since a parent.
//!
//! Every strategy answers through [`ChangeTracker::compute_changed_pages`].
//! Shared rules: a file the parent never had is copied whole, blocks past
//! the parent's length are always included, and nothing past the file's
//! current length is ever selected.

pub mod delta;
pub mod page;
pub mod pagemap;
pub mod ptrack;

pub use pagemap::{PageBitmap, PageMap};
pub use ptrack::PtrackMap;

use crate::pg::{Lsn, RelFileKey};
use crate::utils::errors::Result;
use crate::wal::{SegmentSource, TimelineHistory};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything needed to read WAL for a cluster.
#[derive(Clone)]
pub struct WalContext {
    pub source: Arc<dyn SegmentSource>,
    pub history: Arc<TimelineHistory>,
    pub system_id: u64,
    pub seg_size: u32,
}

/// What the parent knew about a relation file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentFile {
    pub n_blocks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageSelection {
    All,
    Blocks(PageBitmap),
}

impl PageSelection {
    pub fn includes(&self, blk: u32) -> bool {
        match self {
            PageSelection::All => true,
            PageSelection::Blocks(bitmap) => bitmap.contains(blk),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, PageSelection::All)
    }
}

/// Change evidence selected when a backup or catchup starts.
#[derive(Debug, Clone)]
pub enum ChangeTracker {
    Full,
    /// Block references decoded from WAL.
    Page(PageMap),
    /// Pages stamped at or after `since`.
    Delta { since: Lsn },
    /// Extension bitmap, plus WAL block references up to its watermark.
    Ptrack(PageMap),
}

impl ChangeTracker {
    pub fn is_full(&self) -> bool {
        matches!(self, ChangeTracker::Full)
    }

    /// Pages of one relation segment file that must be copied.
    pub fn compute_changed_pages(
        &self,
        key: &RelFileKey,
        path: &Path,
        n_blocks: u32,
        parent: Option<ParentFile>,
    ) -> Result<PageSelection> {
        let Some(parent) = parent else {
            return Ok(PageSelection::All);
        };
        let mut changed = match self {
            ChangeTracker::Full => return Ok(PageSelection::All),
            ChangeTracker::Page(map) | ChangeTracker::Ptrack(map) => {
                map.get(key).cloned().unwrap_or_default()
            }
            ChangeTracker::Delta { since } => {
                delta::changed_since(path, n_blocks.min(parent.n_blocks), *since)?
            }
        };
        changed.set_range(parent.n_blocks, n_blocks);
        changed.truncate(n_blocks);
        Ok(PageSelection::Blocks(changed))
    }
}

/// PAGE tracker over WAL in `[from, until)`.
pub async fn page_tracker(
    wal: &WalContext,
    from: Lsn,
    until: Lsn,
    threads: usize,
    cancel: &CancellationToken,
) -> Result<ChangeTracker> {
    let map = page::build_page_map(wal, from, until, threads, cancel).await?;
    Ok(ChangeTracker::Page(map))
}

/// Bounds a PTRACK map must respect.
pub struct PtrackWindow<'a> {
    /// Watermark lower bound and what it is, for the error message.
    pub lower: Lsn,
    pub lower_what: &'a str,
    /// Start of the copy being made.
    pub upper: Lsn,
    /// Pages changed from here up to the watermark are taken from WAL.
    pub wal_from: Lsn,
}

/// PTRACK tracker; fails when the watermark is outside the window.
pub async fn ptrack_tracker(
    map: &PtrackMap,
    window: PtrackWindow<'_>,
    wal: &WalContext,
    threads: usize,
    cancel: &CancellationToken,
) -> Result<ChangeTracker> {
    map.check_watermark(window.lower, window.lower_what, window.upper)?;
    let mut pages = map.to_page_map();
    info!(
        "Ptrack map with watermark {} flags {} pages",
        map.watermark,
        pages.total_pages()
    );
    if map.watermark > window.wal_from {
        let gap = page::build_page_map(wal, window.wal_from, map.watermark, threads, cancel).await?;
        pages.merge(gap);
    }
    Ok(ChangeTracker::Ptrack(pages))
}

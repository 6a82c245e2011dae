//! PAGE mode: changed pages from WAL block references.
//!
//! The LSN range is partitioned by segment. Each worker decodes the records
//! that begin inside its segment and merges its local map into a shared
//! accumulator.

use super::pagemap::PageMap;
use super::WalContext;
use crate::pg::Lsn;
use crate::utils::errors::{EngineError, Result};
use crate::utils::pool::run_bounded;
use crate::wal::WalReader;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Build the map of pages touched by records in `[from, until)`.
pub async fn build_page_map(
    wal: &WalContext,
    from: Lsn,
    until: Lsn,
    threads: usize,
    cancel: &CancellationToken,
) -> Result<PageMap> {
    if from >= until {
        return Ok(PageMap::new());
    }
    let seg_size = wal.seg_size;
    let first = from.segment_number(seg_size);
    let last = Lsn(until.0 - 1).segment_number(seg_size);
    info!(
        "Extracting pagemap of changed blocks from {} to {} ({} segments)",
        from,
        until,
        last - first + 1
    );

    let accumulator = Arc::new(Mutex::new(PageMap::new()));
    let segnos: Vec<u64> = (first..=last).collect();
    let shared = Arc::clone(&accumulator);
    let ctx = wal.clone();
    let token = cancel.clone();
    run_bounded(segnos, threads, cancel, move |segno| {
        let local = scan_segment(&ctx, segno, from, until, &token)?;
        debug!("Segment {} touched {} pages", segno, local.total_pages());
        let mut acc = shared
            .lock()
            .map_err(|_| EngineError::Worker("page map accumulator poisoned".to_string()))?;
        acc.merge(local);
        Ok(())
    })
    .await?;

    let mut acc = accumulator
        .lock()
        .map_err(|_| EngineError::Worker("page map accumulator poisoned".to_string()))?;
    let map = std::mem::take(&mut *acc);
    info!(
        "Pagemap compiled: {} pages in {} files",
        map.total_pages(),
        map.len()
    );
    Ok(map)
}

fn scan_segment(
    wal: &WalContext,
    segno: u64,
    from: Lsn,
    until: Lsn,
    cancel: &CancellationToken,
) -> Result<PageMap> {
    let mut reader = WalReader::new(
        wal.source.as_ref(),
        wal.history.as_ref(),
        wal.seg_size,
        wal.system_id,
    );
    let seg_start = Lsn(segno * wal.seg_size as u64);
    let seg_end = Lsn(seg_start.0 + wal.seg_size as u64);
    let mut map = PageMap::new();

    let start = if from >= seg_start {
        from
    } else {
        match reader.first_record_in_segment(segno)? {
            Some(pos) => pos,
            None => return Ok(map),
        }
    };
    let stop = until.min(seg_end);
    if start >= stop {
        return Ok(map);
    }

    reader.for_each_record(start, stop, |record| {
        if cancel.is_cancelled() {
            return Err(EngineError::interrupted());
        }
        map.add_record(record);
        Ok(true)
    })?;
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::{RelFileKey, RelFileNode};
    use crate::testutil::WalBuilder;
    use crate::utils::errors::WalError;
    use crate::wal::{SegmentName, TimelineHistory};

    const SEG: u32 = 1024 * 1024;
    const SYSID: u64 = 99;

    fn node(rel: u32) -> RelFileNode {
        RelFileNode { spc: 1663, db: 5, rel }
    }

    fn context(wal: WalBuilder) -> WalContext {
        WalContext {
            source: Arc::new(wal.into_segments()),
            history: Arc::new(TimelineHistory::single(1)),
            system_id: SYSID,
            seg_size: SEG,
        }
    }

    #[tokio::test]
    async fn test_parallel_scan_matches_sequential_content() {
        let mut wal = WalBuilder::new(SYSID, 1, SEG, Lsn(SEG as u64));
        let from = wal.insert(&[(node(1), 0, 0)], &[]);
        let mut expected = vec![];
        for i in 0..600u32 {
            wal.insert(&[(node(10 + i % 3), 0, i)], &vec![7; 4000]);
            expected.push((10 + i % 3, i));
        }
        // visibility-map fork is ignored
        wal.insert(&[(node(10), 2, 999)], &[]);
        let until = wal.position();
        assert!(until.segment_number(SEG) >= 3);

        let ctx = context(wal);
        let cancel = CancellationToken::new();
        let map = build_page_map(&ctx, from, until, 4, &cancel).await.unwrap();

        assert_eq!(map.total_pages(), 601);
        for (rel, blk) in expected {
            let bitmap = map.get(&RelFileKey { node: node(rel), segno: 0 }).unwrap();
            assert!(bitmap.contains(blk));
        }
        let bitmap = map.get(&RelFileKey { node: node(10), segno: 0 }).unwrap();
        assert!(!bitmap.contains(999));
    }

    #[tokio::test]
    async fn test_range_excludes_records_before_start() {
        let mut wal = WalBuilder::new(SYSID, 1, SEG, Lsn(SEG as u64));
        wal.insert(&[(node(1), 0, 1)], &[]);
        let from = wal.insert(&[(node(1), 0, 2)], &[]);
        let until = wal.position();
        let ctx = context(wal);
        let map = build_page_map(&ctx, from, until, 2, &CancellationToken::new())
            .await
            .unwrap();
        let bitmap = map.get(&RelFileKey { node: node(1), segno: 0 }).unwrap();
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn test_missing_segment_fails_loudly() {
        let mut wal = WalBuilder::new(SYSID, 1, SEG, Lsn(SEG as u64));
        let from = wal.insert(&[(node(1), 0, 1)], &[]);
        while wal.position().segment_number(SEG) < 3 {
            wal.insert(&[(node(1), 0, 2)], &vec![0; 6000]);
        }
        let until = wal.position();
        let mut segments = wal.into_segments();
        segments.remove(&SegmentName::new(1, 2, SEG));
        let ctx = WalContext {
            source: Arc::new(segments),
            history: Arc::new(TimelineHistory::single(1)),
            system_id: SYSID,
            seg_size: SEG,
        };
        let err = build_page_map(&ctx, from, until, 2, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Wal(WalError::SegmentMissing { .. })));
        assert!(err.to_string().contains("000000010000000000000002"));
    }
}

//! Page-aware WAL record reader.
//!
//! Records are read across page and segment boundaries. Segments are
//! chosen per timeline history, newest timeline first, and every segment
//! is checked for size, page magic, page address and system identifier
//! before any record in it is trusted.

use super::record::{decode_record, DecodedRecord, WalPageHeader, XLogRecordHeader, MAXALIGN};
use super::segment::{SegmentName, XLOG_BLCKSZ};
use super::timeline::TimelineHistory;
use crate::pg::Lsn;
use crate::utils::errors::{EngineError, Result, WalError};
use std::sync::Arc;

/// Where segment images come from (archive, `pg_wal`, test fixtures).
pub trait SegmentSource: Send + Sync {
    /// Load the full image of a segment, `None` when it is absent.
    fn load_segment(&self, name: &SegmentName) -> Result<Option<Vec<u8>>>;
}

struct LoadedSegment {
    segno: u64,
    name: SegmentName,
    data: Arc<Vec<u8>>,
}

pub struct WalReader<'a> {
    source: &'a dyn SegmentSource,
    history: &'a TimelineHistory,
    seg_size: u32,
    system_id: u64,
    current: Option<LoadedSegment>,
    magic: u16,
    prev_record: Option<Lsn>,
}

impl<'a> WalReader<'a> {
    pub fn new(
        source: &'a dyn SegmentSource,
        history: &'a TimelineHistory,
        seg_size: u32,
        system_id: u64,
    ) -> Self {
        Self {
            source,
            history,
            seg_size,
            system_id,
            current: None,
            magic: 0,
            prev_record: None,
        }
    }

    pub fn seg_size(&self) -> u32 {
        self.seg_size
    }

    /// Load and verify the segment holding `segno`.
    pub fn segment(&mut self, segno: u64) -> Result<(SegmentName, Arc<Vec<u8>>)> {
        if let Some(loaded) = &self.current {
            if loaded.segno == segno {
                return Ok((loaded.name, Arc::clone(&loaded.data)));
            }
        }

        let mut candidates = self.history.segment_candidates(segno, self.seg_size);
        if candidates.is_empty() {
            candidates.push(
                self.history
                    .tli_for_lsn(Lsn(segno * self.seg_size as u64)),
            );
        }

        for tli in &candidates {
            let name = SegmentName::new(*tli, segno, self.seg_size);
            if let Some(data) = self.source.load_segment(&name)? {
                self.verify_segment(&name, &data)?;
                let data = Arc::new(data);
                self.current = Some(LoadedSegment {
                    segno,
                    name,
                    data: Arc::clone(&data),
                });
                return Ok((name, data));
            }
        }

        Err(WalError::SegmentMissing {
            name: SegmentName::new(candidates[0], segno, self.seg_size).to_string(),
        }
        .into())
    }

    fn verify_segment(&mut self, name: &SegmentName, data: &[u8]) -> Result<()> {
        let corrupt = |reason: String| WalError::SegmentCorrupt {
            name: name.to_string(),
            reason,
        };
        if data.len() != self.seg_size as usize {
            return Err(corrupt(format!(
                "invalid size {}, expected {}",
                data.len(),
                self.seg_size
            ))
            .into());
        }
        let header = WalPageHeader::parse(data)
            .ok_or_else(|| corrupt("cannot read first page header".to_string()))?;
        if !header.has_known_magic() {
            return Err(corrupt(format!("invalid magic number {:04X}", header.magic)).into());
        }
        let long = header
            .long
            .ok_or_else(|| corrupt("first page lacks a long header".to_string()))?;
        if long.system_id != self.system_id {
            return Err(WalError::ForeignSystem {
                name: name.to_string(),
                expected: self.system_id,
                found: long.system_id,
            }
            .into());
        }
        if long.seg_size != self.seg_size || long.xlog_blcksz as usize != XLOG_BLCKSZ {
            return Err(corrupt(format!(
                "segment size {} / page size {} do not match the cluster",
                long.seg_size, long.xlog_blcksz
            ))
            .into());
        }
        if header.pageaddr != name.start_lsn() {
            return Err(corrupt(format!(
                "unexpected pageaddr {} at offset 0",
                header.pageaddr
            ))
            .into());
        }
        self.magic = header.magic;
        Ok(())
    }

    /// Verified header of the WAL page starting at `page_lsn`.
    fn page_header(&mut self, page_lsn: Lsn) -> Result<WalPageHeader> {
        let (name, data) = self.segment(page_lsn.segment_number(self.seg_size))?;
        let offset = page_lsn.segment_offset(self.seg_size) as usize;
        let corrupt = |reason: String| WalError::SegmentCorrupt {
            name: name.to_string(),
            reason,
        };
        let header = WalPageHeader::parse(&data[offset..offset + XLOG_BLCKSZ])
            .ok_or_else(|| corrupt(format!("cannot read page header at offset {}", offset)))?;
        if header.magic != self.magic {
            return Err(corrupt(format!(
                "invalid magic number {:04X} at offset {}",
                header.magic, offset
            ))
            .into());
        }
        if header.pageaddr != page_lsn {
            return Err(corrupt(format!(
                "unexpected pageaddr {} at offset {}",
                header.pageaddr, offset
            ))
            .into());
        }
        if header.tli > name.tli {
            return Err(corrupt(format!(
                "out-of-sequence timeline ID {} at offset {}",
                header.tli, offset
            ))
            .into());
        }
        Ok(header)
    }

    /// Copy bytes `[pos, pos + len)` that lie within one page.
    fn copy_bytes(&mut self, pos: Lsn, len: usize, out: &mut Vec<u8>) -> Result<()> {
        let (_, data) = self.segment(pos.segment_number(self.seg_size))?;
        let offset = pos.segment_offset(self.seg_size) as usize;
        out.extend_from_slice(&data[offset..offset + len]);
        Ok(())
    }

    /// Skip the page header when `pos` sits on a page boundary.
    fn skip_page_header(&mut self, pos: Lsn) -> Result<Lsn> {
        if pos.0 % XLOG_BLCKSZ as u64 == 0 {
            let header = self.page_header(pos)?;
            Ok(Lsn(pos.0 + header.size() as u64))
        } else {
            Ok(pos)
        }
    }

    /// Read the record starting at (or right after the page header at)
    /// `start`. `None` marks the end of written WAL.
    pub fn read_record(&mut self, start: Lsn) -> Result<Option<DecodedRecord>> {
        let lsn = self.skip_page_header(start)?;
        let mut head = Vec::with_capacity(4);
        self.copy_bytes(lsn, 4, &mut head)?;
        let tot_len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        if tot_len == 0 {
            return Ok(None);
        }
        XLogRecordHeader::check_length(tot_len)
            .map_err(|reason| WalError::RecordInvalid { lsn, reason })?;

        let mut buf = Vec::with_capacity(tot_len as usize);
        let mut remaining = tot_len as usize;
        let mut pos = lsn;
        loop {
            let page_end = (pos.0 / XLOG_BLCKSZ as u64 + 1) * XLOG_BLCKSZ as u64;
            let take = remaining.min((page_end - pos.0) as usize);
            self.copy_bytes(pos, take, &mut buf)?;
            remaining -= take;
            pos = Lsn(pos.0 + take as u64);
            if remaining == 0 {
                break;
            }

            let header = self.page_header(Lsn(page_end))?;
            if !header.is_contrecord() {
                return Err(WalError::RecordInvalid {
                    lsn,
                    reason: format!("there is no contrecord flag at {}", Lsn(page_end)),
                }
                .into());
            }
            if header.rem_len as usize != remaining {
                return Err(WalError::RecordInvalid {
                    lsn,
                    reason: format!(
                        "invalid contrecord length {} (expected {}) at {}",
                        header.rem_len,
                        remaining,
                        Lsn(page_end)
                    ),
                }
                .into());
            }
            pos = Lsn(page_end + header.size() as u64);
        }

        let record = decode_record(lsn, pos, &buf, self.magic)
            .map_err(|reason| WalError::RecordInvalid { lsn, reason })?;
        if let Some(prev) = self.prev_record {
            if record.header.prev != prev {
                return Err(WalError::RecordInvalid {
                    lsn,
                    reason: format!(
                        "record with incorrect prev-link {} (expected {})",
                        record.header.prev, prev
                    ),
                }
                .into());
            }
        }
        self.prev_record = Some(lsn);
        Ok(Some(record))
    }

    /// Position where the record following `record` starts.
    pub fn next_record_pos(&self, record: &DecodedRecord) -> Lsn {
        if record.is_xlog_switch() {
            let seg = self.seg_size as u64;
            let end = record.end.0;
            if end % seg == 0 {
                record.end
            } else {
                Lsn((end / seg + 1) * seg)
            }
        } else {
            record.end.align_up(MAXALIGN)
        }
    }

    /// First record beginning inside segment `segno`, if any.
    pub fn first_record_in_segment(&mut self, segno: u64) -> Result<Option<Lsn>> {
        let seg_start = Lsn(segno * self.seg_size as u64);
        let seg_end = seg_start.0 + self.seg_size as u64;
        let header = self.page_header(seg_start)?;
        let mut pos = seg_start.0 + header.size() as u64;
        let mut rem = if header.is_contrecord() {
            header.rem_len as u64
        } else {
            0
        };

        while rem > 0 {
            let page_end = (pos / XLOG_BLCKSZ as u64 + 1) * XLOG_BLCKSZ as u64;
            let avail = page_end - pos;
            if rem <= avail {
                pos += rem;
                rem = 0;
            } else {
                rem -= avail;
                if page_end >= seg_end {
                    return Ok(None);
                }
                let next = self.page_header(Lsn(page_end))?;
                pos = page_end + next.size() as u64;
            }
        }

        let pos = Lsn(pos).align_up(MAXALIGN);
        if pos.0 >= seg_end {
            return Ok(None);
        }
        Ok(Some(pos))
    }

    /// Visit records whose start lies in `[from, until)`.
    ///
    /// The visitor returns `false` to stop early. Running out of written WAL
    /// before `until` is reported as a record error at that position.
    pub fn for_each_record<F>(&mut self, from: Lsn, until: Lsn, mut visit: F) -> Result<Lsn>
    where
        F: FnMut(&DecodedRecord) -> Result<bool>,
    {
        let mut pos = from;
        while pos < until {
            let record = match self.read_record(pos)? {
                Some(record) => record,
                None => {
                    return Err(WalError::RecordInvalid {
                        lsn: pos,
                        reason: format!("WAL ends before {}", until),
                    }
                    .into())
                }
            };
            if record.lsn >= until {
                break;
            }
            if !visit(&record)? {
                return Ok(record.end);
            }
            pos = self.next_record_pos(&record);
        }
        Ok(pos)
    }

    /// True when nothing was written at `pos` yet: its segment is absent or
    /// it starts a zeroed page.
    fn is_unwritten(&mut self, pos: Lsn) -> Result<bool> {
        let data = match self.segment(pos.segment_number(self.seg_size)) {
            Ok((_, data)) => data,
            Err(EngineError::Wal(WalError::SegmentMissing { .. })) => return Ok(true),
            Err(e) => return Err(e),
        };
        if pos.0 % XLOG_BLCKSZ as u64 == 0 {
            let offset = pos.segment_offset(self.seg_size) as usize;
            return Ok(data[offset] == 0 && data[offset + 1] == 0);
        }
        Ok(false)
    }

    /// Visit every record from `from` to the end of written WAL and return
    /// the end of the last one (`from` when there is none).
    pub fn scan_to_end<F>(&mut self, from: Lsn, mut visit: F) -> Result<Lsn>
    where
        F: FnMut(&DecodedRecord),
    {
        let mut pos = from;
        let mut end = from;
        while !self.is_unwritten(pos)? {
            let Some(record) = self.read_record(pos)? else {
                break;
            };
            visit(&record);
            end = record.end;
            pos = self.next_record_pos(&record);
        }
        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::RelFileNode;
    use crate::testutil::{MemorySegments, WalBuilder};

    const SEG: u32 = 1024 * 1024;
    const SYSID: u64 = 7_000_000_000_000_000_001;

    fn node(rel: u32) -> RelFileNode {
        RelFileNode { spc: 1663, db: 5, rel }
    }

    #[test]
    fn test_reads_records_across_pages() {
        let mut wal = WalBuilder::new(SYSID, 1, SEG, Lsn(SEG as u64));
        let first = wal.insert(&[(node(1), 0, 1)], &[]);
        // big enough to straddle at least two page boundaries
        let big = wal.insert(&[(node(2), 0, 7)], &vec![0xAB; 20_000]);
        let last = wal.insert(&[(node(3), 0, 9)], &[]);
        let source = wal.into_segments();

        let history = TimelineHistory::single(1);
        let mut reader = WalReader::new(&source, &history, SEG, SYSID);
        let mut seen = Vec::new();
        reader
            .for_each_record(first, Lsn(last.0 + 1), |rec| {
                seen.push((rec.lsn, rec.blocks[0].node.rel, rec.main_data.len()));
                Ok(true)
            })
            .unwrap();
        assert_eq!(seen, vec![(first, 1, 0), (big, 2, 20_000), (last, 3, 0)]);
    }

    #[test]
    fn test_first_record_skips_continuation() {
        let mut wal = WalBuilder::new(SYSID, 1, SEG, Lsn(SEG as u64));
        // fill the first segment almost completely, then cross into the next
        while wal.position().0 < 2 * SEG as u64 - 4000 {
            wal.insert(&[(node(1), 0, 1)], &vec![1; 1000]);
        }
        wal.insert(&[(node(1), 0, 2)], &vec![2; 9000]);
        let after = wal.insert(&[(node(1), 0, 3)], &[]);
        let source = wal.into_segments();

        let history = TimelineHistory::single(1);
        let mut reader = WalReader::new(&source, &history, SEG, SYSID);
        assert_eq!(reader.first_record_in_segment(2).unwrap(), Some(after));
    }

    #[test]
    fn test_missing_and_foreign_segments_are_distinct() {
        let history = TimelineHistory::single(1);
        let empty = MemorySegments::default();
        let mut reader = WalReader::new(&empty, &history, SEG, SYSID);
        let err = reader.read_record(Lsn(SEG as u64 + 40)).unwrap_err();
        assert!(matches!(err, EngineError::Wal(WalError::SegmentMissing { .. })));

        let mut wal = WalBuilder::new(SYSID + 1, 1, SEG, Lsn(SEG as u64));
        let start = wal.insert(&[(node(1), 0, 1)], &[]);
        let foreign = wal.into_segments();
        let mut reader = WalReader::new(&foreign, &history, SEG, SYSID);
        let err = reader.read_record(start).unwrap_err();
        assert!(matches!(err, EngineError::Wal(WalError::ForeignSystem { .. })));
        assert!(err.to_string().contains("from different database system"));
    }

    #[test]
    fn test_corrupt_record_is_detected() {
        let mut wal = WalBuilder::new(SYSID, 1, SEG, Lsn(SEG as u64));
        let start = wal.insert(&[(node(1), 0, 1)], b"payload");
        let mut source = wal.into_segments();
        source.corrupt(SegmentName::new(1, 1, SEG), start.segment_offset(SEG) as usize + 30);

        let history = TimelineHistory::single(1);
        let mut reader = WalReader::new(&source, &history, SEG, SYSID);
        let err = reader.read_record(start).unwrap_err();
        assert!(matches!(err, EngineError::Wal(WalError::RecordInvalid { .. })));
    }

    #[test]
    fn test_switch_record_jumps_to_next_segment() {
        let mut wal = WalBuilder::new(SYSID, 1, SEG, Lsn(SEG as u64));
        let start = wal.insert(&[(node(1), 0, 1)], &[]);
        wal.switch_segment();
        let next = wal.insert(&[(node(1), 0, 2)], &[]);
        assert_eq!(next.segment_number(SEG), 2);
        let source = wal.into_segments();

        let history = TimelineHistory::single(1);
        let mut reader = WalReader::new(&source, &history, SEG, SYSID);
        let mut blocks = Vec::new();
        reader
            .for_each_record(start, Lsn(next.0 + 1), |rec| {
                blocks.extend(rec.blocks.iter().map(|b| b.blkno));
                Ok(true)
            })
            .unwrap();
        assert_eq!(blocks, vec![1, 2]);
    }

    #[test]
    fn test_scan_to_end_stops_at_unwritten_wal() {
        let mut wal = WalBuilder::new(SYSID, 1, SEG, Lsn(SEG as u64));
        let first = wal.insert(&[(node(1), 0, 1)], &[]);
        wal.insert(&[(node(1), 0, 2)], &vec![3; 5000]);
        wal.switch_segment();
        wal.insert(&[(node(1), 0, 4)], &[]);
        let end = wal.position();
        let source = wal.into_segments();

        let history = TimelineHistory::single(1);
        let mut reader = WalReader::new(&source, &history, SEG, SYSID);
        let mut count = 0;
        let stop = reader.scan_to_end(first, |_| count += 1).unwrap();
        assert_eq!(count, 4);
        assert!(stop <= end && stop.0 + MAXALIGN > end.0);
    }
}

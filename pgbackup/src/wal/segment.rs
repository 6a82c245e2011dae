//! WAL segment file naming.

use crate::pg::{Lsn, TimeLineId};
use std::fmt;

/// Default `wal_segment_size`.
pub const DEFAULT_WAL_SEGMENT_SIZE: u32 = 16 * 1024 * 1024;

/// WAL page size (`XLOG_BLCKSZ`).
pub const XLOG_BLCKSZ: usize = 8192;

/// A regular segment: timeline plus segment number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentName {
    pub tli: TimeLineId,
    pub segno: u64,
    pub seg_size: u32,
}

fn segments_per_xlogid(seg_size: u32) -> u64 {
    0x1_0000_0000u64 / seg_size as u64
}

impl SegmentName {
    pub fn new(tli: TimeLineId, segno: u64, seg_size: u32) -> Self {
        Self { tli, segno, seg_size }
    }

    pub fn for_lsn(tli: TimeLineId, lsn: Lsn, seg_size: u32) -> Self {
        Self::new(tli, lsn.segment_number(seg_size), seg_size)
    }

    /// First byte position covered by this segment.
    pub fn start_lsn(&self) -> Lsn {
        Lsn(self.segno * self.seg_size as u64)
    }

    /// One past the last byte position covered by this segment.
    pub fn end_lsn(&self) -> Lsn {
        Lsn((self.segno + 1) * self.seg_size as u64)
    }

    /// Parse a 24-hex-digit segment file name, ignoring known suffixes.
    pub fn parse(file_name: &str, seg_size: u32) -> Option<Self> {
        let base = strip_suffixes(file_name);
        if base.len() != 24 || !base.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let tli = u32::from_str_radix(&base[0..8], 16).ok()?;
        let log = u64::from_str_radix(&base[8..16], 16).ok()?;
        let seg = u64::from_str_radix(&base[16..24], 16).ok()?;
        let per = segments_per_xlogid(seg_size);
        if seg >= per {
            return None;
        }
        Some(Self::new(tli, log * per + seg, seg_size))
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let per = segments_per_xlogid(self.seg_size);
        write!(
            f,
            "{:08X}{:08X}{:08X}",
            self.tli,
            self.segno / per,
            self.segno % per
        )
    }
}

/// Archive file suffix produced by compression.
pub const COMPRESSED_SUFFIX: &str = ".zst";

/// Strip `.zst`, `.partial` from an archived file name.
pub fn strip_suffixes(file_name: &str) -> &str {
    let name = file_name.strip_suffix(COMPRESSED_SUFFIX).unwrap_or(file_name);
    name.strip_suffix(".partial").unwrap_or(name)
}

/// Timeline history file name (`00000002.history`).
pub fn history_file_name(tli: TimeLineId) -> String {
    format!("{:08X}.history", tli)
}

/// Kinds of files kept in a WAL archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFileKind {
    Segment,
    Partial,
    History,
    BackupHistory,
    Other,
}

pub fn archive_file_kind(file_name: &str) -> ArchiveFileKind {
    let name = file_name.strip_suffix(COMPRESSED_SUFFIX).unwrap_or(file_name);
    let is_hex = |s: &str, n: usize| s.len() == n && s.bytes().all(|b| b.is_ascii_hexdigit());
    if let Some(base) = name.strip_suffix(".partial") {
        if is_hex(base, 24) {
            return ArchiveFileKind::Partial;
        }
    }
    if let Some(base) = name.strip_suffix(".history") {
        if is_hex(base, 8) {
            return ArchiveFileKind::History;
        }
    }
    if name.ends_with(".backup") && name.len() > 24 && is_hex(&name[..24], 24) {
        return ArchiveFileKind::BackupHistory;
    }
    if is_hex(name, 24) {
        return ArchiveFileKind::Segment;
    }
    ArchiveFileKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_name_round_trip() {
        let seg = SegmentName::new(2, 0x1_0003, DEFAULT_WAL_SEGMENT_SIZE);
        let name = seg.to_string();
        assert_eq!(name, "000000020000010000000003");
        assert_eq!(SegmentName::parse(&name, DEFAULT_WAL_SEGMENT_SIZE), Some(seg));
    }

    #[test]
    fn test_small_segments() {
        let size = 1024 * 1024;
        let seg = SegmentName::for_lsn(1, Lsn(0x0123_4567), size);
        assert_eq!(seg.segno, 0x12);
        assert_eq!(seg.to_string(), "000000010000000000000012");
        assert!(seg.start_lsn() <= Lsn(0x0123_4567) && Lsn(0x0123_4567) < seg.end_lsn());
    }

    #[test]
    fn test_archive_file_kinds() {
        assert_eq!(archive_file_kind("000000010000000000000001"), ArchiveFileKind::Segment);
        assert_eq!(archive_file_kind("000000010000000000000001.zst"), ArchiveFileKind::Segment);
        assert_eq!(archive_file_kind("000000010000000000000001.partial"), ArchiveFileKind::Partial);
        assert_eq!(archive_file_kind("00000002.history"), ArchiveFileKind::History);
        assert_eq!(
            archive_file_kind("000000010000000000000002.00000028.backup"),
            ArchiveFileKind::BackupHistory
        );
        assert_eq!(archive_file_kind("archive_status"), ArchiveFileKind::Other);
        assert!(SegmentName::parse("00000001000000000000000G", DEFAULT_WAL_SEGMENT_SIZE).is_none());
    }
}

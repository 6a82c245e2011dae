//! WAL record and page header decoding.
//!
//! Only what the engine needs is interpreted: page headers for stream
//! validation, the record header, block references (to learn which pages a
//! record touched) and the main data of transaction records.

use super::crc::Crc32c;
use crate::pg::{Lsn, RelFileNode, TimeLineId};
use chrono::{DateTime, TimeZone, Utc};

/// `XLOG_PAGE_MAGIC` values of supported server versions (12 to 17).
pub const XLOG_PAGE_MAGICS: &[u16] = &[0xD101, 0xD106, 0xD10D, 0xD110, 0xD113, 0xD116];

/// First magic using the PostgreSQL 15 full-page-image flag layout.
const MAGIC_PG15: u16 = 0xD110;

pub const SIZE_OF_SHORT_PHD: usize = 24;
pub const SIZE_OF_LONG_PHD: usize = 40;
pub const SIZE_OF_XLOG_RECORD: usize = 24;
pub const MAXALIGN: u64 = 8;

pub const XLP_FIRST_IS_CONTRECORD: u16 = 0x0001;
pub const XLP_LONG_HEADER: u16 = 0x0002;

/// Upper bound on a sane record length.
const MAX_RECORD_LEN: u32 = 1024 * 1024 * 1024;

pub const RM_XLOG_ID: u8 = 0;
pub const RM_XACT_ID: u8 = 1;
pub const XLOG_SWITCH: u8 = 0x40;
const XLR_INFO_MASK: u8 = 0x0F;
const XLOG_XACT_OPMASK: u8 = 0x70;
pub const XLOG_XACT_COMMIT: u8 = 0x00;
pub const XLOG_XACT_ABORT: u8 = 0x20;
const XLOG_XACT_COMMIT_PREPARED: u8 = 0x30;
const XLOG_XACT_ABORT_PREPARED: u8 = 0x40;

const XLR_MAX_BLOCK_ID: u8 = 32;
const XLR_BLOCK_ID_DATA_SHORT: u8 = 255;
const XLR_BLOCK_ID_DATA_LONG: u8 = 254;
const XLR_BLOCK_ID_ORIGIN: u8 = 253;
const XLR_BLOCK_ID_TOPLEVEL_XID: u8 = 252;

const BKPBLOCK_FORK_MASK: u8 = 0x0F;
const BKPBLOCK_HAS_IMAGE: u8 = 0x10;
const BKPBLOCK_HAS_DATA: u8 = 0x20;
const BKPBLOCK_WILL_INIT: u8 = 0x40;
const BKPBLOCK_SAME_REL: u8 = 0x80;

const BKPIMAGE_HAS_HOLE: u8 = 0x01;
const BKPIMAGE_IS_COMPRESSED_PRE15: u8 = 0x02;
const BKPIMAGE_COMPRESSED_PG15: u8 = 0x04 | 0x08 | 0x10;

/// Main fork number.
pub const MAIN_FORKNUM: u8 = 0;

/// Microseconds between the Unix epoch and 2000-01-01.
const POSTGRES_EPOCH_OFFSET_USECS: i64 = 946_684_800_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongPageHeader {
    pub system_id: u64,
    pub seg_size: u32,
    pub xlog_blcksz: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalPageHeader {
    pub magic: u16,
    pub info: u16,
    pub tli: TimeLineId,
    pub pageaddr: Lsn,
    pub rem_len: u32,
    pub long: Option<LongPageHeader>,
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

impl WalPageHeader {
    pub fn parse(page: &[u8]) -> Option<Self> {
        if page.len() < SIZE_OF_SHORT_PHD {
            return None;
        }
        let info = le_u16(page, 2);
        let long = if info & XLP_LONG_HEADER != 0 {
            if page.len() < SIZE_OF_LONG_PHD {
                return None;
            }
            Some(LongPageHeader {
                system_id: le_u64(page, 24),
                seg_size: le_u32(page, 32),
                xlog_blcksz: le_u32(page, 36),
            })
        } else {
            None
        };
        Some(Self {
            magic: le_u16(page, 0),
            info,
            tli: le_u32(page, 4),
            pageaddr: Lsn(le_u64(page, 8)),
            rem_len: le_u32(page, 16),
            long,
        })
    }

    pub fn size(&self) -> usize {
        if self.long.is_some() {
            SIZE_OF_LONG_PHD
        } else {
            SIZE_OF_SHORT_PHD
        }
    }

    pub fn is_contrecord(&self) -> bool {
        self.info & XLP_FIRST_IS_CONTRECORD != 0
    }

    pub fn has_known_magic(&self) -> bool {
        XLOG_PAGE_MAGICS.contains(&self.magic)
    }

    /// Serialize into the first bytes of `page`.
    pub fn write_to(&self, page: &mut [u8]) {
        page[0..2].copy_from_slice(&self.magic.to_le_bytes());
        page[2..4].copy_from_slice(&self.info.to_le_bytes());
        page[4..8].copy_from_slice(&self.tli.to_le_bytes());
        page[8..16].copy_from_slice(&self.pageaddr.0.to_le_bytes());
        page[16..20].copy_from_slice(&self.rem_len.to_le_bytes());
        if let Some(long) = self.long {
            page[24..32].copy_from_slice(&long.system_id.to_le_bytes());
            page[32..36].copy_from_slice(&long.seg_size.to_le_bytes());
            page[36..40].copy_from_slice(&long.xlog_blcksz.to_le_bytes());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogRecordHeader {
    pub tot_len: u32,
    pub xid: u32,
    pub prev: Lsn,
    pub info: u8,
    pub rmid: u8,
    pub crc: u32,
}

impl XLogRecordHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < SIZE_OF_XLOG_RECORD {
            return None;
        }
        Some(Self {
            tot_len: le_u32(buf, 0),
            xid: le_u32(buf, 4),
            prev: Lsn(le_u64(buf, 8)),
            info: buf[16],
            rmid: buf[17],
            crc: le_u32(buf, 20),
        })
    }

    /// Basic length sanity; the full check needs the whole record.
    pub fn check_length(tot_len: u32) -> Result<(), String> {
        if (tot_len as usize) < SIZE_OF_XLOG_RECORD {
            return Err(format!("invalid record length {}", tot_len));
        }
        if tot_len > MAX_RECORD_LEN {
            return Err(format!("record length {} is too long", tot_len));
        }
        Ok(())
    }
}

/// A page touched by a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub node: RelFileNode,
    pub fork: u8,
    pub blkno: u32,
    pub has_image: bool,
    pub will_init: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactKind {
    Commit,
    Abort,
}

#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub lsn: Lsn,
    pub end: Lsn,
    pub header: XLogRecordHeader,
    pub blocks: Vec<BlockRef>,
    pub main_data: Vec<u8>,
}

impl DecodedRecord {
    pub fn is_xlog_switch(&self) -> bool {
        self.header.rmid == RM_XLOG_ID && self.header.info & !XLR_INFO_MASK == XLOG_SWITCH
    }

    pub fn xact_kind(&self) -> Option<XactKind> {
        if self.header.rmid != RM_XACT_ID {
            return None;
        }
        match self.header.info & XLOG_XACT_OPMASK {
            XLOG_XACT_COMMIT | XLOG_XACT_COMMIT_PREPARED => Some(XactKind::Commit),
            XLOG_XACT_ABORT | XLOG_XACT_ABORT_PREPARED => Some(XactKind::Abort),
            _ => None,
        }
    }

    /// Commit/abort timestamp of a transaction record.
    pub fn xact_time(&self) -> Option<DateTime<Utc>> {
        self.xact_kind()?;
        if self.main_data.len() < 8 {
            return None;
        }
        let pg_usecs = le_u64(&self.main_data, 0) as i64;
        Utc.timestamp_micros(pg_usecs + POSTGRES_EPOCH_OFFSET_USECS)
            .single()
    }
}

/// Convert a wall-clock time into a PostgreSQL `TimestampTz`.
pub fn to_pg_timestamp(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros() - POSTGRES_EPOCH_OFFSET_USECS
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.remaining() < n {
            return Err(format!(
                "record is truncated: wanted {} bytes at offset {}",
                n, self.pos
            ));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, String> {
        Ok(le_u16(self.take(2)?, 0))
    }

    fn u32(&mut self) -> Result<u32, String> {
        Ok(le_u32(self.take(4)?, 0))
    }
}

fn image_is_compressed(bimg_info: u8, page_magic: u16) -> bool {
    if page_magic >= MAGIC_PG15 {
        bimg_info & BKPIMAGE_COMPRESSED_PG15 != 0
    } else {
        bimg_info & BKPIMAGE_IS_COMPRESSED_PRE15 != 0
    }
}

/// Compute the record CRC the way the server does: payload first, then the
/// header up to the CRC field.
pub fn record_crc(record: &[u8]) -> u32 {
    let mut crc = Crc32c::new();
    crc.update(&record[SIZE_OF_XLOG_RECORD..]);
    crc.update(&record[..20]);
    crc.finalize()
}

/// Decode a complete record image (exactly `tot_len` bytes).
pub fn decode_record(lsn: Lsn, end: Lsn, record: &[u8], page_magic: u16) -> Result<DecodedRecord, String> {
    let header = XLogRecordHeader::parse(record).ok_or("record is shorter than its header")?;
    XLogRecordHeader::check_length(header.tot_len)?;
    if header.tot_len as usize != record.len() {
        return Err(format!(
            "record length {} does not match {} bytes read",
            header.tot_len,
            record.len()
        ));
    }
    let crc = record_crc(record);
    if crc != header.crc {
        return Err(format!(
            "incorrect resource manager data checksum in record (expected {:08X}, computed {:08X})",
            header.crc, crc
        ));
    }

    let mut cur = Cursor {
        buf: record,
        pos: SIZE_OF_XLOG_RECORD,
    };
    let mut datatotal = 0usize;
    let mut main_len = 0usize;
    let mut last_node: Option<RelFileNode> = None;
    let mut blocks = Vec::new();

    while cur.remaining() > datatotal {
        let block_id = cur.u8()?;
        match block_id {
            XLR_BLOCK_ID_DATA_SHORT => {
                main_len = cur.u8()? as usize;
                datatotal += main_len;
                break;
            }
            XLR_BLOCK_ID_DATA_LONG => {
                main_len = cur.u32()? as usize;
                datatotal += main_len;
                break;
            }
            XLR_BLOCK_ID_ORIGIN => {
                cur.take(2)?;
            }
            XLR_BLOCK_ID_TOPLEVEL_XID => {
                cur.take(4)?;
            }
            id if id <= XLR_MAX_BLOCK_ID => {
                let fork_flags = cur.u8()?;
                let data_len = cur.u16()? as usize;
                if fork_flags & BKPBLOCK_HAS_DATA == 0 && data_len != 0 {
                    return Err(format!(
                        "BKPBLOCK_HAS_DATA not set, but data length is {}",
                        data_len
                    ));
                }
                datatotal += data_len;

                let has_image = fork_flags & BKPBLOCK_HAS_IMAGE != 0;
                if has_image {
                    let bimg_len = cur.u16()? as usize;
                    let _hole_offset = cur.u16()?;
                    let bimg_info = cur.u8()?;
                    if bimg_info & BKPIMAGE_HAS_HOLE != 0 && image_is_compressed(bimg_info, page_magic) {
                        cur.u16()?;
                    }
                    datatotal += bimg_len;
                }

                let node = if fork_flags & BKPBLOCK_SAME_REL != 0 {
                    last_node.ok_or("BKPBLOCK_SAME_REL set but no previous rel")?
                } else {
                    RelFileNode {
                        spc: cur.u32()?,
                        db: cur.u32()?,
                        rel: cur.u32()?,
                    }
                };
                last_node = Some(node);
                let blkno = cur.u32()?;

                blocks.push(BlockRef {
                    node,
                    fork: fork_flags & BKPBLOCK_FORK_MASK,
                    blkno,
                    has_image,
                    will_init: fork_flags & BKPBLOCK_WILL_INIT != 0,
                });
            }
            other => return Err(format!("invalid block_id {}", other)),
        }
    }

    if cur.remaining() != datatotal {
        return Err(format!(
            "record length mismatch: {} bytes of block data, {} bytes left",
            datatotal,
            cur.remaining()
        ));
    }

    let main_data = record[record.len() - main_len..].to_vec();
    Ok(DecodedRecord {
        lsn,
        end,
        header,
        blocks,
        main_data,
    })
}

/// Build a record image with block references but no block data.
#[cfg(test)]
pub(crate) fn encode_record(
    xid: u32,
    prev: Lsn,
    rmid: u8,
    info: u8,
    blocks: &[(RelFileNode, u8, u32)],
    main_data: &[u8],
) -> Vec<u8> {
    let mut rec = vec![0u8; SIZE_OF_XLOG_RECORD];
    let mut last: Option<RelFileNode> = None;
    for (idx, (node, fork, blkno)) in blocks.iter().enumerate() {
        rec.push(idx as u8);
        let same = last == Some(*node);
        rec.push(*fork | if same { BKPBLOCK_SAME_REL } else { 0 });
        rec.extend_from_slice(&0u16.to_le_bytes());
        if !same {
            rec.extend_from_slice(&node.spc.to_le_bytes());
            rec.extend_from_slice(&node.db.to_le_bytes());
            rec.extend_from_slice(&node.rel.to_le_bytes());
        }
        rec.extend_from_slice(&blkno.to_le_bytes());
        last = Some(*node);
    }
    if !main_data.is_empty() {
        if main_data.len() < 256 {
            rec.push(XLR_BLOCK_ID_DATA_SHORT);
            rec.push(main_data.len() as u8);
        } else {
            rec.push(XLR_BLOCK_ID_DATA_LONG);
            rec.extend_from_slice(&(main_data.len() as u32).to_le_bytes());
        }
        rec.extend_from_slice(main_data);
    }

    let tot_len = rec.len() as u32;
    rec[0..4].copy_from_slice(&tot_len.to_le_bytes());
    rec[4..8].copy_from_slice(&xid.to_le_bytes());
    rec[8..16].copy_from_slice(&prev.0.to_le_bytes());
    rec[16] = info;
    rec[17] = rmid;
    let crc = record_crc(&rec);
    rec[20..24].copy_from_slice(&crc.to_le_bytes());
    rec
}

//! Heap/index page header access.
//!
//! Only the fixed 24-byte `PageHeaderData` prefix is interpreted: the page
//! LSN drives DELTA change detection and the bounds fields let a torn or
//! garbage page be told apart from a valid one.

use super::Lsn;

/// Size of a relation data page.
pub const BLCKSZ: usize = 8192;

/// Size of `PageHeaderData`.
pub const PAGE_HEADER_SIZE: usize = 24;

const PD_VALID_FLAG_BITS: u16 = 0x0007;
const PG_PAGE_LAYOUT_VERSION: u16 = 4;
const MAXIMUM_ALIGNOF: u16 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub lsn: Lsn,
    pub checksum: u16,
    pub flags: u16,
    pub lower: u16,
    pub upper: u16,
    pub special: u16,
    pub pagesize_version: u16,
}

/// Outcome of a page sanity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// All-zero page left by relation extension.
    New,
    Valid(PageHeader),
    Invalid,
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

impl PageHeader {
    pub fn parse(page: &[u8]) -> Option<Self> {
        if page.len() < PAGE_HEADER_SIZE {
            return None;
        }
        let xlogid = read_u32(page, 0) as u64;
        let xrecoff = read_u32(page, 4) as u64;
        Some(Self {
            lsn: Lsn((xlogid << 32) | xrecoff),
            checksum: read_u16(page, 8),
            flags: read_u16(page, 10),
            lower: read_u16(page, 12),
            upper: read_u16(page, 14),
            special: read_u16(page, 16),
            pagesize_version: read_u16(page, 18),
        })
    }

    fn is_sane(&self) -> bool {
        let size = (self.pagesize_version & 0xFF00) as usize;
        let version = self.pagesize_version & 0x00FF;
        size == BLCKSZ
            && version == PG_PAGE_LAYOUT_VERSION
            && self.flags & !PD_VALID_FLAG_BITS == 0
            && self.lower as usize >= PAGE_HEADER_SIZE
            && self.lower <= self.upper
            && self.upper <= self.special
            && self.special as usize <= BLCKSZ
            && self.special % MAXIMUM_ALIGNOF == 0
    }
}

/// Classify a full page image.
pub fn inspect(page: &[u8]) -> PageState {
    if page.len() != BLCKSZ {
        return PageState::Invalid;
    }
    if page.iter().all(|b| *b == 0) {
        return PageState::New;
    }
    match PageHeader::parse(page) {
        Some(header) if header.is_sane() => PageState::Valid(header),
        _ => PageState::Invalid,
    }
}

/// LSN stamped on a page, `None` for new or invalid pages.
pub fn page_lsn(page: &[u8]) -> Option<Lsn> {
    match inspect(page) {
        PageState::Valid(header) => Some(header.lsn),
        _ => None,
    }
}

/// Build an empty but structurally valid page stamped with `lsn`.
pub fn empty_page(lsn: Lsn) -> Vec<u8> {
    let mut page = vec![0u8; BLCKSZ];
    page[0..4].copy_from_slice(&((lsn.0 >> 32) as u32).to_le_bytes());
    page[4..8].copy_from_slice(&(lsn.0 as u32).to_le_bytes());
    page[12..14].copy_from_slice(&(PAGE_HEADER_SIZE as u16).to_le_bytes());
    page[14..16].copy_from_slice(&(BLCKSZ as u16).to_le_bytes());
    page[16..18].copy_from_slice(&(BLCKSZ as u16).to_le_bytes());
    page[18..20].copy_from_slice(&(BLCKSZ as u16 | PG_PAGE_LAYOUT_VERSION).to_le_bytes());
    page
}

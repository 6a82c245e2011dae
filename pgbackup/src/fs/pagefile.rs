//! Stored form of relation data files.
//!
//! A backed-up relation segment is the concatenation of its selected pages,
//! each zstd-compressed when that makes it smaller. The location and
//! checksum of every page goes into the backup's `page-header-map`, a flat
//! array of fixed-size little-endian entries:
//!
//! ```text
//! block u32 | compressed_size u32 | pos u64 | lsn u64 | crc u32
//! ```
//!
//! A `compressed_size` equal to the page size means the page is stored raw.

use crate::pg::page::page_lsn;
use crate::pg::{Lsn, BLCKSZ};
use crate::utils::errors::{EngineError, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

pub const PAGE_ENTRY_SIZE: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry {
    pub block: u32,
    pub compressed_size: u32,
    pub pos: u64,
    pub lsn: Lsn,
    /// CRC32 of the uncompressed page.
    pub crc: u32,
}

impl PageEntry {
    pub fn is_compressed(&self) -> bool {
        self.compressed_size as usize != BLCKSZ
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.block.to_le_bytes());
        out.extend_from_slice(&self.compressed_size.to_le_bytes());
        out.extend_from_slice(&self.pos.to_le_bytes());
        out.extend_from_slice(&self.lsn.0.to_le_bytes());
        out.extend_from_slice(&self.crc.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        Self {
            block: u32_at(0),
            compressed_size: u32_at(4),
            pos: u64_at(8),
            lsn: Lsn(u64_at(16)),
            crc: u32_at(24),
        }
    }
}

pub fn encode_headers(entries: &[PageEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * PAGE_ENTRY_SIZE);
    for entry in entries {
        entry.encode(&mut out);
    }
    out
}

pub fn decode_headers(buf: &[u8]) -> Result<Vec<PageEntry>> {
    if buf.len() % PAGE_ENTRY_SIZE != 0 {
        return Err(EngineError::Corruption(format!(
            "page header block has invalid length {}",
            buf.len()
        )));
    }
    Ok(buf.chunks_exact(PAGE_ENTRY_SIZE).map(PageEntry::decode).collect())
}

/// Streams selected pages of one relation file into its stored form.
pub struct PageWriter<W: Write> {
    out: W,
    pos: u64,
    level: Option<i32>,
    entries: Vec<PageEntry>,
    content_crc: crc32fast::Hasher,
}

/// Totals of a finished page stream.
#[derive(Debug, Clone)]
pub struct PageStream {
    pub entries: Vec<PageEntry>,
    pub stored_bytes: u64,
    /// CRC32 over the uncompressed pages in stream order.
    pub content_crc: u32,
}

impl<W: Write> PageWriter<W> {
    /// `level` enables zstd at that level.
    pub fn new(out: W, level: Option<i32>) -> Self {
        Self {
            out,
            pos: 0,
            level,
            entries: Vec::new(),
            content_crc: crc32fast::Hasher::new(),
        }
    }

    pub fn write_page(&mut self, block: u32, page: &[u8]) -> Result<()> {
        debug_assert_eq!(page.len(), BLCKSZ);
        let packed = match self.level {
            Some(level) => {
                let packed = zstd::bulk::compress(page, level)
                    .map_err(|e| EngineError::Compression(e.to_string()))?;
                (packed.len() < BLCKSZ).then_some(packed)
            }
            None => None,
        };
        let stored: &[u8] = packed.as_deref().unwrap_or(page);
        self.out.write_all(stored)?;

        self.content_crc.update(page);
        self.entries.push(PageEntry {
            block,
            compressed_size: stored.len() as u32,
            pos: self.pos,
            lsn: page_lsn(page).unwrap_or(Lsn::INVALID),
            crc: crc32fast::hash(page),
        });
        self.pos += stored.len() as u64;
        Ok(())
    }

    pub fn finish(mut self) -> Result<PageStream> {
        self.out.flush()?;
        Ok(PageStream {
            entries: self.entries,
            stored_bytes: self.pos,
            content_crc: self.content_crc.finalize(),
        })
    }
}

/// Read and verify one stored page.
pub fn read_page(stored: &mut File, entry: &PageEntry) -> Result<Vec<u8>> {
    stored.seek(SeekFrom::Start(entry.pos))?;
    let mut raw = vec![0u8; entry.compressed_size as usize];
    stored.read_exact(&mut raw).map_err(|e| {
        EngineError::Corruption(format!("cannot read block {}: {}", entry.block, e))
    })?;
    let page = if entry.is_compressed() {
        zstd::bulk::decompress(&raw, BLCKSZ).map_err(|e| {
            EngineError::Corruption(format!("cannot decompress block {}: {}", entry.block, e))
        })?
    } else {
        raw
    };
    if page.len() != BLCKSZ || crc32fast::hash(&page) != entry.crc {
        return Err(EngineError::Corruption(format!(
            "block {} has invalid checksum",
            entry.block
        )));
    }
    Ok(page)
}

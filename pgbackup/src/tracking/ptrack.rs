//! PTRACK map reader.
//!
//! The map is maintained by a server extension in `global/ptrack.map`:
//!
//! ```text
//! "PTRK" | version u32 | watermark u64 | n_entries u32
//! n_entries x { spc u32 | db u32 | rel u32 | nbits u32 | bitmap (LSB first) }
//! crc32 u32 over everything before it
//! ```
//!
//! All integers are little endian. Bits are absolute block numbers of the
//! relation's main fork and are cleared when the map is reset after a
//! backup; the watermark is the LSN of that reset.

use super::pagemap::{PageBitmap, PageMap};
use crate::pg::{Lsn, RelFileNode};
use crate::utils::errors::{EngineError, Result};
use std::path::Path;

pub const PTRACK_MAP_PATH: &str = "global/ptrack.map";

const MAGIC: &[u8; 4] = b"PTRK";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtrackMap {
    pub watermark: Lsn,
    relations: Vec<(RelFileNode, PageBitmap)>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(EngineError::Corruption(
                "ptrack map is truncated".to_string(),
            ));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }
}

impl PtrackMap {
    /// Empty map whose tracking starts at `watermark`.
    pub fn cleared(watermark: Lsn) -> Self {
        Self {
            watermark,
            relations: Vec::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + 4 {
            return Err(EngineError::Corruption("ptrack map is truncated".to_string()));
        }
        let (body, tail) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        if crc32fast::hash(body) != stored {
            return Err(EngineError::Corruption(
                "ptrack map checksum mismatch".to_string(),
            ));
        }

        let mut reader = Reader { buf: body, pos: 0 };
        if reader.take(4)? != MAGIC {
            return Err(EngineError::Corruption("ptrack map has invalid magic".to_string()));
        }
        let version = reader.u32()?;
        if version != VERSION {
            return Err(EngineError::Unsupported(format!(
                "ptrack map version {} is not supported",
                version
            )));
        }
        let watermark = Lsn(reader.u64()?);
        let n_entries = reader.u32()?;

        // each entry is at least 16 bytes; a larger count cannot be satisfied
        let mut relations = Vec::with_capacity((n_entries as usize).min(body.len() / 16));
        for _ in 0..n_entries {
            let node = RelFileNode {
                spc: reader.u32()?,
                db: reader.u32()?,
                rel: reader.u32()?,
            };
            let nbits = reader.u32()?;
            let bytes = reader.take(nbits.div_ceil(8) as usize)?;
            relations.push((node, PageBitmap::from_lsb_bytes(bytes, nbits)));
        }
        Ok(Self { watermark, relations })
    }

    /// Read the map of a data directory; `None` when tracking is not enabled.
    pub fn read_from_pgdata(pgdata: &Path) -> Result<Option<Self>> {
        let path = pgdata.join(PTRACK_MAP_PATH);
        match std::fs::read(&path) {
            Ok(data) => Self::parse(&data).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::file("read", &path, e)),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&self.watermark.0.to_le_bytes());
        out.extend_from_slice(&(self.relations.len() as u32).to_le_bytes());
        for (node, bitmap) in &self.relations {
            out.extend_from_slice(&node.spc.to_le_bytes());
            out.extend_from_slice(&node.db.to_le_bytes());
            out.extend_from_slice(&node.rel.to_le_bytes());
            let (bytes, nbits) = bitmap.to_lsb_bytes();
            out.extend_from_slice(&nbits.to_le_bytes());
            out.extend_from_slice(&bytes);
        }
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Flag absolute block `blkno` of `node` as changed.
    pub fn mark(&mut self, node: RelFileNode, blkno: u32) {
        match self.relations.iter_mut().find(|(n, _)| *n == node) {
            Some((_, bitmap)) => bitmap.set(blkno),
            None => {
                let mut bitmap = PageBitmap::new();
                bitmap.set(blkno);
                self.relations.push((node, bitmap));
            }
        }
    }

    /// Split the per-relation bitmaps into per-segment ones.
    pub fn to_page_map(&self) -> PageMap {
        let mut map = PageMap::new();
        for (node, bitmap) in &self.relations {
            for blkno in bitmap.iter() {
                map.mark(*node, blkno);
            }
        }
        map
    }

    /// The watermark must lie in `[lower, upper]`: above `upper` tracking
    /// has run ahead of the copy, below `lower` changes were lost while
    /// tracking was off or reset early.
    pub fn check_watermark(&self, lower: Lsn, lower_what: &str, upper: Lsn) -> Result<()> {
        if self.watermark > upper {
            return Err(EngineError::Chain(format!(
                "LSN from ptrack map {} is greater than current START LSN {}",
                self.watermark, upper
            )));
        }
        if self.watermark < lower {
            return Err(EngineError::Chain(format!(
                "LSN from ptrack map {} is lower than {} {}, tracking was disabled in between. Create new FULL backup before an incremental one.",
                self.watermark, lower_what, lower
            )));
        }
        Ok(())
    }
}

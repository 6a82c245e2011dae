//! Per-relation-segment page bitmaps.

use crate::pg::{RelFileKey, RelFileNode};
use crate::wal::record::{DecodedRecord, MAIN_FORKNUM};
use std::collections::HashMap;

/// Set of block numbers inside one relation segment file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageBitmap {
    words: Vec<u64>,
}

impl PageBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bitmap with every block below `n_blocks` set.
    pub fn with_all(n_blocks: u32) -> Self {
        let mut bitmap = Self::new();
        bitmap.set_range(0, n_blocks);
        bitmap
    }

    /// Decode a bitmap stored least-significant-bit first.
    pub fn from_lsb_bytes(bytes: &[u8], nbits: u32) -> Self {
        let mut bitmap = Self::new();
        for blk in 0..nbits {
            let byte = bytes.get((blk / 8) as usize).copied().unwrap_or(0);
            if byte & (1 << (blk % 8)) != 0 {
                bitmap.set(blk);
            }
        }
        bitmap
    }

    /// Encode least-significant-bit first; returns bytes and bit count.
    pub fn to_lsb_bytes(&self) -> (Vec<u8>, u32) {
        let nbits = self.iter().last().map_or(0, |last| last + 1);
        let mut bytes = vec![0u8; nbits.div_ceil(8) as usize];
        for blk in self.iter() {
            bytes[(blk / 8) as usize] |= 1 << (blk % 8);
        }
        (bytes, nbits)
    }

    pub fn set(&mut self, blk: u32) {
        let word = (blk / 64) as usize;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (blk % 64);
    }

    pub fn set_range(&mut self, from: u32, to: u32) {
        for blk in from..to {
            self.set(blk);
        }
    }

    pub fn contains(&self, blk: u32) -> bool {
        self.words
            .get((blk / 64) as usize)
            .is_some_and(|w| w & (1u64 << (blk % 64)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn union_with(&mut self, other: &PageBitmap) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine |= *theirs;
        }
    }

    /// Drop every block at or beyond `n_blocks`.
    pub fn truncate(&mut self, n_blocks: u32) {
        let full = (n_blocks / 64) as usize;
        let rem = n_blocks % 64;
        if rem == 0 {
            self.words.truncate(full);
        } else if full < self.words.len() {
            self.words.truncate(full + 1);
            self.words[full] &= (1u64 << rem) - 1;
        }
    }

    /// Set blocks in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, word)| {
            let word = *word;
            (0..64u32)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| idx as u32 * 64 + bit)
        })
    }
}

/// Changed pages of every relation segment, keyed by segment file.
#[derive(Debug, Clone, Default)]
pub struct PageMap {
    files: HashMap<RelFileKey, PageBitmap>,
}

impl PageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change to absolute block `blkno` of `node`'s main fork.
    pub fn mark(&mut self, node: RelFileNode, blkno: u32) {
        let (key, seg_blk) = RelFileKey::for_block(node, blkno);
        self.files.entry(key).or_default().set(seg_blk);
    }

    /// Record every main-fork block a WAL record references.
    pub fn add_record(&mut self, record: &DecodedRecord) {
        for block in &record.blocks {
            if block.fork == MAIN_FORKNUM {
                self.mark(block.node, block.blkno);
            }
        }
    }

    pub fn get(&self, key: &RelFileKey) -> Option<&PageBitmap> {
        self.files.get(key)
    }

    pub fn merge(&mut self, other: PageMap) {
        for (key, bitmap) in other.files {
            match self.files.get_mut(&key) {
                Some(existing) => existing.union_with(&bitmap),
                None => {
                    self.files.insert(key, bitmap);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_pages(&self) -> usize {
        self.files.values().map(PageBitmap::count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::RELSEG_SIZE;

    #[test]
    fn test_bitmap_ops() {
        let mut bitmap = PageBitmap::new();
        bitmap.set(3);
        bitmap.set(64);
        bitmap.set(200);
        assert!(bitmap.contains(64));
        assert!(!bitmap.contains(65));
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![3, 64, 200]);

        bitmap.truncate(100);
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![3, 64]);
        bitmap.truncate(64);
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![3]);

        let mut other = PageBitmap::with_all(2);
        other.union_with(&bitmap);
        assert_eq!(other.count(), 3);
    }

    #[test]
    fn test_lsb_encoding() {
        let mut bitmap = PageBitmap::new();
        bitmap.set(0);
        bitmap.set(9);
        let (bytes, nbits) = bitmap.to_lsb_bytes();
        assert_eq!(bytes, vec![0b0000_0001, 0b0000_0010]);
        assert_eq!(nbits, 10);
        assert_eq!(PageBitmap::from_lsb_bytes(&bytes, nbits), bitmap);
    }

    #[test]
    fn test_page_map_splits_by_segment() {
        let node = RelFileNode { spc: 1663, db: 5, rel: 16384 };
        let mut map = PageMap::new();
        map.mark(node, 2);
        map.mark(node, RELSEG_SIZE + 7);

        let seg0 = map.get(&RelFileKey { node, segno: 0 }).unwrap();
        assert!(seg0.contains(2));
        let seg1 = map.get(&RelFileKey { node, segno: 1 }).unwrap();
        assert_eq!(seg1.iter().collect::<Vec<_>>(), vec![7]);

        let mut other = PageMap::new();
        other.mark(node, 5);
        map.merge(other);
        assert_eq!(map.total_pages(), 3);
        assert_eq!(map.len(), 2);
    }
}

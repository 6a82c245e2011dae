//! DELTA mode: changed pages from page LSNs.

use super::pagemap::PageBitmap;
use crate::pg::page::{inspect, PageState};
use crate::pg::{Lsn, BLCKSZ};
use crate::utils::errors::{EngineError, Result};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

/// Blocks among the first `n_blocks` of `path` stamped at or after `since`.
///
/// New (all-zero) and unparsable pages are reported as changed; the copier
/// decides what to do with them. A file that shrank while being read simply
/// yields fewer blocks.
pub fn changed_since(path: &Path, n_blocks: u32, since: Lsn) -> Result<PageBitmap> {
    let mut file = File::open(path).map_err(|e| EngineError::file("open", path, e))?;
    let mut bitmap = PageBitmap::new();
    let mut page = vec![0u8; BLCKSZ];

    for blk in 0..n_blocks {
        match file.read_exact(&mut page) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(EngineError::file("read", path, e)),
        }
        let changed = match inspect(&page) {
            PageState::Valid(header) => header.lsn >= since,
            PageState::New | PageState::Invalid => true,
        };
        if changed {
            bitmap.set(blk);
        }
    }
    Ok(bitmap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::page::empty_page;
    use tempfile::TempDir;

    #[test]
    fn test_pages_at_or_after_since_are_changed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("16384");
        let mut data = Vec::new();
        data.extend(empty_page(Lsn(0x100)));
        data.extend(empty_page(Lsn(0x200)));
        data.extend(vec![0u8; BLCKSZ]);
        data.extend(empty_page(Lsn(0x300)));
        std::fs::write(&path, &data).unwrap();

        let bitmap = changed_since(&path, 4, Lsn(0x200)).unwrap();
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![1, 2, 3]);

        let bitmap = changed_since(&path, 2, Lsn(0x200)).unwrap();
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_short_file_stops_early() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("16384");
        std::fs::write(&path, empty_page(Lsn(0x500))).unwrap();
        let bitmap = changed_since(&path, 10, Lsn(0x100)).unwrap();
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![0]);
    }
}

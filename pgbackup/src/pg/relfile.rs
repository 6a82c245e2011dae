//! Relation file naming.
//!
//! Main-fork segment files are the only "paged" files the engine diffs at
//! block granularity. Free space map, visibility map and init forks are
//! small and copied whole.

use super::{DEFAULT_TABLESPACE_OID, GLOBAL_TABLESPACE_OID, RELSEG_SIZE};
use std::fmt;

/// Physical relation identity (`RelFileNode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelFileNode {
    pub spc: u32,
    pub db: u32,
    pub rel: u32,
}

/// One segment file of a relation's main fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelFileKey {
    pub node: RelFileNode,
    pub segno: u32,
}

impl RelFileKey {
    /// Segment file and in-segment block for an absolute block number.
    pub fn for_block(node: RelFileNode, blkno: u32) -> (RelFileKey, u32) {
        (
            RelFileKey {
                node,
                segno: blkno / RELSEG_SIZE,
            },
            blkno % RELSEG_SIZE,
        )
    }
}

impl fmt::Display for RelFileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.node.spc, self.node.db, self.node.rel
        )?;
        if self.segno > 0 {
            write!(f, ".{}", self.segno)?;
        }
        Ok(())
    }
}

fn parse_oid(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// `<relnode>` or `<relnode>.<segno>`; fork suffixes are rejected.
fn parse_rel_name(name: &str) -> Option<(u32, u32)> {
    match name.split_once('.') {
        Some((rel, seg)) => Some((parse_oid(rel)?, parse_oid(seg)?)),
        None => Some((parse_oid(name)?, 0)),
    }
}

/// Classify a PGDATA-relative path ('/'-separated) as a main-fork segment.
pub fn classify(rel_path: &str) -> Option<RelFileKey> {
    let parts: Vec<&str> = rel_path.split('/').collect();
    let (spc, db, name) = match parts.as_slice() {
        ["base", db, name] => (DEFAULT_TABLESPACE_OID, parse_oid(db)?, *name),
        ["global", name] => (GLOBAL_TABLESPACE_OID, 0, *name),
        ["pg_tblspc", spc, _version, db, name] => (parse_oid(spc)?, parse_oid(db)?, *name),
        _ => return None,
    };
    let (rel, segno) = parse_rel_name(name)?;
    Some(RelFileKey {
        node: RelFileNode { spc, db, rel },
        segno,
    })
}

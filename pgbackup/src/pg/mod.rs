//! PostgreSQL on-disk formats the engine reads: LSNs, data pages,
//! `pg_control` and relation file naming.

pub mod control_file;
pub mod lsn;
pub mod page;
pub mod relfile;

pub use control_file::{ClusterState, ControlFileData};
pub use lsn::{Lsn, TimeLineId};
pub use page::BLCKSZ;
pub use relfile::{RelFileKey, RelFileNode};

/// Default tablespace OID (`base/`).
pub const DEFAULT_TABLESPACE_OID: u32 = 1663;

/// Shared catalog tablespace OID (`global/`).
pub const GLOBAL_TABLESPACE_OID: u32 = 1664;

/// Blocks per relation segment file (1 GiB with 8 KiB pages).
pub const RELSEG_SIZE: u32 = 131072;

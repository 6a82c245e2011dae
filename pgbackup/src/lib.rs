//! pgbackup library
//!
//! PostgreSQL physical backup engine: a catalog of FULL and incremental
//! backups, a WAL archive, restore, merge, retention and catchup of a
//! live data directory.

pub mod catalog;
pub mod catchup;
pub mod chain;
pub mod config;
pub mod executor;
pub mod fs;
pub mod interrupt;
pub mod merge;
pub mod pg;
pub mod restore;
pub mod retention;
pub mod show;
pub mod source;
pub mod tracking;
pub mod utils;
pub mod validate;
pub mod wal;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{EngineError, Result};

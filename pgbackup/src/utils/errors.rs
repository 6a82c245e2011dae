//! Error types for the backup engine.
//!
//! Messages are part of the operator contract: tooling matches on literal
//! substrings, so wording here should only change deliberately.

use crate::pg::Lsn;
use std::path::Path;
use thiserror::Error;

/// Problems found while locating or decoding WAL.
#[derive(Error, Debug)]
pub enum WalError {
    #[error("WAL segment \"{name}\" is absent")]
    SegmentMissing { name: String },

    #[error("WAL segment \"{name}\" is corrupted: {reason}")]
    SegmentCorrupt { name: String, reason: String },

    #[error(
        "WAL file \"{name}\" is from different database system: WAL file database system identifier is {found}, pg_control database system identifier is {expected}"
    )]
    ForeignSystem {
        name: String,
        expected: u64,
        found: u64,
    },

    #[error("Could not read WAL record at {lsn}: {reason}")]
    RecordInvalid { lsn: Lsn, reason: String },
}

/// Problems reading a `backup.control` file.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Control file \"{0}\" doesn't exist")]
    Missing(String),

    #[error("Control file \"{0}\" is empty")]
    Empty(String),

    #[error("Control file \"{path}\" contains invalid option \"{key}\"")]
    InvalidOption { path: String, key: String },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot {action} \"{path}\": {source}")]
    File {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Corruption(String),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("{0}")]
    Chain(String),

    #[error("{0}")]
    Precondition(String),

    #[error("{0}")]
    ResourceExhausted(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Locked(String),

    #[error("{0}")]
    Interrupted(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

/// Coarse error taxonomy used to decide what gets recorded against a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Corruption,
    WalGap,
    ChainInconsistency,
    Precondition,
    ResourceExhaustion,
    Interrupted,
    Other,
}

impl ErrorClass {
    /// Corruption, WAL gaps and chain problems are recorded permanently in
    /// the affected backup's status.
    pub fn is_recorded(self) -> bool {
        matches!(
            self,
            ErrorClass::Corruption | ErrorClass::WalGap | ErrorClass::ChainInconsistency
        )
    }
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Corruption(_) | EngineError::Control(_) => ErrorClass::Corruption,
            EngineError::Wal(_) => ErrorClass::WalGap,
            EngineError::Chain(_) | EngineError::NotFound(_) => ErrorClass::ChainInconsistency,
            EngineError::Precondition(_)
            | EngineError::Locked(_)
            | EngineError::Unsupported(_)
            | EngineError::Config(_) => ErrorClass::Precondition,
            EngineError::ResourceExhausted(_) | EngineError::Timeout(_) => {
                ErrorClass::ResourceExhaustion
            }
            EngineError::Interrupted(_) => ErrorClass::Interrupted,
            _ => ErrorClass::Other,
        }
    }

    /// Attach the failing action and path to an I/O error.
    pub fn file(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        EngineError::File {
            action,
            path: path.display().to_string(),
            source,
        }
    }

    pub fn interrupted() -> Self {
        EngineError::Interrupted("Interrupted by signal".to_string())
    }

    /// True when the underlying I/O error means "no such file".
    pub fn is_not_found(&self) -> bool {
        match self {
            EngineError::Io(e) | EngineError::File { source: e, .. } => {
                e.kind() == std::io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

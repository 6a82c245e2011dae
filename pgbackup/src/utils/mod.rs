//! Utility modules for the backup engine.

pub mod errors;
pub mod logger;
pub mod pool;

pub use errors::{ControlError, EngineError, ErrorClass, Result, WalError};

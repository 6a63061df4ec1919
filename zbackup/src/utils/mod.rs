//! Utility modules for zbackup.

pub mod errors;
pub mod logger;

pub use errors::{BackupError, Result};

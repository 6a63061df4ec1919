//! zbackup library
//!
//! Incremental, resumable directory backups between a local tree and a local
//! or SSH-reachable destination, with per-run snapshots and optional
//! checksum verification.

pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod runner;
pub mod snapshot;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::{BackupConfig, BackupMode, ChecksumAlgo};
pub use runner::{run, run_with, RunSummary};
pub use utils::errors::BackupError;
pub use utils::Result;

//! Versioned snapshots of a destination tree.

pub mod checkpoint;
pub mod store;

pub use checkpoint::{Checkpoint, Clock, SystemClock};
pub use store::{run_log_path, SnapshotStore};

use crate::fs::metadata::FileMeta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State of the destination after a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub source_root: String,
    pub dest_root: String,

    /// Relative path -> metadata
    #[serde(default)]
    pub files: BTreeMap<String, FileMeta>,

    /// False while the run that produced it is unfinished or failed
    pub completed: bool,
}

impl Snapshot {
    pub fn new(
        name: impl Into<String>,
        source_root: impl Into<String>,
        dest_root: impl Into<String>,
        files: BTreeMap<String, FileMeta>,
        completed: bool,
    ) -> Self {
        Self {
            name: name.into(),
            created_at: Utc::now(),
            source_root: source_root.into(),
            dest_root: dest_root.into(),
            files,
            completed,
        }
    }

    /// Total bytes of the files it records
    pub fn total_bytes(&self) -> u64 {
        self.files.values().filter(|m| !m.is_dir).map(|m| m.size).sum()
    }
}

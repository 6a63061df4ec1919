//! Planned operations of a backup run.

use crate::fs::metadata::FileMeta;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What to do with one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferAction {
    /// Copy a local source file to the destination
    Upload,
    /// Copy a remote source file to the local destination
    Download,
    Delete,
    Mkdir,
    Skip,
}

impl TransferAction {
    /// Upload and download move file contents; nothing else does
    pub fn is_copy(self) -> bool {
        matches!(self, TransferAction::Upload | TransferAction::Download)
    }
}

impl fmt::Display for TransferAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferAction::Upload => "upload",
            TransferAction::Download => "download",
            TransferAction::Delete => "delete",
            TransferAction::Mkdir => "mkdir",
            TransferAction::Skip => "skip",
        };
        f.write_str(name)
    }
}

/// One planned operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItem {
    pub rel_path: String,

    /// Source metadata for copies and mkdirs, baseline metadata for skips and deletes
    pub meta: FileMeta,

    pub action: TransferAction,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TransferItem {
    pub fn new(meta: FileMeta, action: TransferAction) -> Self {
        Self {
            rel_path: meta.rel_path.clone(),
            meta,
            action,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Ordered operations plus totals over the copies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub items: Vec<TransferItem>,
    pub total_files: usize,
    pub total_bytes: u64,
}

impl Plan {
    /// Append an item; only uploads and downloads count toward the totals
    pub fn push(&mut self, item: TransferItem) {
        if item.action.is_copy() {
            self.total_files += 1;
            self.total_bytes += item.meta.size;
        }
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of items with the given action
    pub fn count(&self, action: TransferAction) -> usize {
        self.items.iter().filter(|item| item.action == action).count()
    }
}

//! Diff planner: turns a source listing and a baseline snapshot into a plan.
//!
//! Ordering guarantees:
//! - directories are created parents first (depth ascending, then by path);
//! - files follow in path order;
//! - in full mode, deletions come last: files by path, then directories
//!   deepest first and in reverse path order, so a directory is only removed
//!   after everything below it.

use crate::config::{BackupConfig, BackupMode};
use crate::fs::metadata::{normalize_rel, FileMeta};
use crate::snapshot::Snapshot;
use crate::sync::plan::{Plan, TransferAction, TransferItem};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Reason attached to skipped files
pub const UNCHANGED_REASON: &str = "unchanged file";

/// Build the ordered plan for one run
pub fn build_plan(current: &[FileMeta], baseline: Option<&Snapshot>, config: &BackupConfig) -> Plan {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut seen = HashSet::with_capacity(current.len());

    for meta in current {
        let mut meta = meta.clone();
        meta.rel_path = normalize_rel(&meta.rel_path);
        if meta.rel_path.is_empty() {
            continue;
        }
        seen.insert(meta.rel_path.clone());
        if meta.is_dir {
            dirs.push(meta);
        } else {
            files.push(meta);
        }
    }

    dirs.sort_by(|a, b| a.depth().cmp(&b.depth()).then_with(|| a.rel_path.cmp(&b.rel_path)));
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

    let mut plan = Plan::default();

    for dir in dirs {
        if !should_skip(&dir, baseline, config) {
            plan.push(TransferItem::new(dir, TransferAction::Mkdir));
        }
    }

    let copy_action = if config.source.is_remote() {
        TransferAction::Download
    } else {
        TransferAction::Upload
    };

    for file in files {
        let recorded = baseline.and_then(|snapshot| snapshot.files.get(&file.rel_path));
        match recorded {
            Some(old) if should_skip(&file, baseline, config) => {
                plan.push(TransferItem::new(old.clone(), TransferAction::Skip).with_reason(UNCHANGED_REASON));
            }
            _ => plan.push(TransferItem::new(file, copy_action)),
        }
    }

    if let (Some(snapshot), BackupMode::Full) = (baseline, config.mode) {
        let (mut gone_dirs, mut gone_files): (Vec<&FileMeta>, Vec<&FileMeta>) = snapshot
            .files
            .values()
            .filter(|old| !seen.contains(&old.rel_path))
            .partition(|old| old.is_dir);

        gone_files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        gone_dirs.sort_by(|a, b| deepest_first(a, b));

        for old in gone_files.into_iter().chain(gone_dirs) {
            plan.push(TransferItem::new(old.clone(), TransferAction::Delete));
        }
    }

    plan
}

fn deepest_first(a: &FileMeta, b: &FileMeta) -> Ordering {
    b.depth().cmp(&a.depth()).then_with(|| b.rel_path.cmp(&a.rel_path))
}

/// Decide whether `current` needs no work given the baseline.
///
/// Directories skip when the baseline has a directory at the same path.
/// Files never skip in full mode or without a baseline; otherwise they skip
/// when size and modification time match exactly, unless checksums are
/// enabled and both sides carry differing ones.
pub fn should_skip(current: &FileMeta, baseline: Option<&Snapshot>, config: &BackupConfig) -> bool {
    let Some(snapshot) = baseline else {
        return false;
    };
    let Some(old) = snapshot.files.get(&current.rel_path) else {
        return false;
    };

    if current.is_dir {
        return old.is_dir;
    }
    if config.mode == BackupMode::Full || old.is_dir {
        return false;
    }
    if old.size != current.size || old.mod_time != current.mod_time {
        return false;
    }
    if config.checksum.is_enabled() {
        if let (Some(a), Some(b)) = (&old.checksum, &current.checksum) {
            if a != b {
                return false;
            }
        }
    }
    true
}

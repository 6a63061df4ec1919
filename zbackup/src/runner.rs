//! One backup run from configuration to persisted snapshot.
//!
//! validate -> open endpoints -> load latest/pending -> list source -> plan
//! -> execute (checkpointing as items complete) -> merge -> save.
//!
//! A pending snapshot left by an interrupted run becomes the baseline and
//! keeps its name, so the rerun continues where the last one stopped.

use crate::config::BackupConfig;
use crate::executor::{TransferExecutor, TransferResult};
use crate::fs::metadata::FileMeta;
use crate::fs::{open_filesystem, FileSystem};
use crate::snapshot::{run_log_path, Checkpoint, Snapshot, SnapshotStore, SystemClock};
use crate::sync::{build_plan, Plan, TransferAction};
use crate::transfer::progress::{format_bytes, Progress};
use crate::utils::logger::{self, RunLogGuard};
use crate::utils::{BackupError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

/// What a run did
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub snapshot_name: String,
    pub plan: Plan,

    /// Entries (files and directories) applied successfully
    pub transferred: usize,

    pub failed: usize,
    pub dry_run: bool,
}

/// Run a backup against the endpoints named in `config`
pub fn run(config: &BackupConfig, cancel: &CancellationToken, progress: Arc<dyn Progress>) -> Result<RunSummary> {
    let mut config = config.clone();
    config.validate()?;
    config.absolutize()?;

    let src = open_filesystem(&config.source)?;
    let dst = match open_filesystem(&config.dest) {
        Ok(dst) => dst,
        Err(e) => {
            close_quietly(src.as_ref(), "source");
            return Err(e);
        }
    };

    run_with(&config, src, dst, cancel, progress)
}

/// Run a backup over already opened filesystems. Both are closed before returning.
pub fn run_with(
    config: &BackupConfig,
    src: Arc<dyn FileSystem>,
    dst: Arc<dyn FileSystem>,
    cancel: &CancellationToken,
    progress: Arc<dyn Progress>,
) -> Result<RunSummary> {
    let mut config = config.clone();
    let outcome = config.validate().and_then(|()| {
        let run_log = open_run_log(&config, dst.as_ref());
        let outcome = execute_run(&config, src.clone(), dst.clone(), cancel, progress);
        if let Some(run_log) = run_log {
            if let Err(e) = run_log.finish() {
                warn!(error = %e, "Failed to write run log");
            }
        }
        outcome
    });

    close_quietly(src.as_ref(), "source");
    close_quietly(dst.as_ref(), "destination");
    outcome
}

fn execute_run(
    config: &BackupConfig,
    src: Arc<dyn FileSystem>,
    dst: Arc<dyn FileSystem>,
    cancel: &CancellationToken,
    progress: Arc<dyn Progress>,
) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let span = info_span!("run", run_id = %run_id);
    let _enter = span.enter();

    info!(
        source = %config.source,
        dest = %config.dest,
        mode = %config.mode,
        checksum = %config.checksum,
        dry_run = config.dry_run,
        "Starting backup"
    );

    let root = src.stat("").map_err(|e| {
        if e.is_not_found() {
            BackupError::Config(format!("source {} does not exist", config.source))
        } else {
            e
        }
    })?;
    if !root.is_dir {
        return Err(BackupError::Config(format!("source {} is not a directory", config.source)));
    }

    let store = Arc::new(SnapshotStore::new(dst.clone()));
    let latest = store.load_latest()?;
    let pending = store.load_pending()?;

    let (baseline, name) = match pending {
        Some(pending) => {
            info!(snapshot = %pending.name, files = pending.files.len(), "Resuming unfinished snapshot");
            let name = pending.name.clone();
            (Some(pending), name)
        }
        None => {
            if let Some(latest) = &latest {
                info!(baseline = %latest.name, files = latest.files.len(), "Using latest snapshot as baseline");
            }
            (latest, config.snapshot_name().to_string())
        }
    };

    let current = src.list(&config.excludes)?;
    let plan = build_plan(&current, baseline.as_ref(), config);
    info!(
        snapshot = %name,
        entries = current.len(),
        items = plan.len(),
        files = plan.total_files,
        bytes = %format_bytes(plan.total_bytes),
        "Plan built"
    );

    if config.dry_run {
        for item in &plan.items {
            info!(
                action = %item.action,
                path = %item.rel_path,
                size = item.meta.size,
                reason = item.reason.as_deref().unwrap_or(""),
                "[dry-run]"
            );
        }
        return Ok(RunSummary {
            run_id,
            snapshot_name: name,
            plan,
            transferred: 0,
            failed: 0,
            dry_run: true,
        });
    }

    let checkpoint = Checkpoint::new(
        store.clone(),
        Arc::new(SystemClock),
        baseline.as_ref(),
        &name,
        src.root(),
        dst.root(),
    );
    let executor = TransferExecutor::new(src.clone(), dst.clone(), config.checksum).with_progress(progress);
    let (result, outcome) = executor.execute(&plan, cancel, &checkpoint);

    if let Err(e) = checkpoint.flush() {
        warn!(error = %e, "Failed to flush checkpoint");
    }

    let files = merge_snapshot(baseline.as_ref(), &plan, &result)?;
    let snapshot = Snapshot::new(&name, src.root(), dst.root(), files, outcome.is_ok());
    store.save(&snapshot)?;

    let summary = RunSummary {
        run_id,
        snapshot_name: name,
        plan,
        transferred: result.success.len(),
        failed: result.failed.len(),
        dry_run: false,
    };

    match outcome {
        Ok(()) => {
            if let Err(e) = store.clear_pending() {
                warn!(error = %e, "Failed to clear pending snapshot");
            }
            info!(
                snapshot = %snapshot.name,
                files = snapshot.files.len(),
                bytes = %format_bytes(snapshot.total_bytes()),
                "Backup completed"
            );
            Ok(summary)
        }
        Err(e) => {
            if let Err(save_err) = store.save_pending(&snapshot) {
                warn!(error = %save_err, "Failed to save pending snapshot");
            }
            error!(
                snapshot = %snapshot.name,
                transferred = summary.transferred,
                failed = summary.failed,
                error = %e,
                "Backup incomplete, progress kept for resume"
            );
            Err(e)
        }
    }
}

/// Combine the baseline with what this run did.
///
/// Successes override the baseline, deletes drop entries and skips restore the
/// baseline entry verbatim. A skip without a baseline entry is an error.
pub fn merge_snapshot(
    baseline: Option<&Snapshot>,
    plan: &Plan,
    result: &TransferResult,
) -> Result<BTreeMap<String, FileMeta>> {
    let mut files = baseline.map(|b| b.files.clone()).unwrap_or_default();

    for (rel, meta) in &result.success {
        let mut meta = meta.clone();
        meta.rel_path = rel.clone();
        files.insert(rel.clone(), meta);
    }

    for item in &plan.items {
        match item.action {
            TransferAction::Delete => {
                files.remove(&item.rel_path);
            }
            TransferAction::Skip => {
                let recorded = baseline
                    .and_then(|b| b.files.get(&item.rel_path))
                    .ok_or_else(|| {
                        BackupError::Inconsistent(format!("skipped {} has no baseline entry", item.rel_path))
                    })?;
                files.insert(item.rel_path.clone(), recorded.clone());
            }
            _ => {}
        }
    }

    Ok(files)
}

/// Route this thread's log events to the destination for the run
fn open_run_log(config: &BackupConfig, dst: &dyn FileSystem) -> Option<RunLogGuard> {
    if config.dry_run || !config.dest_log {
        return None;
    }
    let rel = run_log_path(config.snapshot_name());
    match dst.create(&rel, 0o644) {
        Ok(writer) => {
            let guard = logger::attach_run_log(writer);
            info!(path = %rel, "Writing run log to destination");
            Some(guard)
        }
        Err(e) => {
            warn!(path = %rel, error = %e, "Failed to create run log");
            None
        }
    }
}

fn close_quietly(fs: &dyn FileSystem, side: &str) {
    if let Err(e) = fs.close() {
        warn!(side, error = %e, "Failed to close filesystem");
    }
}

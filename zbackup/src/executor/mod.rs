//! Transfer executor - applies a plan to the destination.
//!
//! Items run one at a time in plan order; mkdir and delete ordering depends on
//! it. Cancellation is checked between items only. A failed mkdir or copy is
//! recorded and the run moves on; failed deletes are only logged.

pub mod verify;

use crate::config::ChecksumAlgo;
use crate::fs::metadata::FileMeta;
use crate::fs::FileSystem;
use crate::sync::plan::{Plan, TransferAction, TransferItem};
use crate::transfer::progress::{average_speed, format_bytes, format_speed, NoopProgress, Progress};
use crate::transfer::tee::TeeWriter;
use crate::utils::{BackupError, Result};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use verify::{hash_reader, Digester};

/// Mode applied to created files whose source mode is unknown
const DEFAULT_FILE_MODE: u32 = 0o644;

/// Notified after each mkdir or copy that succeeded
pub trait TransferObserver: Send + Sync {
    fn on_complete(&self, item: &TransferItem, meta: &FileMeta);
}

impl<F> TransferObserver for F
where
    F: Fn(&TransferItem, &FileMeta) + Send + Sync,
{
    fn on_complete(&self, item: &TransferItem, meta: &FileMeta) {
        self(item, meta)
    }
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TransferObserver for NoopObserver {
    fn on_complete(&self, _item: &TransferItem, _meta: &FileMeta) {}
}

/// Outcome of executing a plan
#[derive(Debug, Default)]
pub struct TransferResult {
    /// Relative path -> confirmed metadata (checksum set when verified)
    pub success: BTreeMap<String, FileMeta>,

    /// Relative path -> why it failed
    pub failed: BTreeMap<String, BackupError>,
}

impl TransferResult {
    /// Bytes of the files copied successfully
    pub fn transferred_bytes(&self) -> u64 {
        self.success.values().filter(|m| !m.is_dir).map(|m| m.size).sum()
    }

    /// Number of files copied successfully
    pub fn transferred_files(&self) -> usize {
        self.success.values().filter(|m| !m.is_dir).count()
    }
}

/// Runs plan items against a source/destination pair
pub struct TransferExecutor {
    src: Arc<dyn FileSystem>,
    dst: Arc<dyn FileSystem>,
    checksum: ChecksumAlgo,
    progress: Arc<dyn Progress>,
}

impl TransferExecutor {
    pub fn new(src: Arc<dyn FileSystem>, dst: Arc<dyn FileSystem>, checksum: ChecksumAlgo) -> Self {
        Self {
            src,
            dst,
            checksum,
            progress: Arc::new(NoopProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    /// Execute every item of `plan` in order.
    ///
    /// Always returns what was accomplished. The error is `Cancelled` when the
    /// token fired, `ItemsFailed(n)` when any mkdir or copy failed.
    pub fn execute(
        &self,
        plan: &Plan,
        cancel: &CancellationToken,
        observer: &dyn TransferObserver,
    ) -> (TransferResult, Result<()>) {
        let start = Instant::now();
        let mut result = TransferResult::default();

        info!(
            items = plan.len(),
            files = plan.total_files,
            bytes = plan.total_bytes,
            checksum = %self.checksum,
            "Executing transfer plan"
        );
        self.progress.start(plan.total_files, plan.total_bytes);

        for item in &plan.items {
            if cancel.is_cancelled() {
                self.progress.finish();
                warn!(completed = result.success.len(), "Transfer cancelled");
                return (result, Err(BackupError::Cancelled));
            }

            let rel = &item.rel_path;
            match item.action {
                TransferAction::Mkdir => match self.dst.mkdir_all(rel) {
                    Ok(()) => {
                        debug!(path = %rel, "Directory created");
                        observer.on_complete(item, &item.meta);
                        result.success.insert(rel.clone(), item.meta.clone());
                    }
                    Err(e) => {
                        let e = BackupError::transfer("mkdir", rel, e);
                        error!(path = %rel, error = %e, "Failed to create directory");
                        result.failed.insert(rel.clone(), e);
                    }
                },
                TransferAction::Upload | TransferAction::Download => match self.copy_file(item) {
                    Ok(meta) => {
                        info!(path = %rel, size = meta.size, action = %item.action, "Transferred");
                        observer.on_complete(item, &meta);
                        result.success.insert(rel.clone(), meta);
                    }
                    Err(e) => {
                        error!(path = %rel, error = %e, "Transfer failed");
                        result.failed.insert(rel.clone(), e);
                    }
                },
                TransferAction::Delete => match self.dst.remove(rel) {
                    Ok(()) => debug!(path = %rel, "Deleted"),
                    Err(e) => warn!(path = %rel, error = %e, "Failed to delete"),
                },
                TransferAction::Skip => {
                    debug!(path = %rel, reason = item.reason.as_deref().unwrap_or(""), "Skipped");
                }
            }
        }

        self.progress.finish();

        let elapsed = start.elapsed();
        let bytes = result.transferred_bytes();
        info!(
            transferred = result.transferred_files(),
            failed = result.failed.len(),
            bytes = %format_bytes(bytes),
            speed = %format_speed(average_speed(bytes, elapsed)),
            elapsed_ms = elapsed.as_millis() as u64,
            "Transfer finished"
        );

        if !result.failed.is_empty() {
            let failed = result.failed.len();
            return (result, Err(BackupError::ItemsFailed(failed)));
        }
        (result, Ok(()))
    }

    /// Copy one file and verify it when checksums are enabled
    fn copy_file(&self, item: &TransferItem) -> Result<FileMeta> {
        let rel = item.rel_path.as_str();
        self.progress.next_file(rel);

        let source_digest = if self.checksum.is_enabled() {
            self.remote_digest(self.src.as_ref(), rel)
        } else {
            None
        };

        let mut reader = self
            .src
            .open(rel)
            .map_err(|e| BackupError::transfer("open", rel, e))?;
        let writer = self
            .dst
            .create(rel, file_mode(item.meta.mode))
            .map_err(|e| BackupError::transfer("create", rel, e))?;

        // Hash the stream only when the source could not hash remotely
        let mut digester = match source_digest {
            Some(_) => None,
            None => Digester::new(self.checksum),
        };

        let mut tee = TeeWriter::new(writer, self.progress.as_ref(), digester.as_mut());
        io::copy(&mut reader, &mut tee).map_err(|e| BackupError::transfer("copy", rel, e.into()))?;
        tee.flush().map_err(|e| BackupError::transfer("copy", rel, e.into()))?;
        let copied = tee.bytes_written();
        drop(reader);
        tee.into_inner()
            .commit()
            .map_err(|e| BackupError::transfer("commit", rel, e))?;
        debug!(path = %rel, bytes = copied, "Copied");

        let mut meta = item.meta.clone();
        if !self.checksum.is_enabled() {
            return Ok(meta);
        }

        let source_digest = match (source_digest, digester) {
            (Some(digest), _) => digest,
            (None, Some(digester)) => digester.finalize(),
            (None, None) => {
                return Err(BackupError::transfer(
                    "verify",
                    rel,
                    BackupError::HashUnavailable(self.checksum.to_string()),
                ))
            }
        };
        let dest_digest = self
            .dest_digest(rel)
            .map_err(|e| BackupError::transfer("verify", rel, e))?;

        if source_digest != dest_digest {
            return Err(BackupError::transfer(
                "verify",
                rel,
                BackupError::Verification(format!(
                    "source {} != destination {}",
                    hex::encode(&source_digest),
                    hex::encode(&dest_digest)
                )),
            ));
        }

        meta.checksum = Some(hex::encode(source_digest));
        Ok(meta)
    }

    /// Destination digest: remote when possible, else read it back
    fn dest_digest(&self, rel: &str) -> Result<Vec<u8>> {
        if let Some(digest) = self.remote_digest(self.dst.as_ref(), rel) {
            return Ok(digest);
        }
        let mut reader = self.dst.open(rel)?;
        hash_reader(&mut reader, self.checksum)
    }

    /// Digest computed where the data lives, if that side can do it
    fn remote_digest(&self, fs: &dyn FileSystem, rel: &str) -> Option<Vec<u8>> {
        let hasher = fs.as_remote_hash()?;
        match hasher.compute_remote_hash(rel, self.checksum) {
            Ok(digest) => Some(digest),
            Err(e) if e.is_hash_unavailable() => {
                debug!(path = %rel, error = %e, "Remote hash unavailable, hashing locally");
                None
            }
            Err(e) => {
                warn!(path = %rel, error = %e, "Remote hash failed, hashing locally");
                None
            }
        }
    }
}

fn file_mode(mode: u32) -> u32 {
    if mode & 0o777 == 0 {
        DEFAULT_FILE_MODE
    } else {
        mode & 0o7777
    }
}

//! Resumable progress for a running backup.
//!
//! A checkpoint starts from the baseline's file map, overlays each item as it
//! completes and saves the result as the pending snapshot. Saves are rate
//! limited to one per [`FLUSH_INTERVAL`]; `flush` forces one.

use crate::executor::TransferObserver;
use crate::fs::metadata::FileMeta;
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::sync::plan::TransferItem;
use crate::utils::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Minimum time between two pending-snapshot saves triggered by `record`
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(3);

/// Time source for flush rate limiting
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct State {
    snapshot: Snapshot,
    last_flush: Instant,
    dirty: bool,
}

/// Accumulates completed items and persists them as the pending snapshot
pub struct Checkpoint {
    store: Arc<SnapshotStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    state: Mutex<State>,
}

impl Checkpoint {
    pub fn new(
        store: Arc<SnapshotStore>,
        clock: Arc<dyn Clock>,
        baseline: Option<&Snapshot>,
        name: &str,
        source_root: &str,
        dest_root: &str,
    ) -> Self {
        let files = baseline.map(|b| b.files.clone()).unwrap_or_default();
        let snapshot = Snapshot::new(name, source_root, dest_root, files, false);
        let last_flush = clock.now();

        Self {
            store,
            clock,
            interval: FLUSH_INTERVAL,
            state: Mutex::new(State {
                snapshot,
                last_flush,
                dirty: false,
            }),
        }
    }

    /// Overlay one completed entry; persists when the flush interval has elapsed
    pub fn record(&self, meta: FileMeta) -> Result<()> {
        let mut state = self.lock();
        state.snapshot.files.insert(meta.rel_path.clone(), meta);
        state.dirty = true;

        if self.clock.now().duration_since(state.last_flush) >= self.interval {
            return self.flush_locked(&mut state);
        }
        Ok(())
    }

    /// Persist now if anything changed since the last save
    pub fn flush(&self) -> Result<()> {
        let mut state = self.lock();
        self.flush_locked(&mut state)
    }

    /// Current file map
    pub fn files(&self) -> BTreeMap<String, FileMeta> {
        self.lock().snapshot.files.clone()
    }

    fn flush_locked(&self, state: &mut State) -> Result<()> {
        if !state.dirty {
            return Ok(());
        }
        state.snapshot.completed = false;
        self.store.save_pending(&state.snapshot)?;
        state.last_flush = self.clock.now();
        state.dirty = false;
        debug!(name = %state.snapshot.name, files = state.snapshot.files.len(), "Checkpoint flushed");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TransferObserver for Checkpoint {
    fn on_complete(&self, item: &TransferItem, meta: &FileMeta) {
        if let Err(e) = self.record(meta.clone()) {
            warn!(path = %item.rel_path, error = %e, "Failed to record checkpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChecksumAlgo;
    use crate::executor::TransferExecutor;
    use crate::fs::{FileSystem, FileWriter, LocalFs};
    use crate::sync::plan::{Plan, TransferAction};
    use crate::utils::BackupError;
    use chrono::Utc;
    use std::io::Read;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Destination whose writes all fail
    struct UnwritableFs(LocalFs);

    impl FileSystem for UnwritableFs {
        fn root(&self) -> &str {
            self.0.root()
        }
        fn list(&self, excludes: &[String]) -> Result<Vec<FileMeta>> {
            self.0.list(excludes)
        }
        fn open(&self, rel: &str) -> Result<Box<dyn Read + Send>> {
            self.0.open(rel)
        }
        fn create(&self, _rel: &str, _mode: u32) -> Result<Box<dyn FileWriter>> {
            Err(BackupError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only destination",
            )))
        }
        fn mkdir_all(&self, rel: &str) -> Result<()> {
            self.0.mkdir_all(rel)
        }
        fn remove(&self, rel: &str) -> Result<()> {
            self.0.remove(rel)
        }
        fn stat(&self, rel: &str) -> Result<FileMeta> {
            self.0.stat(rel)
        }
        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Clock advanced by hand
    struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            }
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }
    }

    fn setup(dir: &TempDir) -> (Arc<SnapshotStore>, Arc<ManualClock>) {
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFs::new(dir.path().to_string_lossy()));
        (Arc::new(SnapshotStore::new(fs)), Arc::new(ManualClock::new()))
    }

    #[test]
    fn test_record_defers_until_interval() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, clock) = setup(&dir);
        let checkpoint = Checkpoint::new(store.clone(), clock.clone(), None, "run", "/src", "/dst");

        checkpoint.record(FileMeta::file("a.txt", 1, Utc::now()))?;
        assert!(store.load_pending()?.is_none());

        clock.advance(Duration::from_secs(2));
        checkpoint.record(FileMeta::file("b.txt", 1, Utc::now()))?;
        assert!(store.load_pending()?.is_none());

        clock.advance(Duration::from_secs(1));
        checkpoint.record(FileMeta::file("c.txt", 1, Utc::now()))?;
        let pending = store.load_pending()?.unwrap();
        assert_eq!(pending.name, "run");
        assert!(!pending.completed);
        assert_eq!(pending.files.len(), 3);

        Ok(())
    }

    #[test]
    fn test_flush_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, clock) = setup(&dir);
        let checkpoint = Checkpoint::new(store.clone(), clock, None, "run", "/src", "/dst");

        // Nothing recorded, nothing written
        checkpoint.flush()?;
        assert!(store.load_pending()?.is_none());

        checkpoint.record(FileMeta::file("a.txt", 1, Utc::now()))?;
        checkpoint.flush()?;
        assert_eq!(store.load_pending()?.unwrap().files.len(), 1);

        // A second flush must not rewrite the record
        store.clear_pending()?;
        checkpoint.flush()?;
        assert!(store.load_pending()?.is_none());

        Ok(())
    }

    #[test]
    fn test_seeded_from_baseline() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, clock) = setup(&dir);
        let mut files = BTreeMap::new();
        files.insert("old.txt".to_string(), FileMeta::file("old.txt", 5, Utc::now()));
        let baseline = Snapshot::new("prev", "/src", "/dst", files, true);

        let checkpoint = Checkpoint::new(store, clock, Some(&baseline), "run", "/src", "/dst");
        checkpoint.record(FileMeta::file("new.txt", 1, Utc::now()))?;

        let files = checkpoint.files();
        assert!(files.contains_key("old.txt"));
        assert!(files.contains_key("new.txt"));
        Ok(())
    }

    #[test]
    fn test_concurrent_records() -> Result<()> {
        let dir = TempDir::new()?;
        let (store, clock) = setup(&dir);
        let checkpoint = Arc::new(Checkpoint::new(store.clone(), clock, None, "run", "/src", "/dst"));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let checkpoint = checkpoint.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let name = format!("t{}/f{}.txt", t, i);
                        checkpoint.record(FileMeta::file(name, 1, Utc::now())).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        checkpoint.flush()?;
        assert_eq!(store.load_pending()?.unwrap().files.len(), 100);
        Ok(())
    }

    #[test]
    fn test_persist_failure_does_not_abort_transfer() -> Result<()> {
        let src_dir = TempDir::new()?;
        let dst_dir = TempDir::new()?;
        let meta_dir = TempDir::new()?;
        std::fs::write(src_dir.path().join("a.txt"), b"aaa")?;
        std::fs::write(src_dir.path().join("b.txt"), b"bb")?;

        let meta_fs: Arc<dyn FileSystem> = Arc::new(UnwritableFs(LocalFs::new(meta_dir.path().to_string_lossy())));
        let clock = Arc::new(ManualClock::new());
        let checkpoint = Checkpoint::new(Arc::new(SnapshotStore::new(meta_fs)), clock.clone(), None, "run", "/src", "/dst");
        // Every record is due for a save
        clock.advance(FLUSH_INTERVAL * 10);

        let src: Arc<dyn FileSystem> = Arc::new(LocalFs::new(src_dir.path().to_string_lossy()));
        let mut plan = Plan::default();
        for meta in src.list(&[])? {
            plan.push(TransferItem::new(meta, TransferAction::Upload));
        }
        let executor = TransferExecutor::new(
            src,
            Arc::new(LocalFs::new(dst_dir.path().to_string_lossy())),
            ChecksumAlgo::Sha256,
        );

        let (result, outcome) = executor.execute(&plan, &CancellationToken::new(), &checkpoint);
        outcome?;
        assert_eq!(result.success.len(), 2);
        assert!(result.failed.is_empty());
        assert_eq!(std::fs::read(dst_dir.path().join("a.txt"))?, b"aaa");

        let files = checkpoint.files();
        assert!(files.contains_key("a.txt"));
        assert!(files.contains_key("b.txt"));
        assert!(checkpoint.flush().is_err());
        Ok(())
    }
}

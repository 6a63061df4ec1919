//! Snapshot persistence on the destination.
//!
//! Layout under the destination root:
//!
//! ```text
//! .zbackup/latest                 name of the latest completed snapshot
//! .zbackup/pending                name of the in-progress snapshot, if any
//! .zbackup/snapshots/<name>.json  one record per run
//! .zbackup/inflight/<name>.json   in-progress record used to resume
//! .zbackup/logs/backup-<name>.log  log of the run that started <name>
//! ```
//!
//! Writing a record and then moving the `latest` pointer are two separate
//! writes. A crash in between leaves a valid record that is not yet latest.

use crate::fs::FileSystem;
use crate::snapshot::Snapshot;
use crate::utils::{BackupError, Result};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

pub const META_DIR: &str = ".zbackup";
const SNAPSHOT_DIR: &str = ".zbackup/snapshots";
const INFLIGHT_DIR: &str = ".zbackup/inflight";
const LATEST_POINTER: &str = ".zbackup/latest";
const PENDING_POINTER: &str = ".zbackup/pending";
const LOG_DIR: &str = ".zbackup/logs";

/// Where the log of the run writing snapshot `name` is kept
pub fn run_log_path(name: &str) -> String {
    format!("{}/backup-{}.log", LOG_DIR, name)
}

/// Reads and writes snapshots through the destination filesystem
pub struct SnapshotStore {
    fs: Arc<dyn FileSystem>,
}

impl SnapshotStore {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    /// The snapshot `latest` points at, or `None` before the first completed run
    pub fn load_latest(&self) -> Result<Option<Snapshot>> {
        match self.read_pointer(LATEST_POINTER)? {
            Some(name) => self.load(&name),
            None => Ok(None),
        }
    }

    /// A snapshot by name, or `None` when no such record exists
    pub fn load(&self, name: &str) -> Result<Option<Snapshot>> {
        self.read_record(&record_path(SNAPSHOT_DIR, name))
    }

    /// The in-progress snapshot of an interrupted run, if any
    pub fn load_pending(&self) -> Result<Option<Snapshot>> {
        match self.read_pointer(PENDING_POINTER)? {
            Some(name) => self.read_record(&record_path(INFLIGHT_DIR, &name)),
            None => Ok(None),
        }
    }

    /// Write a snapshot record. `latest` only moves for completed snapshots.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        self.write_record(SNAPSHOT_DIR, snapshot)?;
        if snapshot.completed {
            self.write_file(LATEST_POINTER, format!("{}\n", snapshot.name).as_bytes())?;
        }
        debug!(name = %snapshot.name, completed = snapshot.completed, files = snapshot.files.len(), "Snapshot saved");
        Ok(())
    }

    /// Write the in-progress record and point `pending` at it
    pub fn save_pending(&self, snapshot: &Snapshot) -> Result<()> {
        let mut pending = snapshot.clone();
        pending.completed = false;
        self.write_record(INFLIGHT_DIR, &pending)?;
        self.write_file(PENDING_POINTER, format!("{}\n", pending.name).as_bytes())?;
        debug!(name = %pending.name, files = pending.files.len(), "Pending snapshot saved");
        Ok(())
    }

    /// Drop the pending pointer and its record. Clearing twice is fine.
    pub fn clear_pending(&self) -> Result<()> {
        let name = self.read_pointer(PENDING_POINTER)?;
        self.fs.remove(PENDING_POINTER)?;
        if let Some(name) = name {
            self.fs.remove(&record_path(INFLIGHT_DIR, &name))?;
        }
        Ok(())
    }

    fn read_pointer(&self, rel: &str) -> Result<Option<String>> {
        let Some(data) = self.read_file(rel)? else {
            return Ok(None);
        };
        let name = String::from_utf8_lossy(&data).trim().to_string();
        if name.is_empty() {
            return Err(BackupError::Inconsistent(format!("{} is empty", rel)));
        }
        Ok(Some(name))
    }

    fn read_record(&self, rel: &str) -> Result<Option<Snapshot>> {
        match self.read_file(rel)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn write_record(&self, dir: &str, snapshot: &Snapshot) -> Result<()> {
        let data = serde_json::to_vec_pretty(snapshot)?;
        self.fs.mkdir_all(dir)?;
        self.write_file(&record_path(dir, &snapshot.name), &data)
    }

    fn read_file(&self, rel: &str) -> Result<Option<Vec<u8>>> {
        let mut reader = match self.fs.open(rel) {
            Ok(reader) => reader,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(Some(data))
    }

    fn write_file(&self, rel: &str, data: &[u8]) -> Result<()> {
        let mut writer = self.fs.create(rel, 0o644)?;
        writer.write_all(data)?;
        writer.commit()
    }
}

fn record_path(dir: &str, name: &str) -> String {
    format!("{}/{}.json", dir, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::metadata::FileMeta;
    use crate::fs::LocalFs;
    use chrono::DateTime;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SnapshotStore {
        SnapshotStore::new(Arc::new(LocalFs::new(dir.path().to_string_lossy())))
    }

    fn sample(name: &str, completed: bool) -> Snapshot {
        let mod_time = DateTime::from_timestamp(1_700_000_000, 42).unwrap();
        let mut files = BTreeMap::new();
        files.insert("dir".to_string(), FileMeta::dir("dir", mod_time));
        let mut file = FileMeta::file("dir/file.txt", 10, mod_time);
        file.checksum = Some("deadbeef".into());
        files.insert(file.rel_path.clone(), file);
        Snapshot::new(name, "/src", "/dst", files, completed)
    }

    #[test]
    fn test_empty_store() -> Result<()> {
        let dir = TempDir::new()?;
        let store = store(&dir);
        assert!(store.load_latest()?.is_none());
        assert!(store.load_pending()?.is_none());
        assert!(store.load("missing")?.is_none());
        store.clear_pending()?;
        Ok(())
    }

    #[test]
    fn test_save_then_load_latest() -> Result<()> {
        let dir = TempDir::new()?;
        let store = store(&dir);
        let snapshot = sample("20240101T000000Z", true);

        store.save(&snapshot)?;
        let loaded = store.load_latest()?.unwrap();
        assert_eq!(loaded.name, snapshot.name);
        assert_eq!(loaded.files, snapshot.files);
        assert!(loaded.completed);

        let pointer = std::fs::read_to_string(dir.path().join(".zbackup/latest"))?;
        assert_eq!(pointer, "20240101T000000Z\n");
        Ok(())
    }

    #[test]
    fn test_incomplete_save_keeps_latest() -> Result<()> {
        let dir = TempDir::new()?;
        let store = store(&dir);
        store.save(&sample("first", true))?;
        store.save(&sample("second", false))?;

        assert_eq!(store.load_latest()?.unwrap().name, "first");
        assert!(!store.load("second")?.unwrap().completed);
        Ok(())
    }

    #[test]
    fn test_pending_round_trip_and_clear() -> Result<()> {
        let dir = TempDir::new()?;
        let store = store(&dir);
        let snapshot = sample("run", true);

        store.save_pending(&snapshot)?;
        let pending = store.load_pending()?.unwrap();
        assert_eq!(pending.name, "run");
        assert_eq!(pending.files, snapshot.files);
        assert!(!pending.completed);

        store.clear_pending()?;
        assert!(store.load_pending()?.is_none());
        assert!(!dir.path().join(".zbackup/inflight/run.json").exists());
        Ok(())
    }

    #[test]
    fn test_pending_does_not_touch_final_record() -> Result<()> {
        let dir = TempDir::new()?;
        let store = store(&dir);
        store.save(&sample("run", true))?;
        store.save_pending(&sample("run", false))?;
        store.clear_pending()?;
        assert!(store.load("run")?.unwrap().completed);
        Ok(())
    }

    #[test]
    fn test_empty_latest_pointer_is_error() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::create_dir_all(dir.path().join(".zbackup"))?;
        std::fs::write(dir.path().join(".zbackup/latest"), "\n")?;
        let err = store(&dir).load_latest().unwrap_err();
        assert!(matches!(err, BackupError::Inconsistent(_)));
        Ok(())
    }

    #[test]
    fn test_corrupt_record_is_error() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::create_dir_all(dir.path().join(".zbackup/snapshots"))?;
        std::fs::write(dir.path().join(".zbackup/snapshots/bad.json"), "{not json")?;
        let err = store(&dir).load("bad").unwrap_err();
        assert!(matches!(err, BackupError::Serialization(_)));
        Ok(())
    }
}

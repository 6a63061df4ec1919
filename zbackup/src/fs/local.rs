//! Local directory endpoint.

use crate::fs::matcher::ExcludeMatcher;
use crate::fs::metadata::{normalize_rel, FileMeta};
use crate::fs::walker::walk_directory;
use crate::fs::{FileSystem, FileWriter, STAGING_SUFFIX};
use crate::utils::Result;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// `FileSystem` over a directory on this machine
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: String,
}

impl LocalFs {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, rel: &str) -> PathBuf {
        let rel = normalize_rel(rel);
        if rel.is_empty() {
            PathBuf::from(&self.root)
        } else {
            Path::new(&self.root).join(rel)
        }
    }
}

impl FileSystem for LocalFs {
    fn root(&self) -> &str {
        &self.root
    }

    fn list(&self, excludes: &[String]) -> Result<Vec<FileMeta>> {
        let matcher = ExcludeMatcher::new(excludes)?;
        Ok(walk_directory(Path::new(&self.root), &matcher)?)
    }

    fn open(&self, rel: &str) -> Result<Box<dyn Read + Send>> {
        let file = File::open(self.full_path(rel))?;
        Ok(Box::new(file))
    }

    fn create(&self, rel: &str, mode: u32) -> Result<Box<dyn FileWriter>> {
        let target = self.full_path(rel);
        let name = target
            .file_name()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("cannot write to {:?}", rel)))?;
        let staging = target.with_file_name(format!("{}{}", name.to_string_lossy(), STAGING_SUFFIX));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        remove_if_present(&staging)?;

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&staging)?;

        Ok(Box::new(StagedFile {
            file: Some(file),
            staging,
            target,
            mode,
            committed: false,
        }))
    }

    fn mkdir_all(&self, rel: &str) -> Result<()> {
        fs::create_dir_all(self.full_path(rel))?;
        Ok(())
    }

    fn remove(&self, rel: &str) -> Result<()> {
        let full = self.full_path(rel);
        let result = match fs::symlink_metadata(&full) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&full),
            Ok(_) => fs::remove_file(&full),
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn stat(&self, rel: &str) -> Result<FileMeta> {
        Ok(FileMeta::from_path(&self.full_path(rel), rel)?)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Local [`FileWriter`]: a staging file renamed over the target on commit
struct StagedFile {
    file: Option<File>,
    staging: PathBuf,
    target: PathBuf,
    mode: u32,
    committed: bool,
}

impl StagedFile {
    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::Other, "staging file already closed"))
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

impl FileWriter for StagedFile {
    fn commit(mut self: Box<Self>) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        set_mode(&self.staging, self.mode)?;
        fs::rename(&self.staging, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            let _ = fs::remove_file(&self.staging);
        }
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_makes_parents_and_writes() -> Result<()> {
        let temp = TempDir::new()?;
        let fs = LocalFs::new(temp.path().to_string_lossy());

        let mut writer = fs.create("a/b/c.txt", 0o600)?;
        writer.write_all(b"hello")?;
        assert!(!temp.path().join("a/b/c.txt").exists());
        writer.commit()?;
        assert!(!temp.path().join("a/b/c.txt.zbackup-tmp").exists());

        let mut content = String::new();
        fs.open("a/b/c.txt")?.read_to_string(&mut content)?;
        assert_eq!(content, "hello");

        let meta = fs.stat("a/b/c.txt")?;
        assert_eq!(meta.size, 5);
        assert_eq!(meta.rel_path, "a/b/c.txt");
        #[cfg(unix)]
        assert_eq!(meta.mode, 0o600);

        Ok(())
    }

    #[test]
    fn test_create_replaces_read_only_target() -> Result<()> {
        let temp = TempDir::new()?;
        let fs = LocalFs::new(temp.path().to_string_lossy());

        let mut writer = fs.create("ro.txt", 0o444)?;
        writer.write_all(b"v1")?;
        writer.commit()?;

        let mut writer = fs.create("ro.txt", 0o444)?;
        writer.write_all(b"v2")?;
        writer.commit()?;

        assert_eq!(std::fs::read_to_string(temp.path().join("ro.txt"))?, "v2");
        #[cfg(unix)]
        assert_eq!(fs.stat("ro.txt")?.mode, 0o444);
        Ok(())
    }

    #[test]
    fn test_uncommitted_writer_keeps_old_content() -> Result<()> {
        let temp = TempDir::new()?;
        std::fs::write(temp.path().join("a.txt"), b"old")?;
        let fs = LocalFs::new(temp.path().to_string_lossy());

        let mut writer = fs.create("a.txt", 0o644)?;
        writer.write_all(b"partial")?;
        drop(writer);

        assert_eq!(std::fs::read_to_string(temp.path().join("a.txt"))?, "old");
        assert!(!temp.path().join("a.txt.zbackup-tmp").exists());
        Ok(())
    }

    #[test]
    fn test_list_with_excludes() -> Result<()> {
        let temp = TempDir::new()?;
        std::fs::create_dir(temp.path().join("dir"))?;
        std::fs::write(temp.path().join("dir/file.txt"), b"0123456789")?;
        std::fs::write(temp.path().join("dir/skip.log"), b"log")?;

        let fs = LocalFs::new(temp.path().to_string_lossy());
        let entries = fs.list(&["*.log".to_string()])?;
        let paths: Vec<&str> = entries.iter().map(|e| e.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["dir", "dir/file.txt"]);

        Ok(())
    }

    #[test]
    fn test_remove_is_recursive_and_tolerates_missing() -> Result<()> {
        let temp = TempDir::new()?;
        let fs = LocalFs::new(temp.path().to_string_lossy());
        fs.mkdir_all("x/y")?;
        std::fs::write(temp.path().join("x/y/z.txt"), b"z")?;

        fs.remove("x")?;
        assert!(!temp.path().join("x").exists());
        fs.remove("x")?;

        Ok(())
    }

    #[test]
    fn test_stat_missing_is_not_found() -> Result<()> {
        let temp = TempDir::new()?;
        let fs = LocalFs::new(temp.path().to_string_lossy());
        let err = fs.stat("nope.txt").unwrap_err();
        assert!(err.is_not_found());
        assert!(fs.open("nope.txt").err().map(|e| e.is_not_found()).unwrap_or(false));
        Ok(())
    }
}

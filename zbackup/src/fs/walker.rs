//! Local directory traversal.
//!
//! Produces one `FileMeta` per file and per directory under a root, with
//! relative paths normalised to forward slashes. Excluded directories are
//! pruned so nothing beneath them is visited.

use crate::fs::matcher::ExcludeMatcher;
use crate::fs::metadata::{normalize_rel, FileMeta};
use std::path::Path;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Walk a directory tree and collect files and directories
///
/// The root itself is not included. Symlinks are not followed into.
///
/// # Example
/// ```no_run
/// use zbackup::fs::matcher::ExcludeMatcher;
/// use zbackup::fs::walker::walk_directory;
/// use std::path::Path;
///
/// let entries = walk_directory(Path::new("/data"), &ExcludeMatcher::none()).unwrap();
/// println!("Found {} entries", entries.len());
/// ```
pub fn walk_directory(root: &Path, excludes: &ExcludeMatcher) -> std::io::Result<Vec<FileMeta>> {
    let mut entries = Vec::new();

    let iter = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !excludes.is_excluded(&relative_of(entry, root)));

    for entry in iter {
        let entry = entry?;
        if let Some(meta) = meta_from_entry(&entry, root)? {
            entries.push(meta);
        }
    }

    Ok(entries)
}

fn relative_of(entry: &DirEntry, root: &Path) -> String {
    let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
    normalize_rel(&rel.to_string_lossy())
}

/// Build metadata from a walk entry.
/// Symlinks resolve to their target; symlinks to directories and broken links are skipped.
fn meta_from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<FileMeta>> {
    let rel = relative_of(entry, root);

    if entry.path_is_symlink() && !entry.file_type().is_dir() {
        match std::fs::metadata(entry.path()) {
            Ok(resolved) if resolved.is_dir() => {
                debug!(path = %rel, "Skipping symlink to directory");
                return Ok(None);
            }
            Ok(_) => {}
            Err(_) => {
                debug!(path = %rel, "Skipping broken symlink");
                return Ok(None);
            }
        }
    }

    FileMeta::from_path(entry.path(), &rel).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let entries = walk_directory(temp_dir.path(), &ExcludeMatcher::none())?;
        assert!(entries.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_includes_directories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2")?;

        let entries = walk_directory(temp_dir.path(), &ExcludeMatcher::none())?;
        assert_eq!(entries.len(), 3);

        let dir = entries.iter().find(|e| e.rel_path == "subdir").unwrap();
        assert!(dir.is_dir);
        assert_eq!(dir.size, 0);

        let nested = entries.iter().find(|e| e.rel_path == "subdir/file2.txt").unwrap();
        assert!(!nested.is_dir);
        assert_eq!(nested.size, 8);

        Ok(())
    }

    #[test]
    fn test_exclude_prunes_subtree() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join("node_modules/pkg"))?;
        fs::write(temp_dir.path().join("node_modules/pkg/index.js"), b"x")?;
        fs::write(temp_dir.path().join("keep.txt"), b"keep")?;
        fs::write(temp_dir.path().join("scratch.tmp"), b"tmp")?;

        let excludes = ExcludeMatcher::new(&["node_modules", "*.tmp"]).unwrap();
        let entries = walk_directory(temp_dir.path(), &excludes)?;
        let paths: Vec<&str> = entries.iter().map(|e| e.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["keep.txt"]);

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_broken_symlink_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("real.txt"), b"data")?;
        std::os::unix::fs::symlink(temp_dir.path().join("missing"), temp_dir.path().join("dangling"))?;
        std::os::unix::fs::symlink(temp_dir.path().join("real.txt"), temp_dir.path().join("link.txt"))?;

        let entries = walk_directory(temp_dir.path(), &ExcludeMatcher::none())?;
        let paths: Vec<&str> = entries.iter().map(|e| e.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["link.txt", "real.txt"]);

        Ok(())
    }
}

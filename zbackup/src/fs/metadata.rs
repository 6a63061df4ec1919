//! File metadata recorded in snapshots.
//!
//! A `FileMeta` describes one entry of a tree at one point in time. Paths are
//! relative to the endpoint root and always use forward slashes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Metadata for a single file or directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Relative path from the endpoint root (slash-separated)
    pub rel_path: String,

    /// File size in bytes (0 for directories)
    pub size: u64,

    /// Permission bits (Unix mode & 0o7777)
    #[serde(default)]
    pub mode: u32,

    /// Last modified time
    pub mod_time: DateTime<Utc>,

    /// Hex digest, populated when verification ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Is this a directory?
    #[serde(default)]
    pub is_dir: bool,
}

impl FileMeta {
    /// Metadata for a regular file
    pub fn file(rel_path: impl Into<String>, size: u64, mod_time: DateTime<Utc>) -> Self {
        Self {
            rel_path: normalize_rel(&rel_path.into()),
            size,
            mode: 0o644,
            mod_time,
            checksum: None,
            is_dir: false,
        }
    }

    /// Metadata for a directory. Directories never carry a size or checksum.
    pub fn dir(rel_path: impl Into<String>, mod_time: DateTime<Utc>) -> Self {
        Self {
            rel_path: normalize_rel(&rel_path.into()),
            size: 0,
            mode: 0o755,
            mod_time,
            checksum: None,
            is_dir: true,
        }
    }

    /// Extract metadata from a local path, following symlinks
    pub fn from_path(full_path: &Path, rel_path: &str) -> std::io::Result<Self> {
        let metadata = fs::metadata(full_path)?;
        let mod_time: DateTime<Utc> = metadata.modified()?.into();
        let is_dir = metadata.is_dir();

        Ok(Self {
            rel_path: normalize_rel(rel_path),
            size: if is_dir { 0 } else { metadata.len() },
            mode: permission_bits(&metadata),
            mod_time,
            checksum: None,
            is_dir,
        })
    }

    /// Number of path components, 0 for the root
    pub fn depth(&self) -> usize {
        depth(&self.rel_path)
    }
}

#[cfg(unix)]
fn permission_bits(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Convert a relative path to forward slashes and strip any leading `./` or `/`
pub fn normalize_rel(rel: &str) -> String {
    let slashed = rel.replace('\\', "/");
    let mut trimmed = slashed.as_str();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.trim_start_matches('/').trim_end_matches('/').to_string()
}

/// Depth of a relative path: the number of its components
pub fn depth(rel: &str) -> usize {
    if rel.is_empty() {
        0
    } else {
        rel.matches('/').count() + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_extract_metadata() -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let meta = FileMeta::from_path(temp_file.path(), "sub\\file.txt")?;

        assert_eq!(meta.size, 12);
        assert_eq!(meta.rel_path, "sub/file.txt");
        assert!(!meta.is_dir);
        assert!(meta.checksum.is_none());
        assert!(meta.mod_time.timestamp() > 0);

        Ok(())
    }

    #[test]
    fn test_directory_has_zero_size() -> std::io::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let meta = FileMeta::from_path(dir.path(), "d")?;
        assert!(meta.is_dir);
        assert_eq!(meta.size, 0);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_permissions_preservation() -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp_file = NamedTempFile::new()?;
        fs::set_permissions(temp_file.path(), fs::Permissions::from_mode(0o640))?;

        let meta = FileMeta::from_path(temp_file.path(), "f")?;
        assert_eq!(meta.mode, 0o640);

        Ok(())
    }

    #[test]
    fn test_normalize_and_depth() {
        assert_eq!(normalize_rel("./a/b/"), "a/b");
        assert_eq!(normalize_rel("a\\b\\c.txt"), "a/b/c.txt");
        assert_eq!(depth(""), 0);
        assert_eq!(depth("a"), 1);
        assert_eq!(depth("a/b/c"), 3);
    }

    #[test]
    fn test_json_keeps_nanoseconds() {
        let mod_time = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let meta = FileMeta::file("a.txt", 3, mod_time);
        let json = serde_json::to_string(&meta).unwrap();
        let back: FileMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
        assert!(!json.contains("checksum"));
    }
}

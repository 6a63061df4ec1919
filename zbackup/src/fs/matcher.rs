//! Exclude pattern matching.
//!
//! Patterns are shell globs. A pattern matches an entry when it matches
//! either the full relative path or the entry's base name, so `*.tmp`
//! excludes temp files at any depth while `build/*.o` is anchored at the root.
//! `*` never crosses a `/`.

use crate::utils::{BackupError, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Compiled set of exclude patterns
#[derive(Debug, Clone)]
pub struct ExcludeMatcher {
    set: GlobSet,
    empty: bool,
}

impl ExcludeMatcher {
    /// Compile patterns; blank patterns are ignored
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut count = 0;

        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| BackupError::Config(format!("invalid exclude pattern '{}': {}", pattern, e)))?;
            builder.add(glob);
            count += 1;
        }

        let set = builder
            .build()
            .map_err(|e| BackupError::Config(format!("invalid exclude patterns: {}", e)))?;

        Ok(Self { set, empty: count == 0 })
    }

    /// A matcher that excludes nothing
    pub fn none() -> Self {
        Self {
            set: GlobSet::empty(),
            empty: true,
        }
    }

    /// Check one entry against the patterns (full path or base name)
    pub fn is_excluded(&self, rel: &str) -> bool {
        if self.empty {
            return false;
        }
        let base = rel.rsplit('/').next().unwrap_or(rel);
        self.set.is_match(rel) || self.set.is_match(base)
    }

    /// Check an entry and every ancestor directory of it
    pub fn is_excluded_with_ancestors(&self, rel: &str) -> bool {
        if self.empty {
            return false;
        }
        for (idx, ch) in rel.char_indices() {
            if ch == '/' && self.is_excluded(&rel[..idx]) {
                return true;
            }
        }
        self.is_excluded(rel)
    }
}

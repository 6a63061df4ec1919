//! Configuration for a backup run.
//!
//! A run is described by a [`BackupConfig`]. The binary builds it from CLI
//! flags layered over an optional TOML file ([`FileConfig`]).

use crate::fs::endpoint::{Endpoint, EndpointKind, SshOptions};
use crate::utils::{BackupError, Result};
use chrono::Utc;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Snapshot names default to the run's UTC start time in this format
pub const SNAPSHOT_NAME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Whether deletions on the source are mirrored to the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
pub enum BackupMode {
    /// Mirror the source; entries gone from the source are deleted
    #[serde(rename = "full")]
    Full,

    /// Only add and update entries
    #[default]
    #[serde(rename = "incr", alias = "incremental")]
    #[value(name = "incr", alias = "incremental")]
    Incremental,
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupMode::Full => f.write_str("full"),
            BackupMode::Incremental => f.write_str("incr"),
        }
    }
}

/// Digest used for transfer verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgo {
    None,
    Md5,
    Sha1,
    #[default]
    Sha256,
}

impl ChecksumAlgo {
    pub fn is_enabled(self) -> bool {
        self != ChecksumAlgo::None
    }
}

impl fmt::Display for ChecksumAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChecksumAlgo::None => "none",
            ChecksumAlgo::Md5 => "md5",
            ChecksumAlgo::Sha1 => "sha1",
            ChecksumAlgo::Sha256 => "sha256",
        };
        f.write_str(name)
    }
}

/// Everything one run needs
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub source: Endpoint,
    pub dest: Endpoint,
    pub mode: BackupMode,
    pub checksum: ChecksumAlgo,

    /// Glob patterns for entries to leave out
    pub excludes: Vec<String>,

    /// Plan only; no transfer or persistence
    pub dry_run: bool,

    /// Name of the snapshot to write; filled in by `validate` when unset
    pub snapshot_name: Option<String>,

    /// Keep the run's log under `.zbackup/logs` on the destination
    pub dest_log: bool,
}

impl BackupConfig {
    pub fn new(source: Endpoint, dest: Endpoint) -> Self {
        Self {
            source,
            dest,
            mode: BackupMode::default(),
            checksum: ChecksumAlgo::default(),
            excludes: Vec::new(),
            dry_run: false,
            snapshot_name: None,
            dest_log: true,
        }
    }

    /// Reject unusable endpoint pairs and fill in the default snapshot name
    pub fn validate(&mut self) -> Result<()> {
        if self.source.path.trim().is_empty() {
            return Err(BackupError::Config("source path is required".into()));
        }
        if self.dest.path.trim().is_empty() {
            return Err(BackupError::Config("destination path is required".into()));
        }
        if self.source.is_remote() && self.dest.is_remote() {
            return Err(BackupError::Config(
                "remote to remote backups are not supported".into(),
            ));
        }

        let requested = self.snapshot_name.as_deref().map(|s| s.trim().to_string());
        match requested {
            Some(name) if !name.is_empty() => {
                if name.contains('/') || name.contains('\\') || name.starts_with('.') {
                    return Err(BackupError::Config(format!("invalid snapshot name: {}", name)));
                }
                self.snapshot_name = Some(name);
            }
            _ => {
                self.snapshot_name = Some(Utc::now().format(SNAPSHOT_NAME_FORMAT).to_string());
            }
        }

        Ok(())
    }

    /// Make local endpoint paths absolute against the working directory
    pub fn absolutize(&mut self) -> Result<()> {
        let cwd = std::env::current_dir()?;
        for endpoint in [&mut self.source, &mut self.dest] {
            if endpoint.kind == EndpointKind::Local && Path::new(&endpoint.path).is_relative() {
                endpoint.path = cwd.join(&endpoint.path).to_string_lossy().into_owned();
            }
        }
        Ok(())
    }

    /// Snapshot name; only meaningful after `validate`
    pub fn snapshot_name(&self) -> &str {
        self.snapshot_name.as_deref().unwrap_or_default()
    }
}

/// Contents of the optional TOML config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub backup: BackupSection,
    pub ssh: SshOptions,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSection {
    pub source: Option<String>,
    pub dest: Option<String>,
    pub mode: Option<BackupMode>,
    pub checksum: Option<ChecksumAlgo>,
    pub excludes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write logs to this file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FileConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn remote(path: &str) -> Endpoint {
        Endpoint::parse(&format!("user@host:{}", path), &SshOptions::default()).unwrap()
    }

    #[test]
    fn test_validate_rejects_remote_to_remote() {
        let mut config = BackupConfig::new(remote("/a"), remote("/b"));
        let err = config.validate().unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_empty_paths() {
        let mut config = BackupConfig::new(Endpoint::local(""), Endpoint::local("/dst"));
        assert!(config.validate().is_err());
        let mut config = BackupConfig::new(Endpoint::local("/src"), Endpoint::local(" "));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_snapshot_name_is_utc_timestamp() {
        let mut config = BackupConfig::new(Endpoint::local("/src"), remote("/dst"));
        config.validate().unwrap();
        let name = config.snapshot_name();
        assert_eq!(name.len(), 16);
        assert!(NaiveDateTime::parse_from_str(name, SNAPSHOT_NAME_FORMAT).is_ok());
    }

    #[test]
    fn test_explicit_snapshot_name() {
        let mut config = BackupConfig::new(Endpoint::local("/src"), Endpoint::local("/dst"));
        config.snapshot_name = Some(" nightly ".into());
        config.validate().unwrap();
        assert_eq!(config.snapshot_name(), "nightly");

        config.snapshot_name = Some("../escape".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_absolutize_only_touches_local() {
        let mut config = BackupConfig::new(Endpoint::local("rel/src"), remote("/dst"));
        config.absolutize().unwrap();
        assert!(Path::new(&config.source.path).is_absolute());
        assert!(config.source.path.ends_with("src"));
        assert_eq!(config.dest.path, "/dst");
    }

    #[test]
    fn test_file_config_parsing() {
        let toml_str = r#"
            [backup]
            mode = "full"
            checksum = "md5"
            excludes = ["*.tmp", "cache"]

            [ssh]
            port = 2222
            identity = "/home/me/.ssh/id_ed25519"

            [log]
            level = "debug"
        "#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backup.mode, Some(BackupMode::Full));
        assert_eq!(config.backup.checksum, Some(ChecksumAlgo::Md5));
        assert_eq!(config.backup.excludes.len(), 2);
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.log.level, "debug");
        assert!(config.log.file.is_none());
    }

    #[test]
    fn test_file_config_defaults() {
        let config: FileConfig = toml::from_str("[backup]\nmode = \"incremental\"\n").unwrap();
        assert_eq!(config.backup.mode, Some(BackupMode::Incremental));
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.log.level, "info");
        assert_eq!(ChecksumAlgo::default(), ChecksumAlgo::Sha256);
        assert_eq!(BackupMode::default().to_string(), "incr");
    }
}

//! Custom error types for zbackup.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("Remote command failed: {0}")]
    Remote(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Hash command unavailable: {0}")]
    HashUnavailable(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("{stage} failed for {path}: {source}")]
    Transfer {
        stage: &'static str,
        path: String,
        #[source]
        source: Box<BackupError>,
    },

    #[error("{0} item(s) failed to transfer")]
    ItemsFailed(usize),

    #[error("Backup cancelled")]
    Cancelled,

    #[error("Snapshot state inconsistent: {0}")]
    Inconsistent(String),
}

impl BackupError {
    /// True when the error means "path does not exist".
    pub fn is_not_found(&self) -> bool {
        match self {
            BackupError::NotFound(_) => true,
            BackupError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            BackupError::Transfer { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// True when a remote hash could not be computed and local hashing should be used instead.
    pub fn is_hash_unavailable(&self) -> bool {
        matches!(self, BackupError::HashUnavailable(_))
    }

    pub(crate) fn transfer(stage: &'static str, path: &str, source: BackupError) -> Self {
        BackupError::Transfer {
            stage,
            path: path.to_string(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

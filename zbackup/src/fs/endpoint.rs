//! Backup endpoints: a local directory or `[user@]host:/path` reached over SSH.

use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// SSH connection options shared by remote endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshOptions {
    /// Remote port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Login user used when the endpoint does not name one
    #[serde(default)]
    pub user: Option<String>,

    /// Private key file; the SSH agent is used when unset
    #[serde(default)]
    pub identity: Option<PathBuf>,

    /// known_hosts file to verify the host key against
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_SSH_PORT,
            user: None,
            identity: None,
            known_hosts: None,
        }
    }
}

/// Where an endpoint lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointKind {
    Local,
    Remote {
        user: Option<String>,
        host: String,
    },
}

/// One side of a backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: EndpointKind,
    pub path: String,
    pub ssh: SshOptions,
}

impl Endpoint {
    /// A local endpoint rooted at `path`
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::Local,
            path: path.into(),
            ssh: SshOptions::default(),
        }
    }

    /// Parse a CLI argument into an endpoint.
    ///
    /// `host:/path` and `user@host:/path` are remote; anything else is a local path.
    pub fn parse(raw: &str, ssh: &SshOptions) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(BackupError::Config("empty endpoint path".into()));
        }

        if let Some((user_host, path)) = split_remote(raw) {
            if path.is_empty() {
                return Err(BackupError::Config(format!("invalid remote path: {}", raw)));
            }
            let (user, host) = match user_host.split_once('@') {
                Some((user, host)) => (Some(user.to_string()), host.to_string()),
                None => (ssh.user.clone(), user_host.to_string()),
            };
            if host.is_empty() || user.as_deref() == Some("") {
                return Err(BackupError::Config(format!("invalid remote path: {}", raw)));
            }
            return Ok(Self {
                kind: EndpointKind::Remote { user, host },
                path: path.to_string(),
                ssh: ssh.clone(),
            });
        }

        Ok(Self::local(raw))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.kind, EndpointKind::Remote { .. })
    }

    /// Name used in logs: the path, or `user@host:path`
    pub fn display_name(&self) -> String {
        match &self.kind {
            EndpointKind::Local => self.path.clone(),
            EndpointKind::Remote { user: Some(user), host } => format!("{}@{}:{}", user, host, self.path),
            EndpointKind::Remote { user: None, host } => format!("{}:{}", host, self.path),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Split `[user@]host:path`. The host part may not contain `/`, so local paths
/// such as `./a:b` stay local.
fn split_remote(raw: &str) -> Option<(&str, &str)> {
    let (user_host, path) = raw.split_once(':')?;
    if user_host.is_empty() || user_host.contains('/') || user_host.contains('\\') {
        return None;
    }
    // Windows drive letters (`C:\data`) are local
    if user_host.len() == 1 && path.starts_with(['\\', '/']) && !user_host.contains('@') {
        return None;
    }
    let valid_user = match user_host.split_once('@') {
        Some((user, _)) => user
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')),
        None => true,
    };
    valid_user.then_some((user_host, path))
}

//! Filesystem access for backup endpoints.
//!
//! Both endpoints of a run are driven through the [`FileSystem`] trait. Paths
//! passed to it are relative to the endpoint root and slash-separated.

pub mod endpoint;
pub mod local;
pub mod matcher;
pub mod metadata;
pub mod remote;
pub mod walker;

pub use endpoint::{Endpoint, EndpointKind, SshOptions};
pub use local::LocalFs;
pub use metadata::FileMeta;
pub use remote::SshFs;

use crate::config::ChecksumAlgo;
use crate::utils::Result;
use std::io::{Read, Write};
use std::sync::Arc;

/// Uniform access to one endpoint tree
pub trait FileSystem: Send + Sync {
    /// Root path of the endpoint
    fn root(&self) -> &str;

    /// List every file and directory under the root, skipping excluded entries
    fn list(&self, excludes: &[String]) -> Result<Vec<FileMeta>>;

    /// Open a path for reading
    fn open(&self, rel: &str) -> Result<Box<dyn Read + Send>>;

    /// Start writing a path, creating parent directories. Nothing is visible
    /// at `rel` until the returned writer is committed.
    fn create(&self, rel: &str, mode: u32) -> Result<Box<dyn FileWriter>>;

    fn mkdir_all(&self, rel: &str) -> Result<()>;

    /// Remove a path recursively. Removing a missing path succeeds.
    fn remove(&self, rel: &str) -> Result<()>;

    /// Stat a path. A missing path yields an error for which `is_not_found()` holds.
    fn stat(&self, rel: &str) -> Result<FileMeta>;

    /// Release transport resources
    fn close(&self) -> Result<()>;

    /// Remote hashing capability, when the implementation has one
    fn as_remote_hash(&self) -> Option<&dyn RemoteHash> {
        None
    }
}

/// Suffix of the sibling a file is written to before it is committed
pub const STAGING_SUFFIX: &str = ".zbackup-tmp";

/// Writer returned by [`FileSystem::create`].
///
/// Bytes go to a writable staging sibling of the target. `commit` applies
/// the final mode and renames the staging file over the target, so a
/// read-only target from an earlier run is replaced rather than reopened.
/// Dropping an uncommitted writer discards the staging file and leaves the
/// target untouched.
pub trait FileWriter: Write + Send {
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Computes content digests where the data lives
pub trait RemoteHash {
    /// Digest of `rel` with `algo`. Fails with `HashUnavailable` when the
    /// algorithm or the hashing tool is not supported on that side.
    fn compute_remote_hash(&self, rel: &str, algo: ChecksumAlgo) -> Result<Vec<u8>>;
}

/// Open the filesystem an endpoint points at
pub fn open_filesystem(endpoint: &Endpoint) -> Result<Arc<dyn FileSystem>> {
    match &endpoint.kind {
        EndpointKind::Local => Ok(Arc::new(LocalFs::new(&endpoint.path))),
        EndpointKind::Remote { .. } => Ok(Arc::new(SshFs::connect(endpoint)?)),
    }
}

/// Join a relative path onto a slash-separated root
pub(crate) fn join_rel(root: &str, rel: &str) -> String {
    let rel = metadata::normalize_rel(rel);
    if rel.is_empty() {
        return root.to_string();
    }
    if root.ends_with('/') {
        format!("{}{}", root, rel)
    } else {
        format!("{}/{}", root, rel)
    }
}

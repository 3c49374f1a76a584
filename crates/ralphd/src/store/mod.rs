//! Artifact storage backends.
//!
//! The reconciler is written once against [`ArtifactStore`]; the daemon picks
//! [`LocalStore`] for a workspace on this machine and [`RemoteStore`] for a
//! container reachable only through `docker exec`.

pub mod local;
pub mod remote;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ralph_core::ArtifactLayout;
use thiserror::Error;

pub use local::LocalStore;
pub use remote::RemoteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact not found: {0}")]
    NotFound(PathBuf),
    #[error("invalid pattern {pattern}: {reason}")]
    Pattern { pattern: String, reason: String },
    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote command failed with exit code {code:?}: {stderr}")]
    Remote { code: Option<i32>, stderr: String },
    #[error("unexpected remote output: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One artifact path with its modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactEntry {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
}

/// Read/write access to named text artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Naming convention rooted at this store's artifact directory.
    fn layout(&self) -> &ArtifactLayout;

    /// Files matching a glob pattern (`*` wildcards only), unordered.
    async fn list(&self, pattern: &str) -> Result<Vec<ArtifactEntry>>;

    /// Metadata for one path, `None` if it does not exist.
    async fn stat(&self, path: &Path) -> Result<Option<ArtifactEntry>>;

    /// Full text of an artifact. Missing artifacts are [`StoreError::NotFound`].
    async fn read(&self, path: &Path) -> Result<String>;

    /// Replace an artifact atomically.
    async fn write(&self, path: &Path, content: &str) -> Result<()>;
}

impl std::fmt::Debug for dyn ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("root", &self.layout().root())
            .finish_non_exhaustive()
    }
}

/// Sibling temp path used for atomic replacement. Never matches the naming
/// convention, so watchers ignore it.
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_path_is_hidden_sibling() {
        let tmp = temp_path(Path::new("/w/.claude/ralph-steering-a.md"));
        assert_eq!(tmp, PathBuf::from("/w/.claude/.ralph-steering-a.md.tmp"));
        let layout = ArtifactLayout::new("/w/.claude");
        assert!(layout.classify(&tmp).is_none());
    }
}

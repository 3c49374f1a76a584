//! Artifact store over the local filesystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ralph_core::ArtifactLayout;
use tracing::debug;

use super::{temp_path, ArtifactEntry, ArtifactStore, Result, StoreError};

#[derive(Debug, Clone)]
pub struct LocalStore {
    layout: ArtifactLayout,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            layout: ArtifactLayout::new(root),
        }
    }
}

fn entry_from_metadata(path: PathBuf, metadata: &std::fs::Metadata) -> std::io::Result<ArtifactEntry> {
    let modified: DateTime<Utc> = metadata.modified()?.into();
    Ok(ArtifactEntry { path, modified })
}

fn map_not_found(path: &Path, err: std::io::Error) -> StoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound(path.to_path_buf())
    } else {
        StoreError::Io(err)
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    async fn list(&self, pattern: &str) -> Result<Vec<ArtifactEntry>> {
        let pattern = pattern.to_string();
        tokio::task::spawn_blocking(move || {
            let paths = glob::glob(&pattern).map_err(|e| StoreError::Pattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;

            let mut entries = Vec::new();
            for path in paths {
                let path = match path {
                    Ok(path) => path,
                    Err(e) => {
                        debug!(error = %e, "skipping unreadable glob entry");
                        continue;
                    }
                };
                // Files can vanish between the glob and the stat.
                match std::fs::metadata(&path) {
                    Ok(metadata) if metadata.is_file() => {
                        entries.push(entry_from_metadata(path, &metadata)?);
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(StoreError::Io(e)),
                }
            }
            Ok(entries)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    async fn stat(&self, path: &Path) -> Result<Option<ArtifactEntry>> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => Ok(Some(entry_from_metadata(path.to_path_buf(), &metadata)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn read(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| map_not_found(path, e))
    }

    async fn write(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = temp_path(path);
        tokio::fs::write(&tmp, content).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Io(e));
        }
        debug!(path = %path.display(), bytes = content.len(), "wrote artifact");
        Ok(())
    }
}

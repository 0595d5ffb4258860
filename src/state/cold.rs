//! Cold tier: long-TTL object storage for archived session snapshots.
//!
//! Snapshots land under archive-namespaced keys (`state-archive/{id}`).
//! The trait keeps the backend pluggable (a blob store in production);
//! [`FsColdTier`] is the filesystem-bucket default. Its TTL is enforced
//! by the archivist's sweep pass since a plain directory has no lifecycle
//! daemon of its own.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::StateError;

/// Cold-tier object operations. Archival preserves bytes exactly.
#[async_trait]
pub trait ColdTier: Send + Sync {
    async fn archive(&self, key: &str, bytes: Vec<u8>) -> Result<(), StateError>;
    async fn restore(&self, key: &str) -> Result<Option<Vec<u8>>, StateError>;
    async fn delete(&self, key: &str) -> Result<(), StateError>;
    /// Removes objects older than `ttl`, returning how many were removed.
    async fn sweep_expired(&self, ttl: Duration) -> Result<usize, StateError>;
    async fn healthy(&self) -> bool;
}

/// Filesystem-backed cold tier: one file per object under a bucket root.
pub struct FsColdTier {
    bucket: PathBuf,
}

impl FsColdTier {
    #[must_use]
    pub fn new(bucket: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
        }
    }

    /// Maps an object key to a path inside the bucket, rejecting keys that
    /// would escape it.
    fn object_path(&self, key: &str) -> Result<PathBuf, StateError> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(StateError::Unavailable {
                tier: "cold",
                reason: format!("invalid object key {key:?}"),
            });
        }
        Ok(self.bucket.join(key))
    }

    fn io_err(reason: impl std::fmt::Display) -> StateError {
        StateError::Unavailable {
            tier: "cold",
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ColdTier for FsColdTier {
    async fn archive(&self, key: &str, bytes: Vec<u8>) -> Result<(), StateError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(Self::io_err)?;
        }

        // Write-then-rename so a crash never leaves a torn object.
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, &bytes).await.map_err(Self::io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(Self::io_err)?;
        debug!(key, size = bytes.len(), "Archived object");
        Ok(())
    }

    async fn restore(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_err(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(e)),
        }
    }

    async fn sweep_expired(&self, ttl: Duration) -> Result<usize, StateError> {
        let bucket = self.bucket.clone();
        let removed = tokio::task::spawn_blocking(move || {
            let mut removed = 0;
            for entry in WalkDir::new(&bucket).min_depth(1).into_iter().flatten() {
                if !entry.file_type().is_file() {
                    continue;
                }
                let expired = entry
                    .metadata()
                    .ok()
                    .and_then(|meta| meta.modified().ok())
                    .and_then(|modified| modified.elapsed().ok())
                    .is_some_and(|age| age > ttl);
                if expired {
                    match std::fs::remove_file(entry.path()) {
                        Ok(()) => removed += 1,
                        Err(e) => {
                            warn!(path = %entry.path().display(), error = %e, "Failed to sweep archive object");
                        }
                    }
                }
            }
            removed
        })
        .await
        .map_err(Self::io_err)?;
        Ok(removed)
    }

    async fn healthy(&self) -> bool {
        match tokio::fs::create_dir_all(&self.bucket).await {
            Ok(()) => true,
            Err(_) => Path::new(&self.bucket).is_dir(),
        }
    }
}

//! Upload/download file bucket.
//!
//! Input and output files travel through an external blob store in
//! production; this is its boundary as the executor consumes it:
//! references of the form `{sessionId}/{fileId}`, with the original file
//! name preserved. The default backend is a filesystem bucket laid out as
//! `{root}/{sessionId}/{fileId}/{name}`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::FileError;

/// Wire-form reference to a stored file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRef {
    pub id: String,
    pub name: String,
    pub session_id: String,
}

/// Filesystem-backed file store.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Stores bytes under a fresh file id for the session.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn store(
        &self,
        session_id: &str,
        name: &str,
        bytes: &[u8],
    ) -> Result<FileRef, FileError> {
        validate_id(session_id, "session id")?;
        let name = sanitize_name(name)?;
        let file_id = Uuid::new_v4().simple().to_string();

        let dir = self.root.join(session_id).join(&file_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| FileError::Io {
                context: format!("create {}", dir.display()),
                source: e,
            })?;
        let path = dir.join(&name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| FileError::Io {
                context: format!("write {}", path.display()),
                source: e,
            })?;

        debug!(%file_id, "Stored file");
        Ok(FileRef {
            id: file_id,
            name,
            session_id: session_id.to_string(),
        })
    }

    /// Loads a stored file's name and bytes by reference.
    #[instrument(skip(self))]
    pub async fn load(
        &self,
        session_id: &str,
        file_id: &str,
    ) -> Result<(String, Vec<u8>), FileError> {
        validate_id(session_id, "session id")?;
        validate_id(file_id, "file id")?;

        let dir = self.root.join(session_id).join(file_id);
        let not_found = || FileError::NotFound {
            session_id: session_id.to_string(),
            file_id: file_id.to_string(),
        };

        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|_| not_found())?;
        let entry = entries
            .next_entry()
            .await
            .map_err(|e| FileError::Io {
                context: format!("read {}", dir.display()),
                source: e,
            })?
            .ok_or_else(not_found)?;

        let name = entry.file_name().to_string_lossy().into_owned();
        let bytes = tokio::fs::read(entry.path())
            .await
            .map_err(|e| FileError::Io {
                context: format!("read {}", entry.path().display()),
                source: e,
            })?;
        Ok((name, bytes))
    }
}

/// Accepts opaque identifiers: non-empty, bounded, path-safe.
fn validate_id(id: &str, what: &str) -> Result<(), FileError> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(FileError::InvalidReference {
            reason: format!("invalid {what}: {id:?}"),
        })
    }
}

/// Rejects names that could escape the sandbox scratch or the bucket.
pub fn sanitize_name(name: &str) -> Result<String, FileError> {
    let name = name.trim();
    let ok = !name.is_empty()
        && name.len() <= 255
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
        && name != ".."
        && !name.contains("..");
    if ok {
        Ok(name.to_string())
    } else {
        Err(FileError::InvalidReference {
            reason: format!("invalid file name: {name:?}"),
        })
    }
}

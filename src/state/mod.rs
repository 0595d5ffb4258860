//! Two-tier persistence for interactive-session state.
//!
//! Snapshots are opaque bytes produced by the in-sandbox interpreter; the
//! store never inspects them. The hot tier holds recent sessions under a
//! short TTL; the archivist moves idle entries into the cold tier, and
//! loads fall through to cold with hot re-population.
//!
//! # Key layout
//!
//! - hot: `state:{sessionId}` → snapshot bytes
//! - hot: `session:{sessionId}` → metadata JSON
//! - cold: `state-archive/{sessionId}` → snapshot bytes

pub mod archivist;
pub mod cold;
pub mod hot;

pub use archivist::{ArchiveSummary, Archivist};
pub use cold::{ColdTier, FsColdTier};
pub use hot::{HotTier, MemoryHotTier};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::StateError;
use crate::languages::Language;

/// Hot-tier key prefix for snapshots.
pub const HOT_STATE_PREFIX: &str = "state:";
/// Hot-tier key prefix for session metadata.
pub const SESSION_META_PREFIX: &str = "session:";
/// Cold-tier key namespace for archived snapshots.
pub const ARCHIVE_PREFIX: &str = "state-archive";

#[must_use]
pub fn hot_state_key(session_id: &str) -> String {
    format!("{HOT_STATE_PREFIX}{session_id}")
}

#[must_use]
pub fn session_meta_key(session_id: &str) -> String {
    format!("{SESSION_META_PREFIX}{session_id}")
}

#[must_use]
pub fn archive_key(session_id: &str) -> String {
    format!("{ARCHIVE_PREFIX}/{session_id}")
}

/// Per-session metadata document, persisted as JSON in the hot tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub created_at: DateTime<Utc>,
    pub last_executed_at: DateTime<Utc>,
    pub last_language: Language,
    pub executions: u64,
}

impl SessionMeta {
    #[must_use]
    pub fn new(language: Language) -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_executed_at: now,
            last_language: language,
            executions: 1,
        }
    }

    /// Records another execution against this session.
    pub fn touch(&mut self, language: Language) {
        self.last_executed_at = Utc::now();
        self.last_language = language;
        self.executions += 1;
    }
}

/// Facade over the two tiers used by the orchestrator.
pub struct StateStore {
    hot: Arc<dyn HotTier>,
    cold: Arc<dyn ColdTier>,
    hot_ttl: Duration,
    session_meta_ttl: Duration,
    max_snapshot_bytes: usize,
}

impl StateStore {
    #[must_use]
    pub fn new(
        hot: Arc<dyn HotTier>,
        cold: Arc<dyn ColdTier>,
        hot_ttl: Duration,
        session_meta_ttl: Duration,
        max_snapshot_bytes: usize,
    ) -> Self {
        Self {
            hot,
            cold,
            hot_ttl,
            session_meta_ttl,
            max_snapshot_bytes,
        }
    }

    /// Persists a snapshot with the hot TTL. Idempotent; the most recent
    /// save wins.
    ///
    /// # Errors
    ///
    /// `StateError::TooLarge` when the snapshot exceeds the configured
    /// maximum; `StateError::Unavailable` when the tier is unreachable.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn save(&self, session_id: &str, bytes: Vec<u8>) -> Result<(), StateError> {
        if bytes.len() > self.max_snapshot_bytes {
            return Err(StateError::TooLarge {
                size: bytes.len(),
                limit: self.max_snapshot_bytes,
            });
        }
        self.hot
            .put(&hot_state_key(session_id), bytes, self.hot_ttl)
            .await
    }

    /// Loads the most recent snapshot across tiers, preferring hot. A cold
    /// hit re-populates the hot tier with a fresh TTL.
    #[instrument(skip(self))]
    pub async fn load(&self, session_id: &str) -> Result<Option<Vec<u8>>, StateError> {
        if let Some(bytes) = self.hot.get(&hot_state_key(session_id)).await? {
            debug!("State loaded from hot tier");
            return Ok(Some(bytes));
        }

        match self.cold.restore(&archive_key(session_id)).await? {
            Some(bytes) => {
                debug!(size = bytes.len(), "State restored from cold tier");
                if let Err(e) = self
                    .hot
                    .put(&hot_state_key(session_id), bytes.clone(), self.hot_ttl)
                    .await
                {
                    warn!(error = %e, "Failed to re-populate hot tier after restore");
                }
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    /// Removes the hot entry only; archived copies age out on their own.
    pub async fn delete(&self, session_id: &str) -> Result<(), StateError> {
        self.hot.delete(&hot_state_key(session_id)).await
    }

    /// Loads session metadata, if the session is known.
    pub async fn load_meta(&self, session_id: &str) -> Result<Option<SessionMeta>, StateError> {
        let Some(bytes) = self.hot.get(&session_meta_key(session_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!(session_id, error = %e, "Dropping corrupt session metadata");
                Ok(None)
            }
        }
    }

    /// Saves session metadata with the metadata TTL.
    pub async fn save_meta(&self, session_id: &str, meta: &SessionMeta) -> Result<(), StateError> {
        let bytes = serde_json::to_vec(meta).map_err(|e| StateError::Unavailable {
            tier: "hot",
            reason: format!("metadata serialization failed: {e}"),
        })?;
        self.hot
            .put(&session_meta_key(session_id), bytes, self.session_meta_ttl)
            .await
    }

    /// Health of (hot, cold) tiers for the detailed health endpoint.
    pub async fn health(&self) -> (bool, bool) {
        (self.hot.healthy().await, self.cold.healthy().await)
    }
}

//! Background archivist: moves idle hot entries to the cold tier and
//! sweeps expired archives.
//!
//! Movement is write-then-delete: a crash between the two leaves a
//! harmless duplicate, never a lost snapshot. The archivist never races a
//! concurrent save on the same session because loads prefer hot and a
//! racing save simply overwrites.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::state::cold::ColdTier;
use crate::state::hot::HotTier;
use crate::state::{archive_key, HOT_STATE_PREFIX};

/// Outcome of one archivist scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Snapshots moved from hot to cold.
    pub archived: usize,
    /// Movements that failed; the hot entry is left in place.
    pub failed: usize,
    /// Expired hot entries dropped.
    pub purged: usize,
    /// Expired cold objects removed.
    pub swept: usize,
}

/// Interval worker over the two storage tiers.
pub struct Archivist {
    hot: Arc<dyn HotTier>,
    cold: Arc<dyn ColdTier>,
    idle_after: Duration,
    scan_interval: Duration,
    cold_ttl: Duration,
}

impl Archivist {
    #[must_use]
    pub fn new(
        hot: Arc<dyn HotTier>,
        cold: Arc<dyn ColdTier>,
        idle_after: Duration,
        scan_interval: Duration,
        cold_ttl: Duration,
    ) -> Self {
        Self {
            hot,
            cold,
            idle_after,
            scan_interval,
            cold_ttl,
        }
    }

    /// Runs the scan loop until the returned handle is aborted.
    #[must_use]
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                idle_after_secs = self.idle_after.as_secs(),
                interval_secs = self.scan_interval.as_secs(),
                "Archivist started"
            );
            loop {
                sleep(self.scan_interval).await;
                let summary = self.scan().await;
                if summary != ArchiveSummary::default() {
                    debug!(?summary, "Archivist scan finished");
                }
            }
        })
    }

    /// One full pass: purge expired hot entries, move idle snapshots to
    /// cold, sweep expired archives. Public so tests can drive it directly.
    #[instrument(skip(self))]
    pub async fn scan(&self) -> ArchiveSummary {
        let mut summary = ArchiveSummary::default();

        match self.hot.purge_expired().await {
            Ok(purged) => summary.purged = purged,
            Err(e) => warn!(error = %e, "Hot-tier purge failed"),
        }

        let idle = match self.hot.idle_keys(HOT_STATE_PREFIX, self.idle_after).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Hot-tier idle scan failed");
                return summary;
            }
        };

        for key in idle {
            let Some(session_id) = key.strip_prefix(HOT_STATE_PREFIX) else {
                continue;
            };
            let bytes = match self.hot.peek(&key).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%key, error = %e, "Failed to read idle entry");
                    summary.failed += 1;
                    continue;
                }
            };

            // Write to cold first; only a successful write deletes hot.
            match self.cold.archive(&archive_key(session_id), bytes).await {
                Ok(()) => {
                    if let Err(e) = self.hot.delete(&key).await {
                        warn!(%key, error = %e, "Archived but failed to delete hot entry");
                    }
                    debug!(session_id, "Archived idle session state");
                    summary.archived += 1;
                }
                Err(e) => {
                    warn!(session_id, error = %e, "Archival failed, keeping hot entry");
                    summary.failed += 1;
                }
            }
        }

        match self.cold.sweep_expired(self.cold_ttl).await {
            Ok(swept) => summary.swept = swept,
            Err(e) => warn!(error = %e, "Cold-tier sweep failed"),
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::cold::FsColdTier;
    use crate::state::hot::MemoryHotTier;
    use crate::state::hot_state_key;
    use tempfile::TempDir;

    fn archivist(
        hot: Arc<MemoryHotTier>,
        cold: Arc<FsColdTier>,
        idle_after: Duration,
    ) -> Archivist {
        Archivist::new(
            hot,
            cold,
            idle_after,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_idle_entry_moves_to_cold_exactly() {
        let dir = TempDir::new().unwrap();
        let hot = Arc::new(MemoryHotTier::new());
        let cold = Arc::new(FsColdTier::new(dir.path()));
        let worker = archivist(hot.clone(), cold.clone(), Duration::from_millis(10));

        let payload = vec![7u8; 128];
        hot.put(&hot_state_key("s1"), payload.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let summary = worker.scan().await;
        assert_eq!(summary.archived, 1);
        assert_eq!(summary.failed, 0);

        // moved, byte-exact
        assert_eq!(hot.get(&hot_state_key("s1")).await.unwrap(), None);
        assert_eq!(
            cold.restore(&archive_key("s1")).await.unwrap(),
            Some(payload)
        );
    }

    #[tokio::test]
    async fn test_recently_used_entry_stays_hot() {
        let dir = TempDir::new().unwrap();
        let hot = Arc::new(MemoryHotTier::new());
        let cold = Arc::new(FsColdTier::new(dir.path()));
        let worker = archivist(hot.clone(), cold.clone(), Duration::from_secs(3600));

        hot.put(&hot_state_key("s1"), b"x".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        let summary = worker.scan().await;
        assert_eq!(summary.archived, 0);
        assert!(hot.get(&hot_state_key("s1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_metadata_keys_are_not_archived() {
        let dir = TempDir::new().unwrap();
        let hot = Arc::new(MemoryHotTier::new());
        let cold = Arc::new(FsColdTier::new(dir.path()));
        let worker = archivist(hot.clone(), cold.clone(), Duration::from_millis(5));

        hot.put("session:s1", b"meta".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let summary = worker.scan().await;
        assert_eq!(summary.archived, 0);
        assert!(hot.get("session:s1").await.unwrap().is_some());
    }
}

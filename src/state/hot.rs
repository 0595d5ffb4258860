//! Hot tier: low-latency short-TTL key-value storage for session snapshots.
//!
//! The trait keeps the backend pluggable (a networked key-value server in
//! production deployments); [`MemoryHotTier`] is the in-process default
//! and the implementation the test suite runs against.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StateError;

/// Hot-tier key-value operations.
///
/// `get` refreshes the entry's last-access timestamp (which the archivist
/// uses to find idle entries); `peek` does not.
#[async_trait]
pub trait HotTier: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, ttl: Duration) -> Result<(), StateError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError>;
    async fn peek(&self, key: &str) -> Result<Option<Vec<u8>>, StateError>;
    async fn delete(&self, key: &str) -> Result<(), StateError>;
    /// Keys under `prefix` whose last access is at least `min_idle` ago.
    async fn idle_keys(&self, prefix: &str, min_idle: Duration) -> Result<Vec<String>, StateError>;
    /// Drops expired entries, returning how many were removed.
    async fn purge_expired(&self) -> Result<usize, StateError>;
    async fn healthy(&self) -> bool;
}

struct HotEntry {
    bytes: Vec<u8>,
    expires_at: Instant,
    last_access: Instant,
}

impl HotEntry {
    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process hot tier backed by a TTL map.
#[derive(Default)]
pub struct MemoryHotTier {
    entries: RwLock<HashMap<String, HotEntry>>,
}

impl MemoryHotTier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries, for the health endpoint.
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|entry| !entry.expired()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl HotTier for MemoryHotTier {
    async fn put(&self, key: &str, bytes: Vec<u8>, ttl: Duration) -> Result<(), StateError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            HotEntry {
                bytes,
                expires_at: now + ttl,
                last_access: now,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if entry.expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => {
                entry.last_access = Instant::now();
                Ok(Some(entry.bytes.clone()))
            }
            None => Ok(None),
        }
    }

    async fn peek(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.expired())
            .map(|entry| entry.bytes.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn idle_keys(&self, prefix: &str, min_idle: Duration) -> Result<Vec<String>, StateError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(key, entry)| {
                key.starts_with(prefix)
                    && !entry.expired()
                    && now.duration_since(entry.last_access) >= min_idle
            })
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn purge_expired(&self) -> Result<usize, StateError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired());
        Ok(before - entries.len())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

//! Result store collaborator: fingerprint → serialized result.
//!
//! The orchestrator only needs `get` / `batch_get` / `put`; eviction policy
//! belongs to the store, and entries are never invalidated by the core. The
//! in-memory backend here serves single-process deployments and tests; a
//! networked backend implements the same trait.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::debug;

/// Store backend failure. The orchestrator degrades on these (treats reads
/// as misses, drops writes) rather than failing the computation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Any backend-level failure (connection, serialization, capacity).
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Key-value interface over computed results.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Fetch one serialized result by fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Fetch many fingerprints in a single round trip. Missing keys are
    /// simply absent from the returned map.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn batch_get(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError>;

    /// Persist one serialized result.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;
}

#[derive(Clone)]
struct StoredEntry {
    value: String,
    expires_at: SystemTime,
}

/// In-memory store with TTL expiry and capacity eviction.
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    max_entries: usize,
    ttl: Duration,
}

impl MemoryStore {
    /// Create a store holding at most `max_entries` with the given TTL.
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            ttl,
        }
    }

    /// Number of entries currently held (including not-yet-swept expired ones).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_if_full(&self) {
        if self.max_entries > 0 && self.entries.len() >= self.max_entries {
            // Collect key first to release all read-guards before removing
            // (avoids shard deadlock).
            let evict_key = self.entries.iter().next().map(|e| e.key().clone());
            if let Some(key) = evict_key {
                self.entries.remove(&key);
            }
        }
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > SystemTime::now() {
                debug!(key = key, "result store hit");
                return Ok(Some(entry.value.clone()));
            }
            drop(entry);
            self.entries.remove(key);
            debug!(key = key, "result store entry expired");
        }
        Ok(None)
    }

    async fn batch_get(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError> {
        let mut found = HashMap::new();
        for key in keys {
            if let Some(value) = self.get(key).await? {
                found.insert(key.clone(), value);
            }
        }
        debug!(requested = keys.len(), found = found.len(), "result store batch read");
        Ok(found)
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.evict_if_full();
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                expires_at: SystemTime::now() + self.ttl,
            },
        );
        Ok(())
    }
}

//! Edge Tier - Network-intercepting Store
//!
//! Cache of last resort that sits in front of outbound fetches. Records are
//! stored encoded (see `codec`) in a pluggable [`EdgeBackend`], so the tier
//! keeps no state of its own beyond hit counters.
//!
//! Whether the tier exists is decided once, when the coordinator is built
//! (`EdgeConfig::enabled`); nothing probes for it per call.
//!
//! Capacity is enforced best-effort: the size check and the backend put are
//! separate calls, so concurrent writers can briefly overshoot the budget.
//! The version check in `write_if_newer` has the same window.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::codec;
use super::entry::{CacheEntry, EntryMetadata};
use super::tier::{Tier, TierKind, TierStats};
use super::DEFAULT_EDGE_CAPACITY;
use crate::error::{Error, Result};

/// Strategy tag for entries stored by [`EdgeTier::intercept`]
pub const INTERCEPT_STRATEGY: &str = "edge-intercept";

/// Edge storage backend trait
#[async_trait]
pub trait EdgeBackend: Send + Sync {
    /// Get a stored record
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a record, replacing any previous one
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Delete a record
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All stored keys
    async fn keys(&self) -> Result<Vec<String>>;

    /// Delete everything
    async fn clear(&self) -> Result<()>;

    /// Get storage statistics
    fn stats(&self) -> EdgeBackendStats;
}

/// Edge backend statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct EdgeBackendStats {
    /// Total objects stored
    pub object_count: u64,
    /// Total bytes stored
    pub total_bytes: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
}

/// In-process edge backend
#[derive(Default)]
pub struct InMemoryEdgeBackend {
    records: DashMap<String, Bytes>,
    stored_bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryEdgeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a record changing from `old` to `new` bytes
    fn resize(&self, old: usize, new: usize) {
        let _ = self
            .stored_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                Some((total + new as u64).saturating_sub(old as u64))
            });
    }
}

#[async_trait]
impl EdgeBackend for InMemoryEdgeBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.records.get(key).map(|record| record.value().clone()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let new = data.len();
        let old = self
            .records
            .insert(key.to_string(), data)
            .map_or(0, |previous| previous.len());
        self.resize(old, new);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let removed = self.records.remove(key);
        if let Some((_, data)) = &removed {
            self.resize(data.len(), 0);
        }
        Ok(removed.is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.records.iter().map(|record| record.key().clone()).collect())
    }

    async fn clear(&self) -> Result<()> {
        // Per-key removal keeps the byte total exact under concurrent puts
        for key in self.keys().await? {
            self.delete(&key).await?;
        }
        Ok(())
    }

    fn stats(&self) -> EdgeBackendStats {
        EdgeBackendStats {
            object_count: self.records.len() as u64,
            total_bytes: self.stored_bytes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// Edge Tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Whether the tier is part of the chain
    pub enabled: bool,
    /// Maximum stored bytes (encoded records)
    pub capacity: u64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_EDGE_CAPACITY,
        }
    }
}

/// Edge Tier - network-intercepting cache
pub struct EdgeTier {
    backend: Arc<dyn EdgeBackend>,
    config: EdgeConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    rejected: AtomicU64,
}

impl EdgeTier {
    /// Create over the given backend
    pub fn new(backend: Arc<dyn EdgeBackend>, config: EdgeConfig) -> Self {
        Self {
            backend,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Create with an in-memory backend
    pub fn in_memory(config: EdgeConfig) -> Self {
        Self::new(Arc::new(InMemoryEdgeBackend::new()), config)
    }

    /// Backend statistics
    pub fn backend_stats(&self) -> EdgeBackendStats {
        self.backend.stats()
    }

    /// Serve `key` from the tier, or run `fetch` and store its result.
    ///
    /// Compressed records cannot be served here and count as a miss.
    pub async fn intercept<F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Bytes>>,
    {
        match self.read(key).await {
            Ok(Some(entry)) if !entry.meta.compressed => return Ok(entry.into_payload()),
            Ok(_) => {}
            Err(e) => warn!(key, error = %e, "Edge read failed, fetching"),
        }

        let payload = fetch().await.map_err(|source| Error::FetchFailed {
            key: key.to_string(),
            source,
        })?;

        let entry = CacheEntry::new(key, payload.clone(), ttl).with_strategy(INTERCEPT_STRATEGY);
        if let Err(e) = self.write(entry).await {
            warn!(key, error = %e, "Edge store after fetch failed");
        }
        Ok(payload)
    }

    async fn headers(&self) -> Result<Vec<EntryMetadata>> {
        let mut headers = Vec::new();
        for key in self.backend.keys().await? {
            let Some(record) = self.backend.get(&key).await? else {
                continue;
            };
            match codec::decode_header(&record) {
                Ok(meta) => headers.push(meta),
                Err(e) => {
                    warn!(key = %key, error = %e, "Dropping unreadable edge record");
                    self.backend.delete(&key).await?;
                }
            }
        }
        Ok(headers)
    }
}

#[async_trait]
impl Tier for EdgeTier {
    fn kind(&self) -> TierKind {
        TierKind::Edge
    }

    async fn read(&self, key: &str) -> Result<Option<CacheEntry>> {
        let Some(record) = self.backend.get(key).await? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let entry = match codec::decode(record) {
            Ok(entry) => entry,
            Err(e) => {
                self.backend.delete(key).await?;
                return Err(e);
            }
        };
        if entry.key() != key || entry.is_expired() {
            if entry.is_expired() {
                self.backend.delete(key).await?;
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry))
    }

    async fn write(&self, entry: CacheEntry) -> Result<()> {
        let record = codec::encode(&entry)?;
        let incoming = record.len() as u64;

        if self.backend.stats().total_bytes + incoming > self.config.capacity {
            self.purge_expired().await?;
            let replaced = self
                .backend
                .get(entry.key())
                .await?
                .map_or(0, |old| old.len() as u64);
            let used = self.backend.stats().total_bytes.saturating_sub(replaced);
            if used + incoming > self.config.capacity {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key = entry.key(),
                    incoming,
                    capacity = self.config.capacity,
                    "Edge tier full, write skipped"
                );
                self.backend.delete(entry.key()).await?;
                return Ok(());
            }
        }

        self.backend.put(entry.key(), record).await
    }

    async fn write_if_newer(&self, entry: CacheEntry) -> Result<bool> {
        if let Some(record) = self.backend.get(entry.key()).await? {
            if let Ok(current) = codec::decode_header(&record) {
                if current.key == entry.key()
                    && !current.is_expired()
                    && current.version >= entry.version()
                {
                    return Ok(false);
                }
            }
        }
        self.write(entry).await?;
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.backend.delete(key).await
    }

    async fn enumerate(&self) -> Result<Vec<EntryMetadata>> {
        self.headers().await
    }

    async fn clear(&self) -> Result<()> {
        self.backend.clear().await
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut removed = 0;
        for meta in self.headers().await? {
            if meta.is_expired() && self.backend.delete(&meta.key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn capacity_used(&self) -> u64 {
        self.backend.stats().total_bytes
    }

    fn capacity_limit(&self) -> u64 {
        self.config.capacity
    }

    fn len(&self) -> usize {
        self.backend.stats().object_count as usize
    }

    fn stats(&self) -> TierStats {
        let backend = self.backend.stats();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        TierStats {
            kind: TierKind::Edge,
            entries: backend.object_count as usize,
            size_bytes: backend.total_bytes,
            capacity_bytes: self.config.capacity,
            hits,
            misses,
            evictions: self.rejected.load(Ordering::Relaxed),
            utilization: self.utilization(),
            hit_ratio: TierStats::ratio(hits, misses),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

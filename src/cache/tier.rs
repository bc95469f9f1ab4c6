//! Storage Tier Interface
//!
//! Every tier implements [`Tier`]; the coordinator holds them as an ordered
//! chain (fastest first) and never special-cases an individual tier.

use async_trait::async_trait;
use serde::Serialize;

use super::entry::{CacheEntry, EntryMetadata};
use crate::error::Result;

/// Tier identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// In-process RAM
    Fast,
    /// Local disk, survives restarts
    Durable,
    /// Network-intercepting store
    Edge,
}

impl TierKind {
    /// Stable lowercase label (metrics, logs)
    pub fn as_str(&self) -> &'static str {
        match self {
            TierKind::Fast => "fast",
            TierKind::Durable => "durable",
            TierKind::Edge => "edge",
        }
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierKind::Fast => write!(f, "Fast (RAM)"),
            TierKind::Durable => write!(f, "Durable (Disk)"),
            TierKind::Edge => write!(f, "Edge (Network)"),
        }
    }
}

/// Point-in-time statistics for one tier
#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub kind: TierKind,
    pub entries: usize,
    pub size_bytes: u64,
    pub capacity_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub utilization: f64,
    pub hit_ratio: f64,
}

impl TierStats {
    pub(crate) fn ratio(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// A key-value store participating in the tier chain.
///
/// Implementations own their synchronization. `read` must never return an
/// expired entry.
#[async_trait]
pub trait Tier: Send + Sync {
    /// Which tier this is
    fn kind(&self) -> TierKind;

    /// Look up a live entry
    async fn read(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store an entry, replacing any previous one for the key
    async fn write(&self, entry: CacheEntry) -> Result<()>;

    /// Store an entry unless the tier already holds a live entry for the key
    /// with the same or a higher version; returns whether it was stored.
    ///
    /// Used for promotion copies, which must never overwrite a newer write.
    /// The default has no atomic check and always writes.
    async fn write_if_newer(&self, entry: CacheEntry) -> Result<bool> {
        self.write(entry).await?;
        Ok(true)
    }

    /// Remove a key; returns whether it was present
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Metadata of every stored entry, expired ones included
    async fn enumerate(&self) -> Result<Vec<EntryMetadata>>;

    /// Drop everything
    async fn clear(&self) -> Result<()>;

    /// Remove expired entries; returns how many were removed
    async fn purge_expired(&self) -> Result<usize>;

    /// Evict `fraction` of entries in LRU order; tiers without a recency
    /// order ignore this
    fn shed(&self, _fraction: f64) -> usize {
        0
    }

    /// Bytes currently stored
    fn capacity_used(&self) -> u64;

    /// Byte budget
    fn capacity_limit(&self) -> u64;

    /// Number of stored entries
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether entries may be written in compressed form
    fn stores_compressed(&self) -> bool {
        true
    }

    /// Used / limit, in [0, 1]
    fn utilization(&self) -> f64 {
        let limit = self.capacity_limit();
        if limit == 0 {
            0.0
        } else {
            (self.capacity_used() as f64 / limit as f64).min(1.0)
        }
    }

    fn stats(&self) -> TierStats;
}

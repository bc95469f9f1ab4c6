//! Fast Tier - RAM-based Hot Cache
//!
//! Synchronous, byte-bounded, least-recently-used store. Entries are kept
//! uncompressed so hits cost no decode.
//!
//! # Design
//!
//! - Single `parking_lot::Mutex` around an [`LruIndex`]; each operation is
//!   short and never awaits
//! - Eviction is computed and applied inside the write's critical section,
//!   so concurrent writers cannot overshoot the byte budget
//! - Expired entries found on read are dropped and counted as misses

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::entry::{now_millis, CacheEntry, EntryMetadata};
use super::lru::{LruIndex, Weighted};
use super::tier::{Tier, TierKind, TierStats};
use super::DEFAULT_FAST_CAPACITY;
use crate::error::Result;

/// Fast Tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FastConfig {
    /// Maximum capacity in bytes
    pub capacity: u64,
}

impl Default for FastConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_FAST_CAPACITY,
        }
    }
}

impl Weighted for CacheEntry {
    fn weight(&self) -> u64 {
        self.size()
    }
}

/// Fast Tier - RAM-based hot cache
pub struct FastTier {
    state: Mutex<LruIndex<CacheEntry>>,
    config: FastConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl FastTier {
    /// Create with default configuration
    pub fn new() -> Self {
        Self::with_config(FastConfig::default())
    }

    /// Create with custom configuration
    pub fn with_config(config: FastConfig) -> Self {
        Self {
            state: Mutex::new(LruIndex::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get a live entry, refreshing its recency
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut state = self.state.lock();

        let expired = match state.get(key) {
            Some(entry) if !entry.is_expired() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert an entry, evicting LRU entries until it fits.
    ///
    /// Returns false when the entry alone exceeds the capacity; any older
    /// entry for the key is dropped in that case.
    pub fn put(&self, entry: CacheEntry) -> bool {
        let mut state = self.state.lock();
        self.insert_locked(&mut state, entry)
    }

    /// Insert only if the stored entry for the key is absent, expired or of
    /// an older version.
    ///
    /// Returns whether the entry was stored.
    pub fn put_if_newer(&self, entry: CacheEntry) -> bool {
        let mut state = self.state.lock();
        let superseded = state
            .peek(entry.key())
            .is_some_and(|current| !current.is_expired() && current.version() >= entry.version());
        if superseded {
            return false;
        }
        self.insert_locked(&mut state, entry)
    }

    fn insert_locked(&self, state: &mut LruIndex<CacheEntry>, entry: CacheEntry) -> bool {
        state.remove(entry.key());

        let size = entry.size();
        if size > self.config.capacity {
            debug!(
                key = entry.key(),
                size,
                capacity = self.config.capacity,
                "Entry larger than fast tier, not cached"
            );
            return false;
        }

        let evicted = state.make_room(size, self.config.capacity);
        state.insert(entry.key().to_string(), entry);

        if !evicted.is_empty() {
            self.evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            debug!(count = evicted.len(), "Fast tier evicted entries to make room");
        }
        true
    }

    /// Remove an entry
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.state.lock().remove(key)
    }

    /// Check presence without touching recency
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().contains(key)
    }

    /// Evict `ceil(len * fraction)` entries in LRU order
    pub fn evict_fraction(&self, fraction: f64) -> usize {
        let fraction = fraction.clamp(0.0, 1.0);
        let mut state = self.state.lock();
        let target = (state.len() as f64 * fraction).ceil() as usize;

        let mut evicted = 0;
        while evicted < target && state.pop_lru().is_some() {
            evicted += 1;
        }
        drop(state);

        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Drop expired entries
    pub fn purge(&self) -> usize {
        let now = now_millis();
        let expired: Vec<String> = {
            let state = self.state.lock();
            state
                .values()
                .filter(|e| e.meta.is_expired_at(now))
                .map(|e| e.key().to_string())
                .collect()
        };

        let mut removed = 0;
        for key in expired {
            // Re-check: the key may have been rewritten since the snapshot
            let mut state = self.state.lock();
            if state.peek(&key).is_some_and(|e| e.meta.is_expired_at(now)) {
                state.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Keys from least to most recently used
    pub fn keys_lru_order(&self) -> Vec<String> {
        self.state.lock().keys_lru_order()
    }

    /// Current size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.state.lock().used()
    }

    /// Number of entries
    pub fn entry_count(&self) -> usize {
        self.state.lock().len()
    }

    /// Configuration
    pub fn config(&self) -> &FastConfig {
        &self.config
    }
}

impl Default for FastTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tier for FastTier {
    fn kind(&self) -> TierKind {
        TierKind::Fast
    }

    async fn read(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.get(key))
    }

    async fn write(&self, entry: CacheEntry) -> Result<()> {
        self.put(entry);
        Ok(())
    }

    async fn write_if_newer(&self, entry: CacheEntry) -> Result<bool> {
        Ok(self.put_if_newer(entry))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(FastTier::remove(self, key).is_some())
    }

    async fn enumerate(&self) -> Result<Vec<EntryMetadata>> {
        Ok(self.state.lock().values().map(|e| e.meta.clone()).collect())
    }

    async fn clear(&self) -> Result<()> {
        self.state.lock().clear();
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        Ok(self.purge())
    }

    fn shed(&self, fraction: f64) -> usize {
        self.evict_fraction(fraction)
    }

    fn capacity_used(&self) -> u64 {
        self.size_bytes()
    }

    fn capacity_limit(&self) -> u64 {
        self.config.capacity
    }

    fn len(&self) -> usize {
        self.entry_count()
    }

    fn stores_compressed(&self) -> bool {
        false
    }

    fn stats(&self) -> TierStats {
        let (entries, size_bytes) = {
            let state = self.state.lock();
            (state.len(), state.used())
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        TierStats {
            kind: TierKind::Fast,
            entries,
            size_bytes,
            capacity_bytes: self.config.capacity,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            utilization: self.utilization(),
            hit_ratio: TierStats::ratio(hits, misses),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

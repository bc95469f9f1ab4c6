//! Cache Coordinator - Unified Three-Tier Cache
//!
//! Walks the tier chain on reads (promoting hits upward), writes through to
//! every tier on `set`, and keeps per-key versions and statistics.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use tracing::{debug, info, instrument, warn};

use super::compression::{CompressionAlgorithm, CompressionWorker};
use super::durable::DurableTier;
use super::edge::EdgeTier;
use super::entry::CacheEntry;
use super::fast::FastTier;
use super::metrics::{CacheMetrics, CacheStats, LatencyTracker};
use super::strategy::StrategyRegistry;
use super::tier::{Tier, TierKind};
use crate::config::TierCacheConfig;
use crate::error::{Error, Result};

/// Options for [`CacheCoordinator::set`]
#[derive(Debug, Clone)]
pub struct SetOptions {
    /// TTL; the coordinator default when unset
    pub ttl: Option<Duration>,
    /// Explicit version; `last + 1` when unset. A value at or below the
    /// last issued version is raised to `last + 1`.
    pub version: Option<u64>,
    /// Compress payloads above the threshold for Durable/Edge
    pub compress: bool,
    /// Strategy tag recorded with the entry
    pub strategy: Option<String>,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            version: None,
            compress: true,
            strategy: None,
        }
    }
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }
}

/// Options for [`CacheCoordinator::get_with`]
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Only accept an entry with exactly this version
    pub version: Option<u64>,
}

/// Key selector for [`CacheCoordinator::clear`].
///
/// `Prefix` matches keys starting with the string. `Regex` matches keys in
/// which the expression finds a match anywhere; anchor it with `^`/`$` for a
/// whole-key match.
#[derive(Debug, Clone)]
pub enum ClearPattern {
    Prefix(String),
    Regex(Regex),
}

impl ClearPattern {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        ClearPattern::Prefix(prefix.into())
    }

    pub fn regex(expr: &str) -> Result<Self> {
        Regex::new(expr)
            .map(ClearPattern::Regex)
            .map_err(|e| Error::InvalidPattern {
                pattern: expr.to_string(),
                reason: e.to_string(),
            })
    }

    /// `re:<expr>` is a regex, anything else a prefix
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.strip_prefix("re:") {
            Some(expr) => Self::regex(expr),
            None => Ok(Self::prefix(raw)),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            ClearPattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
            ClearPattern::Regex(re) => re.is_match(key),
        }
    }
}

impl FromStr for ClearPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Outcome of a write-through
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    /// Version assigned to the entry
    pub version: u64,
    /// Tiers that accepted the write
    pub written: Vec<TierKind>,
    /// Tiers whose write failed (logged)
    pub failed: Vec<TierKind>,
    /// Whether Durable/Edge received a compressed payload
    pub compressed: bool,
}

impl WriteReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Unified cache coordinator
pub struct CacheCoordinator {
    /// Tier chain, fastest first
    tiers: Vec<Arc<dyn Tier>>,
    compressor: Option<CompressionWorker>,
    /// Last version issued per key
    versions: DashMap<String, u64>,
    pub(crate) strategies: RwLock<StrategyRegistry>,
    metrics: Arc<CacheMetrics>,
    default_ttl: Duration,
}

impl CacheCoordinator {
    /// Build the tier chain described by `config`.
    ///
    /// A Durable tier that cannot be opened is logged and left out; the
    /// cache still works with the remaining tiers.
    pub async fn open(config: &TierCacheConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let mut tiers: Vec<Arc<dyn Tier>> =
            vec![Arc::new(FastTier::with_config(config.fast.clone()))];

        if config.durable.enabled {
            match DurableTier::open(config.durable.clone()).await {
                Ok(tier) => tiers.push(Arc::new(tier)),
                Err(e) => warn!(
                    dir = %config.durable.dir.display(),
                    error = %e,
                    "Durable tier unavailable, continuing without it"
                ),
            }
        }
        if config.edge.enabled {
            tiers.push(Arc::new(EdgeTier::in_memory(config.edge.clone())));
        }

        let cache = Self::with_tiers(config, tiers);
        cache.seed_versions().await;

        info!(
            tiers = ?cache.tiers.iter().map(|t| t.kind().as_str()).collect::<Vec<_>>(),
            compression = cache.compressor.is_some(),
            "Cache coordinator ready"
        );
        Ok(cache)
    }

    /// Build over an explicit tier chain (fastest first)
    pub fn with_tiers(config: &TierCacheConfig, tiers: Vec<Arc<dyn Tier>>) -> Arc<Self> {
        let compressor = match CompressionWorker::spawn(config.compression.clone()) {
            Ok(worker) => Some(worker),
            Err(e) => {
                warn!(error = %e, "Compression worker failed to start, storing uncompressed");
                None
            }
        };

        Arc::new(Self {
            tiers,
            compressor,
            versions: DashMap::new(),
            strategies: RwLock::new(StrategyRegistry::default()),
            metrics: Arc::new(CacheMetrics::new()),
            default_ttl: config.default_ttl,
        })
    }

    /// Fast + Edge tiers, nothing on disk
    pub fn in_memory() -> Arc<Self> {
        let config = TierCacheConfig::in_memory();
        let tiers: Vec<Arc<dyn Tier>> = vec![
            Arc::new(FastTier::with_config(config.fast.clone())),
            Arc::new(EdgeTier::in_memory(config.edge.clone())),
        ];
        Self::with_tiers(&config, tiers)
    }

    /// Resume version numbering from what the tiers already hold
    async fn seed_versions(&self) {
        for tier in &self.tiers {
            match tier.enumerate().await {
                Ok(headers) => {
                    for meta in headers {
                        self.versions
                            .entry(meta.key)
                            .and_modify(|v| *v = (*v).max(meta.version))
                            .or_insert(meta.version);
                    }
                }
                Err(e) => warn!(tier = %tier.kind(), error = %e, "Could not enumerate tier"),
            }
        }
    }

    /// Tier chain, fastest first
    pub fn tiers(&self) -> &[Arc<dyn Tier>] {
        &self.tiers
    }

    /// A tier by kind, if enabled
    pub fn tier(&self, kind: TierKind) -> Option<&Arc<dyn Tier>> {
        self.tiers.iter().find(|t| t.kind() == kind)
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Last version issued for `key`
    pub fn current_version(&self, key: &str) -> Option<u64> {
        self.versions.get(key).map(|v| *v)
    }

    fn next_version(&self, key: &str, explicit: Option<u64>) -> u64 {
        let mut last = self.versions.entry(key.to_string()).or_insert(0);
        let version = match explicit {
            Some(v) if v > *last => v,
            Some(v) => {
                debug!(key, requested = v, last = *last, "Explicit version not above last, raised");
                *last + 1
            }
            None => *last + 1,
        };
        *last = version;
        version
    }

    /// Look up `key` across all tiers
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.get_with(key, GetOptions::default()).await
    }

    /// Look up `key`, optionally requiring a specific version
    #[instrument(level = "trace", skip(self))]
    pub async fn get_with(&self, key: &str, options: GetOptions) -> Option<Bytes> {
        let tracker = LatencyTracker::start();
        let mut found = None;

        for (depth, tier) in self.tiers.iter().enumerate() {
            let kind = tier.kind();
            let entry = match tier.read(key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.metrics.record_miss(kind);
                    continue;
                }
                Err(e) => {
                    warn!(tier = %kind, key, error = %e, "Tier read failed, treating as miss");
                    self.metrics.record_tier_error(kind);
                    self.metrics.record_miss(kind);
                    continue;
                }
            };

            let wrong_version = options.version.is_some_and(|v| v != entry.version());
            if entry.is_expired() || wrong_version {
                self.metrics.record_miss(kind);
                continue;
            }

            let payload = match self.materialize(&entry).await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(tier = %kind, key, error = %e, "Discarding undecodable entry");
                    self.metrics.record_decompress_failure();
                    self.metrics.record_miss(kind);
                    if let Err(e) = tier.remove(key).await {
                        warn!(tier = %kind, key, error = %e, "Failed to remove undecodable entry");
                    }
                    continue;
                }
            };

            self.metrics.record_hit(kind);
            self.promote(&self.tiers[..depth], &entry, &payload).await;
            found = Some(payload);
            break;
        }

        self.metrics.record_get(found.is_some(), tracker.elapsed());
        found
    }

    /// Uncompressed payload of `entry`
    async fn materialize(&self, entry: &CacheEntry) -> Result<Bytes> {
        if !entry.meta.compressed {
            return Ok(entry.payload().clone());
        }
        let worker = self.compressor.as_ref().ok_or(Error::WorkerUnavailable)?;
        let payload = worker
            .decompress(entry.payload().clone(), entry.meta.algorithm)
            .await?;
        if payload.len() as u64 != entry.meta.original_size {
            return Err(Error::DecompressionFailed {
                algorithm: entry.meta.algorithm.to_string(),
                reason: format!(
                    "expected {} bytes, got {}",
                    entry.meta.original_size,
                    payload.len()
                ),
            });
        }
        Ok(payload)
    }

    /// Copy a lower-tier hit into the faster tiers above it.
    ///
    /// Skipped once a newer version has been issued for the key; each tier
    /// also refuses the copy if it already holds a version at least as new.
    async fn promote(&self, upper: &[Arc<dyn Tier>], entry: &CacheEntry, payload: &Bytes) {
        for tier in upper {
            if self
                .current_version(entry.key())
                .is_some_and(|last| last > entry.version())
            {
                debug!(key = entry.key(), version = entry.version(), "Newer version issued, promotion skipped");
                return;
            }
            let copy = if tier.stores_compressed() || !entry.meta.compressed {
                entry.clone()
            } else {
                entry.to_uncompressed(payload.clone())
            };
            match tier.write_if_newer(copy).await {
                Ok(true) => self.metrics.record_promotion(tier.kind()),
                Ok(false) => {
                    debug!(tier = %tier.kind(), key = entry.key(), "Promotion not stored")
                }
                Err(e) => debug!(tier = %tier.kind(), key = entry.key(), error = %e, "Promotion failed"),
            }
        }
    }

    /// Compressed copy of `entry` for the tiers that accept one
    async fn pack(&self, entry: &CacheEntry) -> Option<CacheEntry> {
        let worker = self.compressor.as_ref()?;
        if !worker.should_compress(entry.payload().len()) {
            return None;
        }
        match worker.compress(entry.payload().clone()).await {
            Ok((data, algorithm)) if algorithm != CompressionAlgorithm::None => {
                self.metrics
                    .record_compression(entry.size(), data.len() as u64);
                Some(entry.to_compressed(data, algorithm))
            }
            Ok(_) => None,
            Err(e) => {
                warn!(key = entry.key(), error = %e, "Compression unavailable, storing uncompressed");
                None
            }
        }
    }

    /// Write `payload` through to every tier
    #[instrument(skip(self, payload, options), fields(size = payload.len()))]
    pub async fn set(&self, key: &str, payload: Bytes, options: SetOptions) -> WriteReport {
        let tracker = LatencyTracker::start();
        let ttl = options.ttl.unwrap_or(self.default_ttl);
        let version = self.next_version(key, options.version);

        let mut entry = CacheEntry::new(key, payload, ttl).with_version(version);
        if let Some(strategy) = options.strategy {
            entry = entry.with_strategy(strategy);
        }
        let packed = if options.compress {
            self.pack(&entry).await
        } else {
            None
        };

        let writes = self.tiers.iter().map(|tier| {
            let item = match &packed {
                Some(packed) if tier.stores_compressed() => packed.clone(),
                _ => entry.clone(),
            };
            async move { (tier.kind(), tier.write(item).await) }
        });

        let mut report = WriteReport {
            version,
            written: Vec::new(),
            failed: Vec::new(),
            compressed: packed.is_some(),
        };
        for (kind, result) in join_all(writes).await {
            match result {
                Ok(()) => report.written.push(kind),
                Err(e) => {
                    warn!(tier = %kind, key, error = %e, "Tier write failed");
                    self.metrics.record_tier_error(kind);
                    report.failed.push(kind);
                }
            }
        }

        self.metrics.record_set(tracker.elapsed());
        report
    }

    /// Remove `key` from every tier; true if any tier held it
    pub async fn delete(&self, key: &str) -> bool {
        self.metrics.record_delete();
        let mut deleted = false;
        for tier in &self.tiers {
            match tier.remove(key).await {
                Ok(removed) => deleted |= removed,
                Err(e) => {
                    warn!(tier = %tier.kind(), key, error = %e, "Tier remove failed");
                    self.metrics.record_tier_error(tier.kind());
                }
            }
        }
        deleted
    }

    /// Remove every key, or the keys matching `pattern`.
    ///
    /// Returns the number of distinct keys removed.
    pub async fn clear(&self, pattern: Option<&ClearPattern>) -> usize {
        let mut keys = std::collections::HashSet::new();
        for tier in &self.tiers {
            match tier.enumerate().await {
                Ok(headers) => keys.extend(
                    headers
                        .into_iter()
                        .map(|meta| meta.key)
                        .filter(|key| pattern.map_or(true, |p| p.matches(key))),
                ),
                Err(e) => warn!(tier = %tier.kind(), error = %e, "Could not enumerate tier"),
            }
        }

        for tier in &self.tiers {
            let result = match pattern {
                None => tier.clear().await,
                Some(_) => {
                    let mut result = Ok(());
                    for key in &keys {
                        if let Err(e) = tier.remove(key).await {
                            result = Err(e);
                        }
                    }
                    result
                }
            };
            if let Err(e) = result {
                warn!(tier = %tier.kind(), error = %e, "Tier clear failed");
                self.metrics.record_tier_error(tier.kind());
            }
        }

        debug!(removed = keys.len(), "Cache cleared");
        keys.len()
    }

    /// Aggregate statistics
    pub fn get_stats(&self) -> CacheStats {
        let tiers: Vec<_> = self.tiers.iter().map(|t| t.stats()).collect();
        let fast = tiers.iter().find(|s| s.kind == TierKind::Fast);
        CacheStats {
            hit_rate: self.metrics.hit_rate(),
            memory_usage: fast.map_or(0, |s| s.size_bytes),
            entries_count: fast.map_or(0, |s| s.entries),
            total_entries: tiers.iter().map(|s| s.entries).sum(),
            metrics: self.metrics.snapshot(),
            tiers,
        }
    }

    /// Typed read of a JSON value
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Typed write of a JSON value
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> Result<WriteReport> {
        let raw = serde_json::to_vec(value)?;
        Ok(self.set(key, Bytes::from(raw), options).await)
    }
}

impl Serialize for ClearPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ClearPattern::Prefix(prefix) => serializer.serialize_str(prefix),
            ClearPattern::Regex(re) => serializer.serialize_str(&format!("re:{}", re.as_str())),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

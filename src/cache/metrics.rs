//! Cache Metrics Collection
//!
//! Lock-free counters for monitoring cache health. Recording never blocks
//! and never fails, so it is safe on every hot path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::tier::{TierKind, TierStats};

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    promotions: AtomicU64,
}

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    fast: TierCounters,
    durable: TierCounters,
    edge: TierCounters,

    // Coordinator operations
    gets: AtomicU64,
    full_misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,

    // Compression
    compressions: AtomicU64,
    bytes_saved: AtomicU64,
    decompress_failures: AtomicU64,

    // Strategies and maintenance
    background_refreshes: AtomicU64,
    background_refresh_failures: AtomicU64,
    swept: AtomicU64,
    pressure_evictions: AtomicU64,

    // Operation latencies (microseconds, exponential moving average)
    get_latency_us: AtomicU64,
    set_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    fn tier(&self, kind: TierKind) -> &TierCounters {
        match kind {
            TierKind::Fast => &self.fast,
            TierKind::Durable => &self.durable,
            TierKind::Edge => &self.edge,
        }
    }

    // Per-tier
    pub fn record_hit(&self, kind: TierKind) {
        self.tier(kind).hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, kind: TierKind) {
        self.tier(kind).misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tier_error(&self, kind: TierKind) {
        self.tier(kind).errors.fetch_add(1, Ordering::Relaxed);
    }

    /// An entry was copied into `kind` from a lower tier
    pub fn record_promotion(&self, kind: TierKind) {
        self.tier(kind).promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self, kind: TierKind) -> u64 {
        self.tier(kind).hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self, kind: TierKind) -> u64 {
        self.tier(kind).misses.load(Ordering::Relaxed)
    }

    pub fn tier_errors(&self, kind: TierKind) -> u64 {
        self.tier(kind).errors.load(Ordering::Relaxed)
    }

    pub fn promotions(&self, kind: TierKind) -> u64 {
        self.tier(kind).promotions.load(Ordering::Relaxed)
    }

    // Operations
    pub fn record_get(&self, hit: bool, duration: Duration) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if !hit {
            self.full_misses.fetch_add(1, Ordering::Relaxed);
        }
        Self::update_latency_ema(&self.get_latency_us, duration);
    }

    pub fn record_set(&self, duration: Duration) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        Self::update_latency_ema(&self.set_latency_us, duration);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    // Compression
    pub fn record_compression(&self, original: u64, compressed: u64) {
        self.compressions.fetch_add(1, Ordering::Relaxed);
        self.bytes_saved
            .fetch_add(original.saturating_sub(compressed), Ordering::Relaxed);
    }

    pub fn record_decompress_failure(&self) {
        self.decompress_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Strategies and maintenance
    pub fn record_background_refresh(&self, ok: bool) {
        if ok {
            self.background_refreshes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.background_refresh_failures
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_swept(&self, count: usize) {
        self.swept.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_pressure_evictions(&self, count: usize) {
        self.pressure_evictions
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn update_latency_ema(target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn get_latency(&self) -> Duration {
        Duration::from_micros(self.get_latency_us.load(Ordering::Relaxed))
    }

    pub fn set_latency(&self) -> Duration {
        Duration::from_micros(self.set_latency_us.load(Ordering::Relaxed))
    }

    /// Fraction of `get` calls answered by some tier
    pub fn hit_rate(&self) -> f64 {
        let gets = self.gets.load(Ordering::Relaxed);
        if gets == 0 {
            0.0
        } else {
            let misses = self.full_misses.load(Ordering::Relaxed);
            gets.saturating_sub(misses) as f64 / gets as f64
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let tier = |kind| TierSnapshot {
            hits: self.hits(kind),
            misses: self.misses(kind),
            errors: self.tier_errors(kind),
            promotions: self.promotions(kind),
        };
        MetricsSnapshot {
            fast: tier(TierKind::Fast),
            durable: tier(TierKind::Durable),
            edge: tier(TierKind::Edge),
            gets: self.gets.load(Ordering::Relaxed),
            full_misses: self.full_misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            compressions: self.compressions.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
            decompress_failures: self.decompress_failures.load(Ordering::Relaxed),
            background_refreshes: self.background_refreshes.load(Ordering::Relaxed),
            background_refresh_failures: self
                .background_refresh_failures
                .load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
            pressure_evictions: self.pressure_evictions.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            get_latency_us: self.get_latency().as_micros() as u64,
            set_latency_us: self.set_latency().as_micros() as u64,
        }
    }
}

/// Per-tier counters in a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub promotions: u64,
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub fast: TierSnapshot,
    pub durable: TierSnapshot,
    pub edge: TierSnapshot,

    pub gets: u64,
    pub full_misses: u64,
    pub sets: u64,
    pub deletes: u64,

    pub compressions: u64,
    pub bytes_saved: u64,
    pub decompress_failures: u64,

    pub background_refreshes: u64,
    pub background_refresh_failures: u64,
    pub swept: u64,
    pub pressure_evictions: u64,

    pub hit_rate: f64,
    pub get_latency_us: u64,
    pub set_latency_us: u64,
}

/// Aggregate view returned by `CacheCoordinator::get_stats`
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Fraction of gets served from any tier
    pub hit_rate: f64,
    /// Bytes held by the Fast tier
    pub memory_usage: u64,
    /// Entries in the Fast tier
    pub entries_count: usize,
    /// Entries across all tiers (a key may be counted once per tier)
    pub total_entries: usize,
    pub tiers: Vec<TierStats>,
    pub metrics: MetricsSnapshot,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_counters_are_independent() {
        let metrics = CacheMetrics::new();

        metrics.record_hit(TierKind::Fast);
        metrics.record_hit(TierKind::Fast);
        metrics.record_miss(TierKind::Fast);
        metrics.record_hit(TierKind::Durable);
        metrics.record_tier_error(TierKind::Edge);

        assert_eq!(metrics.hits(TierKind::Fast), 2);
        assert_eq!(metrics.misses(TierKind::Fast), 1);
        assert_eq!(metrics.hits(TierKind::Durable), 1);
        assert_eq!(metrics.hits(TierKind::Edge), 0);
        assert_eq!(metrics.tier_errors(TierKind::Edge), 1);
    }

    #[test]
    fn test_hit_rate() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_rate(), 0.0);

        metrics.record_get(true, Duration::from_micros(5));
        metrics.record_get(true, Duration::from_micros(5));
        metrics.record_get(true, Duration::from_micros(5));
        metrics.record_get(false, Duration::from_micros(5));

        assert!((metrics.hit_rate() - 0.75).abs() < 0.001);
    }

    #[test]
    fn test_latency_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_get(true, Duration::from_micros(100));
        assert_eq!(metrics.get_latency(), Duration::from_micros(100));

        // EMA should smooth values
        metrics.record_get(true, Duration::from_micros(200));
        let latency = metrics.get_latency().as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_snapshot() {
        let metrics = CacheMetrics::new();

        metrics.record_promotion(TierKind::Fast);
        metrics.record_compression(4096, 1024);
        metrics.record_background_refresh(true);
        metrics.record_background_refresh(false);
        metrics.record_swept(3);
        metrics.record_pressure_evictions(7);
        metrics.record_set(Duration::from_micros(40));
        metrics.record_delete();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fast.promotions, 1);
        assert_eq!(snapshot.compressions, 1);
        assert_eq!(snapshot.bytes_saved, 3072);
        assert_eq!(snapshot.background_refreshes, 1);
        assert_eq!(snapshot.background_refresh_failures, 1);
        assert_eq!(snapshot.swept, 3);
        assert_eq!(snapshot.pressure_evictions, 7);
        assert_eq!(snapshot.sets, 1);
        assert_eq!(snapshot.deletes, 1);
        assert_eq!(snapshot.set_latency_us, 40);
    }

    #[test]
    fn test_latency_tracker() {
        let tracker = LatencyTracker::start();
        std::thread::sleep(Duration::from_millis(10));
        let elapsed = tracker.elapsed();
        assert!(elapsed >= Duration::from_millis(10));
    }
}

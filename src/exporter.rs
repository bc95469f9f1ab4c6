//! Prometheus Exporter
//!
//! Mirrors [`CacheStats`] into a dedicated Prometheus registry. The cache's
//! own counters stay authoritative; `refresh` copies them over before each
//! scrape.

use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::cache::{CacheStats, TierSnapshot};
use crate::error::{Error, Result};

/// Prometheus view of one cache instance
pub struct CacheExporter {
    registry: Registry,
    hit_rate: Gauge,
    memory_usage: IntGauge,
    tier_entries: IntGaugeVec,
    tier_size: IntGaugeVec,
    tier_capacity: IntGaugeVec,
    tier_hits: IntCounterVec,
    tier_misses: IntCounterVec,
    tier_errors: IntCounterVec,
    tier_promotions: IntCounterVec,
    tier_evictions: IntCounterVec,
    gets: IntCounter,
    sets: IntCounter,
    deletes: IntCounter,
    compressions: IntCounter,
    bytes_saved: IntCounter,
    decompress_failures: IntCounter,
    refreshes: IntCounterVec,
    swept: IntCounter,
    pressure_evictions: IntCounter,
}

fn prom(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", e))
}

/// Bring a monotonic counter up to `value`
fn sync_counter(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

impl CacheExporter {
    /// Create and register all metrics under the `tiercache_` namespace
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("tiercache".into()), None).map_err(prom)?;

        let gauge_vec = |name: &str, help: &str| -> Result<IntGaugeVec> {
            let vec = IntGaugeVec::new(Opts::new(name, help), &["tier"]).map_err(prom)?;
            registry.register(Box::new(vec.clone())).map_err(prom)?;
            Ok(vec)
        };
        let counter_vec = |name: &str, help: &str, label: &str| -> Result<IntCounterVec> {
            let vec = IntCounterVec::new(Opts::new(name, help), &[label]).map_err(prom)?;
            registry.register(Box::new(vec.clone())).map_err(prom)?;
            Ok(vec)
        };
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::new(name, help).map_err(prom)?;
            registry.register(Box::new(counter.clone())).map_err(prom)?;
            Ok(counter)
        };

        let hit_rate = Gauge::new("hit_rate", "Fraction of gets served from any tier").map_err(prom)?;
        registry.register(Box::new(hit_rate.clone())).map_err(prom)?;
        let memory_usage =
            IntGauge::new("memory_usage_bytes", "Bytes held by the fast tier").map_err(prom)?;
        registry
            .register(Box::new(memory_usage.clone()))
            .map_err(prom)?;

        Ok(Self {
            hit_rate,
            memory_usage,
            tier_entries: gauge_vec("tier_entries", "Entries stored per tier")?,
            tier_size: gauge_vec("tier_size_bytes", "Bytes stored per tier")?,
            tier_capacity: gauge_vec("tier_capacity_bytes", "Byte budget per tier")?,
            tier_hits: counter_vec("tier_hits_total", "Reads answered per tier", "tier")?,
            tier_misses: counter_vec("tier_misses_total", "Reads missed per tier", "tier")?,
            tier_errors: counter_vec("tier_errors_total", "Failed tier operations", "tier")?,
            tier_promotions: counter_vec(
                "tier_promotions_total",
                "Entries promoted into a tier",
                "tier",
            )?,
            tier_evictions: counter_vec(
                "tier_evictions_total",
                "Capacity evictions per tier",
                "tier",
            )?,
            gets: counter("gets_total", "Coordinator get calls")?,
            sets: counter("sets_total", "Coordinator set calls")?,
            deletes: counter("deletes_total", "Coordinator delete calls")?,
            compressions: counter("compressions_total", "Payloads stored compressed")?,
            bytes_saved: counter("compression_saved_bytes_total", "Bytes saved by compression")?,
            decompress_failures: counter(
                "decompress_failures_total",
                "Entries discarded because they could not be decompressed",
            )?,
            refreshes: counter_vec(
                "background_refreshes_total",
                "Stale-while-revalidate background refreshes",
                "outcome",
            )?,
            swept: counter("swept_total", "Expired entries removed by sweeps")?,
            pressure_evictions: counter(
                "pressure_evictions_total",
                "Entries evicted under memory pressure",
            )?,
            registry,
        })
    }

    /// Copy `stats` into the registry
    pub fn refresh(&self, stats: &CacheStats) {
        self.hit_rate.set(stats.hit_rate);
        self.memory_usage.set(stats.memory_usage as i64);

        for tier in &stats.tiers {
            let label = [tier.kind.as_str()];
            self.tier_entries
                .with_label_values(&label)
                .set(tier.entries as i64);
            self.tier_size
                .with_label_values(&label)
                .set(tier.size_bytes as i64);
            self.tier_capacity
                .with_label_values(&label)
                .set(tier.capacity_bytes as i64);
            sync_counter(&self.tier_evictions.with_label_values(&label), tier.evictions);
        }

        let m = &stats.metrics;
        for (label, snapshot) in [("fast", &m.fast), ("durable", &m.durable), ("edge", &m.edge)] {
            self.refresh_tier_counters(label, snapshot);
        }

        sync_counter(&self.gets, m.gets);
        sync_counter(&self.sets, m.sets);
        sync_counter(&self.deletes, m.deletes);
        sync_counter(&self.compressions, m.compressions);
        sync_counter(&self.bytes_saved, m.bytes_saved);
        sync_counter(&self.decompress_failures, m.decompress_failures);
        sync_counter(&self.refreshes.with_label_values(&["ok"]), m.background_refreshes);
        sync_counter(
            &self.refreshes.with_label_values(&["failed"]),
            m.background_refresh_failures,
        );
        sync_counter(&self.swept, m.swept);
        sync_counter(&self.pressure_evictions, m.pressure_evictions);
    }

    fn refresh_tier_counters(&self, label: &str, snapshot: &TierSnapshot) {
        let label = [label];
        sync_counter(&self.tier_hits.with_label_values(&label), snapshot.hits);
        sync_counter(&self.tier_misses.with_label_values(&label), snapshot.misses);
        sync_counter(&self.tier_errors.with_label_values(&label), snapshot.errors);
        sync_counter(
            &self.tier_promotions.with_label_values(&label),
            snapshot.promotions,
        );
    }

    /// Prometheus text exposition
    pub fn render(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheCoordinator, SetOptions};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_render_reflects_cache() {
        let cache = CacheCoordinator::in_memory();
        cache
            .set("k", Bytes::from_static(b"value"), SetOptions::new())
            .await;
        cache.get("k").await;
        cache.get("missing").await;

        let exporter = CacheExporter::new().unwrap();
        exporter.refresh(&cache.get_stats());
        let text = String::from_utf8(exporter.render().unwrap()).unwrap();

        assert!(text.contains("tiercache_hit_rate 0.5"));
        assert!(text.contains("tiercache_sets_total 1"));
        assert!(text.contains("tiercache_tier_entries{tier=\"fast\"} 1"));
        assert!(text.contains("tiercache_tier_hits_total{tier=\"fast\"} 1"));
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent_for_counters() {
        let cache = CacheCoordinator::in_memory();
        cache
            .set("k", Bytes::from_static(b"v"), SetOptions::new())
            .await;

        let exporter = CacheExporter::new().unwrap();
        exporter.refresh(&cache.get_stats());
        exporter.refresh(&cache.get_stats());
        assert_eq!(exporter.sets.get(), 1);
    }
}

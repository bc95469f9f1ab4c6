//! Three-Tier Cache System
//!
//! Stores computed or fetched payloads across a Fast (RAM), Durable (disk) and
//! Edge (network-intercepting) tier, with named fetch strategies, expiration,
//! per-key versioning, background compression and pressure-driven eviction.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                 Strategy (cache-first, network-first, swr, ...)           │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                          Cache Coordinator                                │
//! │           get: Fast ─▶ Durable ─▶ Edge   (hits promoted upward)           │
//! │           set: write-through to every enabled tier                        │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Fast Tier (RAM)      │ Durable Tier (Disk)   │ Edge Tier (Network)       │
//! │  ┌────────────────┐   │ ┌─────────────────┐   │ ┌────────────────────┐    │
//! │  │ LRU, byte cap  │   │ │ record files    │   │ │ EdgeBackend        │    │
//! │  │ uncompressed   │   │ │ + LRU index     │   │ │ (fetch intercept)  │    │
//! │  └────────────────┘   │ └─────────────────┘   │ └────────────────────┘    │
//! │                       │          ▲            │          ▲                │
//! │                       └──── Compression Worker (LZ4) ────┘                │
//! │                                                                           │
//! │                Maintenance Scheduler (TTL sweep, pressure)                │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Semantics
//!
//! - Expired entries are never returned: every tier checks on read and the
//!   scheduler sweeps periodically.
//! - Fast Tier size never exceeds its byte budget; eviction runs inside the
//!   write's critical section.
//! - Tier and decompression failures are logged and treated as misses.

mod codec;
mod compression;
mod coordinator;
mod durable;
mod edge;
mod entry;
mod fast;
mod lru;
mod metrics;
mod scheduler;
mod strategy;
mod tier;

pub use codec::{decode, decode_header, encode, RECORD_MAGIC, SCHEMA_VERSION};
pub use compression::{
    CompressionAlgorithm, CompressionConfig, CompressionWorker, MAX_DECOMPRESSED_SIZE,
};
pub use coordinator::{CacheCoordinator, ClearPattern, GetOptions, SetOptions, WriteReport};
pub use durable::{read_record_headers, DurableConfig, DurableTier, LoadReport, RecordHeader};
pub use edge::{
    EdgeBackend, EdgeBackendStats, EdgeConfig, EdgeTier, InMemoryEdgeBackend, INTERCEPT_STRATEGY,
};
pub use entry::{CacheEntry, EntryMetadata};
pub use fast::{FastConfig, FastTier};
pub use metrics::{CacheMetrics, CacheStats, LatencyTracker, MetricsSnapshot, TierSnapshot};
pub use scheduler::{MaintenanceScheduler, SchedulerConfig, SchedulerState, SweepReport};
pub use strategy::{Strategy, StrategyRegistry};
pub use tier::{Tier, TierKind, TierStats};

use std::time::Duration;

/// Default Fast Tier capacity (64MB)
pub const DEFAULT_FAST_CAPACITY: u64 = 64 * 1024 * 1024;

/// Default Durable Tier capacity (512MB)
pub const DEFAULT_DURABLE_CAPACITY: u64 = 512 * 1024 * 1024;

/// Default Edge Tier capacity (1GB)
pub const DEFAULT_EDGE_CAPACITY: u64 = 1024 * 1024 * 1024;

/// Payloads at or below this size are never compressed (1KB)
pub const DEFAULT_COMPRESSION_THRESHOLD: u64 = 1024;

/// TTL used when a write does not specify one
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacities_are_ordered() {
        // Lower tiers are larger
        assert!(DEFAULT_FAST_CAPACITY < DEFAULT_DURABLE_CAPACITY);
        assert!(DEFAULT_DURABLE_CAPACITY < DEFAULT_EDGE_CAPACITY);
    }

    #[test]
    fn test_default_ttl() {
        assert_eq!(DEFAULT_TTL, Duration::from_secs(300));
    }

    #[test]
    fn test_compression_threshold_below_fast_capacity() {
        assert!(DEFAULT_COMPRESSION_THRESHOLD < DEFAULT_FAST_CAPACITY);
    }
}

//! TierCache - Multi-Tier Cache
//!
//! Caches fetched or computed payloads across three tiers of increasing size
//! and latency, with named fetch strategies layered on top.
//!
//! # Architecture
//!
//! ```text
//! Strategy → Coordinator → Fast (RAM) → Durable (Disk) → Edge (Network)
//!                 ↑
//!      Compression Worker + Maintenance Scheduler
//! ```
//!
//! # Features
//!
//! - Byte-bounded LRU Fast tier
//! - Crash-tolerant Durable tier with index rebuild on open
//! - Edge tier that can intercept fetches
//! - Five fetch strategies including stale-while-revalidate
//! - LZ4 compression off the async runtime
//! - Per-key version watermarks
//! - TTL sweeps and memory-pressure eviction
//! - Prometheus exposition
//!
//! # Modules
//!
//! - [`cache`] - Tiers, coordinator, strategies and maintenance
//! - [`config`] - YAML configuration and duration parsing
//! - [`error`] - Error types
//! - [`exporter`] - Prometheus metrics exporter

pub mod cache;
pub mod config;
pub mod error;
pub mod exporter;

// Re-export commonly used types
pub use cache::{
    CacheCoordinator, CacheStats, ClearPattern, GetOptions, MaintenanceScheduler, SetOptions,
    Strategy, StrategyRegistry, Tier, TierKind, WriteReport,
};
pub use config::TierCacheConfig;
pub use error::{Error, Result};
pub use exporter::CacheExporter;

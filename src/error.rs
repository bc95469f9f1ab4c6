//! Error types for tiercache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache subsystem
///
/// Tier and compression errors are mostly recovered inside the coordinator
/// (logged and treated as a miss). Only strategy failures, configuration
/// problems and direct tier usage surface them to callers.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Invalid clear pattern
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Tier Errors
    // =========================================================================
    /// A storage tier could not serve the request
    #[error("{tier} tier unavailable: {reason}")]
    TierUnavailable { tier: String, reason: String },

    /// A stored record could not be decoded
    #[error("Corrupt cache record: {0}")]
    Codec(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// The compression worker has shut down
    #[error("Compression worker unavailable")]
    WorkerUnavailable,

    // =========================================================================
    // Strategy Errors
    // =========================================================================
    /// Unknown strategy name
    #[error("Unknown cache strategy: {0}")]
    UnknownStrategy(String),

    /// Fetch failed and nothing was cached for the key
    #[error("No network and no cached data for key '{key}': {source}")]
    NoNetworkNoCache {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Cache-only lookup found nothing
    #[error("No cached data for key '{key}'")]
    CacheOnlyMiss { key: String },

    /// Fetch failed for a strategy that has no cache fallback
    #[error("Fetch failed for key '{key}': {source}")]
    FetchFailed {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    /// True for the strategy errors that mean "no data anywhere"
    pub fn is_no_data(&self) -> bool {
        matches!(
            self,
            Error::NoNetworkNoCache { .. } | Error::CacheOnlyMiss { .. }
        )
    }
}

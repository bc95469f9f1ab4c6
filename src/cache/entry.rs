//! Cache Entry Types
//!
//! An entry is its metadata header plus an opaque payload. The header is also
//! the persisted record header, so its field names are part of the on-disk
//! format (see `codec`).

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::compression::CompressionAlgorithm;

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
pub(crate) fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Current wall-clock time in epoch milliseconds
#[inline]
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Entry metadata (persisted header)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Cache key
    pub key: String,
    /// Creation time (epoch milliseconds)
    pub timestamp: i64,
    /// Time to live (milliseconds)
    pub ttl: u64,
    /// Strategy that produced the entry
    pub strategy: Option<String>,
    /// Per-key version
    pub version: u64,
    /// Stored payload size in bytes
    pub size: u64,
    /// Whether the payload is compressed
    pub compressed: bool,
    /// Codec used when `compressed` is set
    pub algorithm: CompressionAlgorithm,
    /// Payload size before compression
    pub original_size: u64,
}

impl EntryMetadata {
    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Time to live
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl)
    }

    /// Instant (epoch ms) after which the entry is expired
    #[inline]
    pub fn expires_at_millis(&self) -> i64 {
        let ttl = i64::try_from(self.ttl).unwrap_or(i64::MAX);
        self.timestamp.saturating_add(ttl)
    }

    /// Expired iff `now > created_at + ttl`
    #[inline]
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at_millis()
    }

    /// Check if entry has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Time left before expiry (zero once expired)
    pub fn remaining_ttl(&self) -> Duration {
        let left = self.expires_at_millis().saturating_sub(now_millis());
        Duration::from_millis(u64::try_from(left).unwrap_or(0))
    }
}

/// Cache entry containing metadata and payload
#[derive(Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Entry metadata
    pub meta: EntryMetadata,
    /// Stored payload (possibly compressed)
    payload: Bytes,
}

impl CacheEntry {
    /// Create a new uncompressed entry at version 1
    pub fn new(key: impl Into<String>, payload: Bytes, ttl: Duration) -> Self {
        let size = payload.len() as u64;
        Self {
            meta: EntryMetadata {
                key: key.into(),
                timestamp: now_millis(),
                ttl: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
                strategy: None,
                version: 1,
                size,
                compressed: false,
                algorithm: CompressionAlgorithm::None,
                original_size: size,
            },
            payload,
        }
    }

    /// Reassemble from decoded parts
    pub fn from_parts(meta: EntryMetadata, payload: Bytes) -> Self {
        Self { meta, payload }
    }

    /// Set the version
    pub fn with_version(mut self, version: u64) -> Self {
        self.meta.version = version;
        self
    }

    /// Set the strategy tag
    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.meta.strategy = Some(strategy.into());
        self
    }

    /// Same entry with a compressed payload
    pub fn to_compressed(&self, payload: Bytes, algorithm: CompressionAlgorithm) -> Self {
        let mut meta = self.meta.clone();
        meta.size = payload.len() as u64;
        meta.compressed = algorithm != CompressionAlgorithm::None;
        meta.algorithm = algorithm;
        Self { meta, payload }
    }

    /// Same entry holding the uncompressed payload; timestamps are kept so
    /// promoted copies expire together with the original.
    pub fn to_uncompressed(&self, payload: Bytes) -> Self {
        let mut meta = self.meta.clone();
        meta.size = payload.len() as u64;
        meta.original_size = meta.size;
        meta.compressed = false;
        meta.algorithm = CompressionAlgorithm::None;
        Self { meta, payload }
    }

    /// Cache key
    #[inline]
    pub fn key(&self) -> &str {
        &self.meta.key
    }

    /// Stored payload (zero-copy)
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the entry, returning the payload
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Stored size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.meta.size
    }

    /// Version
    #[inline]
    pub fn version(&self) -> u64 {
        self.meta.version
    }

    /// Check if expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.meta.is_expired()
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.meta.key)
            .field("version", &self.meta.version)
            .field("size", &self.meta.size)
            .field("compressed", &self.meta.compressed)
            .field("is_expired", &self.is_expired())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_creation() {
        let entry = CacheEntry::new(
            "workouts:today",
            Bytes::from_static(b"Hello, World!"),
            Duration::from_secs(60),
        );

        assert_eq!(entry.key(), "workouts:today");
        assert_eq!(entry.size(), 13);
        assert_eq!(entry.version(), 1);
        assert_eq!(entry.meta.original_size, 13);
        assert!(!entry.meta.compressed);
        assert_eq!(entry.meta.ttl(), Duration::from_secs(60));
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_expiry_boundary() {
        let entry = CacheEntry::new("k", Bytes::new(), Duration::from_millis(100));
        let created = entry.meta.timestamp;

        // Not expired exactly at created + ttl, expired one ms later
        assert!(!entry.meta.is_expired_at(created + 100));
        assert!(entry.meta.is_expired_at(created + 101));
    }

    #[test]
    fn test_expires_after_sleep() {
        let entry = CacheEntry::new("k", Bytes::from_static(b"v"), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(30));
        assert!(entry.is_expired());
        assert_eq!(entry.meta.remaining_ttl(), Duration::ZERO);
    }

    #[test]
    fn test_builders() {
        let entry = CacheEntry::new("k", Bytes::from_static(b"v"), Duration::from_secs(1))
            .with_version(7)
            .with_strategy("cache-first");

        assert_eq!(entry.version(), 7);
        assert_eq!(entry.meta.strategy.as_deref(), Some("cache-first"));
    }

    #[test]
    fn test_compressed_and_back() {
        let entry = CacheEntry::new("k", Bytes::from(vec![7u8; 64]), Duration::from_secs(1));

        let packed = entry.to_compressed(Bytes::from_static(b"tiny"), CompressionAlgorithm::Lz4);
        assert!(packed.meta.compressed);
        assert_eq!(packed.size(), 4);
        assert_eq!(packed.meta.original_size, 64);
        assert_eq!(packed.meta.timestamp, entry.meta.timestamp);

        let unpacked = packed.to_uncompressed(entry.payload().clone());
        assert!(!unpacked.meta.compressed);
        assert_eq!(unpacked.meta.algorithm, CompressionAlgorithm::None);
        assert_eq!(unpacked.size(), 64);
        assert_eq!(unpacked.meta.timestamp, entry.meta.timestamp);
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let entry = CacheEntry::new("k", Bytes::new(), Duration::MAX);
        assert!(!entry.is_expired());
        assert_eq!(entry.meta.expires_at_millis(), i64::MAX);
    }

    #[test]
    fn test_fx_hash_is_stable() {
        assert_eq!(fx_hash(b"key"), fx_hash(b"key"));
        assert_ne!(fx_hash(b"key-1"), fx_hash(b"key-2"));
    }

    #[test]
    fn test_entry_debug() {
        let entry = CacheEntry::new("k", Bytes::from_static(b"Test"), Duration::from_secs(1));
        let debug = format!("{:?}", entry);
        assert!(debug.contains("CacheEntry"));
        assert!(debug.contains("size"));
    }
}

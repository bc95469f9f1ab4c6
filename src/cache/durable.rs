//! Durable Tier - Disk-backed Warm Cache
//!
//! One record file per key under the cache directory, in the format defined
//! by `codec`. Survives restarts: the index is rebuilt from record headers
//! on open.
//!
//! # Design
//!
//! - File name is the key's FxHash; the header carries the full key, so a
//!   hash collision is detected on read and the older key is displaced on
//!   write
//! - Writes go to a temp file and are renamed into place, so a reader sees
//!   either the old or the new record, never a partial one
//! - Mutations are serialized by an async lock; reads only take the index
//!   lock long enough to resolve a path
//! - Byte budget enforced with the same LRU discipline as the Fast tier,
//!   counting on-disk record size

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::codec::{self, PREAMBLE_LEN};
use super::entry::{fx_hash, now_millis, CacheEntry, EntryMetadata};
use super::lru::{LruIndex, Weighted};
use super::tier::{Tier, TierKind, TierStats};
use super::DEFAULT_DURABLE_CAPACITY;
use crate::error::{Error, Result};

const RECORD_EXT: &str = "rec";

/// Durable Tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableConfig {
    /// Whether the tier is part of the chain
    pub enabled: bool,
    /// Cache directory path
    pub dir: PathBuf,
    /// Maximum capacity in bytes (on-disk record size)
    pub capacity: u64,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("/var/cache/tiercache/durable"),
            capacity: DEFAULT_DURABLE_CAPACITY,
        }
    }
}

/// What `open` found on disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Records indexed
    pub loaded: usize,
    /// Expired records deleted
    pub expired: usize,
    /// Unreadable records deleted
    pub corrupt: usize,
    /// Records deleted to fit the capacity
    pub evicted: usize,
    /// Leftover temp files deleted
    pub stray_tmp: usize,
}

/// Header of a record file, as read by [`read_record_headers`]
#[derive(Debug, Clone, Serialize)]
pub struct RecordHeader {
    pub path: PathBuf,
    pub file_size: u64,
    /// Decoded header, absent when the record is unreadable
    pub meta: Option<EntryMetadata>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct Slot {
    meta: EntryMetadata,
    path: PathBuf,
    disk_size: u64,
}

impl Weighted for Slot {
    fn weight(&self) -> u64 {
        self.disk_size
    }
}

#[derive(Default)]
struct Index {
    lru: LruIndex<Slot>,
    /// File path -> key stored there
    files: HashMap<PathBuf, String>,
}

impl Index {
    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.lru.remove(key)?;
        self.files.remove(&slot.path);
        Some(slot)
    }
}

/// Durable Tier - disk-backed cache
pub struct DurableTier {
    index: Mutex<Index>,
    io_lock: tokio::sync::Mutex<()>,
    config: DurableConfig,
    load_report: LoadReport,
    tmp_seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DurableTier {
    /// Open (creating if needed) the cache directory and rebuild the index
    pub async fn open(config: DurableConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.dir).await?;

        let (index, load_report) = load_index(&config).await?;
        info!(
            dir = %config.dir.display(),
            loaded = load_report.loaded,
            expired = load_report.expired,
            corrupt = load_report.corrupt,
            evicted = load_report.evicted,
            "Durable tier opened"
        );

        Ok(Self {
            index: Mutex::new(index),
            io_lock: tokio::sync::Mutex::new(()),
            config,
            load_report,
            tmp_seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// What was found when the tier was opened
    pub fn load_report(&self) -> &LoadReport {
        &self.load_report
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.config
            .dir
            .join(format!("{:016x}.{}", fx_hash(key.as_bytes()), RECORD_EXT))
    }

    /// Drop `key` if its index slot still matches `seen`
    async fn discard_stale(&self, key: &str, seen: &EntryMetadata) {
        let _io = self.io_lock.lock().await;
        let slot = {
            let mut index = self.index.lock();
            match index.lru.peek(key) {
                Some(slot) if slot.meta == *seen => index.remove(key),
                _ => None,
            }
        };
        if let Some(slot) = slot {
            remove_file_quiet(&slot.path).await;
        }
    }

    /// Write a record; returns whether it was stored.
    ///
    /// With `only_if_newer`, a live record of the same or a higher version
    /// is kept. An oversized record is never stored and drops the old one.
    async fn store(&self, entry: CacheEntry, only_if_newer: bool) -> Result<bool> {
        let record = codec::encode(&entry)?;
        let disk_size = record.len() as u64;
        let key = entry.key().to_string();
        let path = self.path_for(&key);

        let _io = self.io_lock.lock().await;

        if only_if_newer {
            let index = self.index.lock();
            if let Some(slot) = index.lru.peek(&key) {
                if !slot.meta.is_expired() && slot.meta.version >= entry.version() {
                    return Ok(false);
                }
            }
        }

        if disk_size > self.config.capacity {
            debug!(
                key = %key,
                disk_size,
                capacity = self.config.capacity,
                "Record larger than durable tier, not cached"
            );
            let previous = self.index.lock().remove(&key);
            if let Some(slot) = previous {
                remove_file_quiet(&slot.path).await;
            }
            return Ok(false);
        }

        let tmp = path.with_extension(format!(
            "tmp{}",
            self.tmp_seq.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&tmp, &record).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            remove_file_quiet(&tmp).await;
            return Err(e.into());
        }

        let evicted = {
            let mut index = self.index.lock();
            // Hash collision: the other key's record was just overwritten
            if let Some(other) = index.files.get(&path).filter(|k| **k != key).cloned() {
                debug!(key = %key, displaced = %other, "Durable record path collision");
                index.remove(&other);
            }
            index.remove(&key);

            let evicted = index.lru.make_room(disk_size, self.config.capacity);
            for (_, slot) in &evicted {
                index.files.remove(&slot.path);
            }
            index.files.insert(path.clone(), key.clone());
            index.lru.insert(
                key,
                Slot {
                    meta: entry.meta,
                    path,
                    disk_size,
                },
            );
            evicted
        };

        if !evicted.is_empty() {
            self.evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            for (_, slot) in evicted {
                remove_file_quiet(&slot.path).await;
            }
        }
        Ok(true)
    }

    async fn fetch(&self, key: &str) -> Result<Option<CacheEntry>> {
        let lookup = {
            let mut index = self.index.lock();
            index
                .lru
                .get(key)
                .map(|slot| (slot.path.clone(), slot.meta.clone()))
        };
        let Some((path, seen)) = lookup else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => Bytes::from(raw),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(key, path = %path.display(), "Durable record vanished");
                self.discard_stale(key, &seen).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let entry = match codec::decode(raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, path = %path.display(), error = %e, "Discarding unreadable durable record");
                self.discard_stale(key, &seen).await;
                return Err(e);
            }
        };

        if entry.key() != key {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        if entry.is_expired() {
            self.discard_stale(key, &seen).await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry))
    }
}

#[async_trait]
impl Tier for DurableTier {
    fn kind(&self) -> TierKind {
        TierKind::Durable
    }

    async fn read(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.fetch(key).await
    }

    async fn write(&self, entry: CacheEntry) -> Result<()> {
        self.store(entry, false).await.map(|_| ())
    }

    async fn write_if_newer(&self, entry: CacheEntry) -> Result<bool> {
        self.store(entry, true).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let _io = self.io_lock.lock().await;
        let slot = self.index.lock().remove(key);
        match slot {
            Some(slot) => {
                remove_file(&slot.path).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn enumerate(&self) -> Result<Vec<EntryMetadata>> {
        Ok(self
            .index
            .lock()
            .lru
            .values()
            .map(|slot| slot.meta.clone())
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        let _io = self.io_lock.lock().await;
        {
            let mut index = self.index.lock();
            index.lru.clear();
            index.files.clear();
        }

        // Also sweeps files the index never knew about
        let mut dir = tokio::fs::read_dir(&self.config.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if is_record(&path) || is_tmp(&path) {
                remove_file(&path).await?;
            }
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = now_millis();
        let expired: Vec<String> = self
            .index
            .lock()
            .lru
            .values()
            .filter(|slot| slot.meta.is_expired_at(now))
            .map(|slot| slot.meta.key.clone())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let _io = self.io_lock.lock().await;
        let mut removed = 0;
        for key in expired {
            let slot = {
                let mut index = self.index.lock();
                match index.lru.peek(&key) {
                    Some(slot) if slot.meta.is_expired_at(now) => index.remove(&key),
                    _ => None,
                }
            };
            if let Some(slot) = slot {
                remove_file(&slot.path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn capacity_used(&self) -> u64 {
        self.index.lock().lru.used()
    }

    fn capacity_limit(&self) -> u64 {
        self.config.capacity
    }

    fn len(&self) -> usize {
        self.index.lock().lru.len()
    }

    fn stats(&self) -> TierStats {
        let (entries, size_bytes) = {
            let index = self.index.lock();
            (index.lru.len(), index.lru.used())
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        TierStats {
            kind: TierKind::Durable,
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
// On-disk helpers
// =============================================================================

fn is_record(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == RECORD_EXT)
}

fn is_tmp(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.starts_with("tmp"))
}

async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

async fn remove_file_quiet(path: &Path) {
    if let Err(e) = remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove durable record");
    }
}

/// Read and validate the header of one record file
async fn read_header_file(path: &Path) -> Result<(EntryMetadata, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let file_size = file.metadata().await?.len();

    let mut preamble = [0u8; PREAMBLE_LEN];
    file.read_exact(&mut preamble)
        .await
        .map_err(|e| Error::Codec(format!("truncated preamble: {}", e)))?;
    let header_len = codec::header_len(&preamble)?;

    let mut header = vec![0u8; header_len];
    file.read_exact(&mut header)
        .await
        .map_err(|e| Error::Codec(format!("truncated header: {}", e)))?;
    let meta = codec::parse_header(&header)?;

    let expected = (PREAMBLE_LEN + header_len) as u64 + meta.size;
    if expected != file_size {
        return Err(Error::Codec(format!(
            "record is {} bytes, header describes {}",
            file_size, expected
        )));
    }
    Ok((meta, file_size))
}

async fn load_index(config: &DurableConfig) -> Result<(Index, LoadReport)> {
    let mut report = LoadReport::default();
    let now = now_millis();
    let mut found: Vec<Slot> = Vec::new();

    let mut dir = tokio::fs::read_dir(&config.dir).await?;
    while let Some(item) = dir.next_entry().await? {
        let path = item.path();
        if is_tmp(&path) {
            remove_file_quiet(&path).await;
            report.stray_tmp += 1;
            continue;
        }
        if !is_record(&path) {
            continue;
        }

        match read_header_file(&path).await {
            Ok((meta, _)) if meta.is_expired_at(now) => {
                remove_file_quiet(&path).await;
                report.expired += 1;
            }
            Ok((meta, disk_size)) => found.push(Slot {
                meta,
                path,
                disk_size,
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Removing unreadable durable record");
                remove_file_quiet(&path).await;
                report.corrupt += 1;
            }
        }
    }

    // Oldest writes become least recently used
    found.sort_by_key(|slot| slot.meta.timestamp);

    let mut index = Index::default();
    for slot in found {
        index.files.insert(slot.path.clone(), slot.meta.key.clone());
        index.lru.insert(slot.meta.key.clone(), slot);
    }
    for (_, slot) in index.lru.make_room(0, config.capacity) {
        index.files.remove(&slot.path);
        remove_file_quiet(&slot.path).await;
        report.evicted += 1;
    }
    report.loaded = index.lru.len();

    Ok((index, report))
}

/// List the headers of every record in `dir` without modifying anything
pub async fn read_record_headers(dir: impl AsRef<Path>) -> Result<Vec<RecordHeader>> {
    let mut headers = Vec::new();
    let mut entries = tokio::fs::read_dir(dir.as_ref()).await?;
    while let Some(item) = entries.next_entry().await? {
        let path = item.path();
        if !is_record(&path) {
            continue;
        }
        let header = match read_header_file(&path).await {
            Ok((meta, file_size)) => RecordHeader {
                path,
                file_size,
                meta: Some(meta),
                error: None,
            },
            Err(e) => RecordHeader {
                file_size: item.metadata().await.map(|m| m.len()).unwrap_or(0),
                path,
                meta: None,
                error: Some(e.to_string()),
            },
        };
        headers.push(header);
    }
    headers.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(headers)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir, capacity: u64) -> DurableConfig {
        DurableConfig {
            enabled: true,
            dir: dir.path().to_path_buf(),
            capacity,
        }
    }

    fn entry(key: &str, payload: &[u8]) -> CacheEntry {
        CacheEntry::new(key, Bytes::copy_from_slice(payload), Duration::from_secs(60))
    }

    fn record_files(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| is_record(&e.as_ref().unwrap().path()))
            .count()
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = TempDir::new().unwrap();
        let tier = DurableTier::open(config(&dir, 1 << 20)).await.unwrap();

        tier.write(entry("a", b"alpha")).await.unwrap();
        let hit = tier.read("a").await.unwrap().unwrap();
        assert_eq!(hit.payload().as_ref(), b"alpha");
        assert_eq!(record_files(&dir), 1);

        assert!(tier.remove("a").await.unwrap());
        assert!(tier.read("a").await.unwrap().is_none());
        assert_eq!(record_files(&dir), 0);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let tier = DurableTier::open(config(&dir, 1 << 20)).await.unwrap();
            tier.write(entry("a", b"alpha").with_version(4)).await.unwrap();
            tier.write(entry("b", b"beta")).await.unwrap();
        }

        let tier = DurableTier::open(config(&dir, 1 << 20)).await.unwrap();
        assert_eq!(tier.load_report().loaded, 2);
        let hit = tier.read("a").await.unwrap().unwrap();
        assert_eq!(hit.payload().as_ref(), b"alpha");
        assert_eq!(hit.version(), 4);
    }

    #[tokio::test]
    async fn test_open_prunes_corrupt_expired_and_tmp() {
        let dir = TempDir::new().unwrap();
        {
            let tier = DurableTier::open(config(&dir, 1 << 20)).await.unwrap();
            tier.write(entry("live", b"x")).await.unwrap();
            tier.write(CacheEntry::new(
                "short",
                Bytes::from_static(b"y"),
                Duration::from_millis(1),
            ))
            .await
            .unwrap();
        }
        std::fs::write(dir.path().join("deadbeef.rec"), b"not a record").unwrap();
        std::fs::write(dir.path().join("0000.tmp3"), b"partial").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let tier = DurableTier::open(config(&dir, 1 << 20)).await.unwrap();
        assert_eq!(
            tier.load_report(),
            &LoadReport {
                loaded: 1,
                expired: 1,
                corrupt: 1,
                evicted: 0,
                stray_tmp: 1,
            }
        );
        assert_eq!(record_files(&dir), 1);
        assert!(tier.read("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lru_eviction_by_disk_size() {
        let dir = TempDir::new().unwrap();
        let record_size = codec::encode(&entry("k0", &[0u8; 100])).unwrap().len() as u64;
        let tier = DurableTier::open(config(&dir, record_size * 3)).await.unwrap();

        for i in 0..3 {
            tier.write(entry(&format!("k{}", i), &[0u8; 100])).await.unwrap();
        }
        assert!(tier.read("k0").await.unwrap().is_some());
        tier.write(entry("k3", &[0u8; 100])).await.unwrap();

        assert!(tier.read("k1").await.unwrap().is_none());
        assert!(tier.read("k0").await.unwrap().is_some());
        assert!(tier.capacity_used() <= tier.capacity_limit());
        assert_eq!(record_files(&dir), 3);
        assert_eq!(tier.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_oversized_overwrite_drops_previous_record() {
        let dir = TempDir::new().unwrap();
        let tier = DurableTier::open(config(&dir, 512)).await.unwrap();
        tier.write(entry("a", b"small")).await.unwrap();
        tier.write(entry("b", b"kept")).await.unwrap();
        assert_eq!(record_files(&dir), 2);

        tier.write(entry("a", &[7u8; 1024])).await.unwrap();

        assert!(tier.read("a").await.unwrap().is_none());
        assert!(tier.read("b").await.unwrap().is_some());
        assert_eq!(tier.len(), 1);
        assert_eq!(record_files(&dir), 1);
    }

    #[tokio::test]
    async fn test_write_if_newer_respects_stored_version() {
        let dir = TempDir::new().unwrap();
        let tier = DurableTier::open(config(&dir, 1 << 20)).await.unwrap();
        tier.write(entry("a", b"v2").with_version(2)).await.unwrap();

        assert!(!tier.write_if_newer(entry("a", b"v1").with_version(1)).await.unwrap());
        let hit = tier.read("a").await.unwrap().unwrap();
        assert_eq!(hit.payload().as_ref(), b"v2");

        assert!(tier.write_if_newer(entry("a", b"v3").with_version(3)).await.unwrap());
        let hit = tier.read("a").await.unwrap().unwrap();
        assert_eq!(hit.payload().as_ref(), b"v3");
        assert!(tier.write_if_newer(entry("b", b"new")).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_error_then_gone() {
        let dir = TempDir::new().unwrap();
        let tier = DurableTier::open(config(&dir, 1 << 20)).await.unwrap();
        tier.write(entry("a", b"alpha")).await.unwrap();

        std::fs::write(tier.path_for("a"), b"garbage").unwrap();
        assert_matches!(tier.read("a").await, Err(Error::Codec(_)));
        assert!(tier.read("a").await.unwrap().is_none());
        assert_eq!(tier.len(), 0);
    }

    #[tokio::test]
    async fn test_foreign_key_in_slot_is_miss() {
        let dir = TempDir::new().unwrap();
        let tier = DurableTier::open(config(&dir, 1 << 20)).await.unwrap();
        tier.write(entry("a", b"alpha")).await.unwrap();

        let foreign = codec::encode(&entry("b", b"beta")).unwrap();
        std::fs::write(tier.path_for("a"), &foreign).unwrap();
        assert!(tier.read("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_and_clear() {
        let dir = TempDir::new().unwrap();
        let tier = DurableTier::open(config(&dir, 1 << 20)).await.unwrap();
        tier.write(CacheEntry::new(
            "short",
            Bytes::from_static(b"v"),
            Duration::from_millis(1),
        ))
        .await
        .unwrap();
        tier.write(entry("long", b"v")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(tier.purge_expired().await.unwrap(), 1);
        assert_eq!(tier.len(), 1);

        std::fs::write(dir.path().join("orphan.rec"), b"x").unwrap();
        tier.clear().await.unwrap();
        tier.clear().await.unwrap();
        assert_eq!(record_files(&dir), 0);
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_read_record_headers_is_read_only() {
        let dir = TempDir::new().unwrap();
        let tier = DurableTier::open(config(&dir, 1 << 20)).await.unwrap();
        tier.write(entry("a", b"alpha").with_strategy("cache-first"))
            .await
            .unwrap();
        std::fs::write(dir.path().join("bad.rec"), b"nope").unwrap();

        let headers = read_record_headers(dir.path()).await.unwrap();
        assert_eq!(headers.len(), 2);
        let good: Vec<_> = headers.iter().filter_map(|h| h.meta.as_ref()).collect();
        assert_eq!(good.len(), 1);
        assert_eq!(good[0].key, "a");
        assert_eq!(good[0].strategy.as_deref(), Some("cache-first"));
        assert!(headers.iter().any(|h| h.error.is_some()));

        // The bad file is still there
        assert_eq!(record_files(&dir), 2);
    }
}

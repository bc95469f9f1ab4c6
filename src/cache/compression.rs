//! Compression Unit
//!
//! Payload compression for the Durable and Edge tiers. All codec work runs on
//! one dedicated thread behind [`CompressionWorker`]; async callers await a
//! reply instead of burning runtime time on LZ4.
//!
//! ```
//! use bytes::Bytes;
//! use tiercache::cache::{CompressionAlgorithm, CompressionConfig, CompressionWorker};
//!
//! # tokio_test::block_on(async {
//! let worker = CompressionWorker::spawn(CompressionConfig::default()).unwrap();
//! let body = Bytes::from("cadence:168;".repeat(200));
//!
//! let (packed, algorithm) = worker.compress(body.clone()).await.unwrap();
//! assert_eq!(algorithm, CompressionAlgorithm::Lz4);
//! assert_eq!(worker.decompress(packed, algorithm).await.unwrap(), body);
//! # });
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::DEFAULT_COMPRESSION_THRESHOLD;
use crate::error::{Error, Result};

/// Largest size a compressed frame may claim to expand to (256MB)
pub const MAX_DECOMPRESSED_SIZE: usize = 256 * 1024 * 1024;

/// Codec recorded in an entry's metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Stored as-is
    #[default]
    None,
    /// LZ4 block with a little-endian i32 size prefix
    Lz4,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Encode `data`; `level` is ignored by `None`
    pub fn compress(&self, data: &[u8], level: i32) -> Result<Bytes> {
        match self {
            CompressionAlgorithm::None => Ok(Bytes::copy_from_slice(data)),
            CompressionAlgorithm::Lz4 => {
                let mode = lz4::block::CompressionMode::HIGHCOMPRESSION(level);
                lz4::block::compress(data, Some(mode), true)
                    .map(Bytes::from)
                    .map_err(|e| Error::CompressionFailed {
                        algorithm: self.name().into(),
                        reason: e.to_string(),
                    })
            }
        }
    }

    /// Decode a payload produced by [`compress`](Self::compress)
    pub fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        match self {
            CompressionAlgorithm::None => Ok(Bytes::copy_from_slice(data)),
            CompressionAlgorithm::Lz4 => {
                let fail = |reason: String| Error::DecompressionFailed {
                    algorithm: self.name().into(),
                    reason,
                };
                // Check the claimed size before lz4 allocates it
                let claimed = data
                    .get(..4)
                    .and_then(|prefix| <[u8; 4]>::try_from(prefix).ok())
                    .map(i32::from_le_bytes)
                    .ok_or_else(|| fail("frame shorter than size prefix".into()))?;
                if claimed < 0 || claimed as usize > MAX_DECOMPRESSED_SIZE {
                    return Err(fail(format!("implausible frame size {}", claimed)));
                }
                lz4::block::decompress(data, None)
                    .map(Bytes::from)
                    .map_err(|e| fail(e.to_string()))
            }
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Compression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Codec for payloads above the threshold
    pub algorithm: CompressionAlgorithm,
    /// Payloads at or below this size are stored uncompressed
    pub min_size_bytes: u64,
    /// LZ4 high-compression level
    pub level: i32,
    /// Pending requests before callers wait for queue space
    pub queue_depth: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Lz4,
            min_size_bytes: DEFAULT_COMPRESSION_THRESHOLD,
            level: 3,
            queue_depth: 256,
        }
    }
}

impl CompressionConfig {
    #[inline]
    pub fn should_compress(&self, len: usize) -> bool {
        len as u64 > self.min_size_bytes
    }

    /// Compress `data` if it is large enough and the result is smaller;
    /// otherwise hand it back tagged `None`
    pub fn pack(&self, data: Bytes) -> Result<(Bytes, CompressionAlgorithm)> {
        if self.algorithm == CompressionAlgorithm::None || !self.should_compress(data.len()) {
            return Ok((data, CompressionAlgorithm::None));
        }
        let packed = self.algorithm.compress(&data, self.level)?;
        if packed.len() < data.len() {
            Ok((packed, self.algorithm))
        } else {
            Ok((data, CompressionAlgorithm::None))
        }
    }
}

// =============================================================================
// Compression Worker
// =============================================================================

enum Job {
    Compress {
        data: Bytes,
        reply: oneshot::Sender<Result<(Bytes, CompressionAlgorithm)>>,
    },
    Decompress {
        data: Bytes,
        algorithm: CompressionAlgorithm,
        reply: oneshot::Sender<Result<Bytes>>,
    },
}

impl Job {
    fn run(self, config: &CompressionConfig) {
        // A dropped reply just means the caller stopped waiting
        match self {
            Job::Compress { data, reply } => {
                let _ = reply.send(config.pack(data));
            }
            Job::Decompress {
                data,
                algorithm,
                reply,
            } => {
                let _ = reply.send(algorithm.decompress(&data));
            }
        }
    }
}

/// Handle to the background compression thread.
///
/// Requests travel over a bounded queue and answers come back on a oneshot
/// channel. The thread exits once every handle is dropped.
#[derive(Clone)]
pub struct CompressionWorker {
    tx: mpsc::Sender<Job>,
    min_size_bytes: u64,
}

impl CompressionWorker {
    /// Start the worker thread
    pub fn spawn(config: CompressionConfig) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Job>(config.queue_depth.max(1));
        let min_size_bytes = config.min_size_bytes;

        std::thread::Builder::new()
            .name("tiercache-compress".into())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    // A panicking codec drops the reply; only that caller
                    // sees WorkerUnavailable
                    if catch_unwind(AssertUnwindSafe(|| job.run(&config))).is_err() {
                        warn!("Compression job panicked");
                    }
                }
                debug!("Compression worker exiting");
            })?;

        Ok(Self { tx, min_size_bytes })
    }

    /// True when a payload of `len` bytes is worth sending to the worker
    #[inline]
    pub fn should_compress(&self, len: usize) -> bool {
        len as u64 > self.min_size_bytes
    }

    /// Compress off-thread; small or incompressible input comes back
    /// unchanged with `None`
    pub async fn compress(&self, data: Bytes) -> Result<(Bytes, CompressionAlgorithm)> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job::Compress { data, reply })
            .await
            .map_err(|_| Error::WorkerUnavailable)?;
        rx.await.map_err(|_| Error::WorkerUnavailable)?
    }

    /// Decompress off-thread
    pub async fn decompress(&self, data: Bytes, algorithm: CompressionAlgorithm) -> Result<Bytes> {
        if algorithm == CompressionAlgorithm::None {
            return Ok(data);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job::Decompress {
                data,
                algorithm,
                reply,
            })
            .await
            .map_err(|_| Error::WorkerUnavailable)?;
        rx.await.map_err(|_| Error::WorkerUnavailable)?
    }
}

impl std::fmt::Debug for CompressionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionWorker")
            .field("min_size_bytes", &self.min_size_bytes)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

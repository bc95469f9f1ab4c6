//! Cache Record Codec
//!
//! Binary layout shared by the Durable and Edge tiers:
//!
//! ```text
//! offset  size  field
//! 0       4     magic  b"TCR\0"
//! 4       2     schema version (u16 LE)
//! 6       4     header length N (u32 LE)
//! 10      N     JSON header (EntryMetadata)
//! 10+N    size  payload
//! ```
//!
//! The schema version is bumped whenever the header layout changes; records
//! with an unknown version are rejected rather than misread.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::entry::{CacheEntry, EntryMetadata};
use crate::error::{Error, Result};

/// Record magic
pub const RECORD_MAGIC: [u8; 4] = *b"TCR\0";

/// Current record schema version
pub const SCHEMA_VERSION: u16 = 1;

/// Magic + schema + header length
pub(crate) const PREAMBLE_LEN: usize = 10;

/// Encode an entry into a self-describing record
pub fn encode(entry: &CacheEntry) -> Result<Bytes> {
    let header = serde_json::to_vec(&entry.meta)?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| Error::Codec(format!("header too large: {} bytes", header.len())))?;

    let mut buf = BytesMut::with_capacity(PREAMBLE_LEN + header.len() + entry.payload().len());
    buf.put_slice(&RECORD_MAGIC);
    buf.put_u16_le(SCHEMA_VERSION);
    buf.put_u32_le(header_len);
    buf.put_slice(&header);
    buf.put_slice(entry.payload());
    Ok(buf.freeze())
}

/// Validate the preamble and return the header length
pub(crate) fn header_len(preamble: &[u8]) -> Result<usize> {
    if preamble.len() < PREAMBLE_LEN {
        return Err(Error::Codec(format!(
            "truncated preamble: {} bytes",
            preamble.len()
        )));
    }
    if preamble[..4] != RECORD_MAGIC {
        return Err(Error::Codec("bad magic".into()));
    }

    let mut cursor = &preamble[4..PREAMBLE_LEN];
    let schema = cursor.get_u16_le();
    if schema != SCHEMA_VERSION {
        return Err(Error::Codec(format!(
            "unsupported schema version {} (expected {})",
            schema, SCHEMA_VERSION
        )));
    }
    Ok(cursor.get_u32_le() as usize)
}

/// Decode only the header of a record
pub fn decode_header(record: &[u8]) -> Result<EntryMetadata> {
    let (meta, _) = split(record)?;
    Ok(meta)
}

/// Decode a full record
pub fn decode(record: Bytes) -> Result<CacheEntry> {
    let (meta, offset) = split(&record)?;
    let payload = record.slice(offset..);
    if payload.len() as u64 != meta.size {
        return Err(Error::Codec(format!(
            "payload length {} does not match header size {}",
            payload.len(),
            meta.size
        )));
    }
    Ok(CacheEntry::from_parts(meta, payload))
}

pub(crate) fn parse_header(header: &[u8]) -> Result<EntryMetadata> {
    serde_json::from_slice(header).map_err(|e| Error::Codec(format!("bad header: {}", e)))
}

fn split(record: &[u8]) -> Result<(EntryMetadata, usize)> {
    let len = header_len(record)?;
    let end = PREAMBLE_LEN
        .checked_add(len)
        .filter(|end| *end <= record.len())
        .ok_or_else(|| Error::Codec(format!("truncated header: expected {} bytes", len)))?;
    Ok((parse_header(&record[PREAMBLE_LEN..end])?, end))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::compression::CompressionAlgorithm;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::time::Duration;

    fn sample() -> CacheEntry {
        CacheEntry::new(
            "dashboard:weekly",
            Bytes::from_static(b"{\"steps\":42000}"),
            Duration::from_secs(30),
        )
        .with_version(3)
        .with_strategy("network-first")
    }

    #[test]
    fn test_encode_layout() {
        let record = encode(&sample()).unwrap();
        assert_eq!(&record[..4], b"TCR\0");
        assert_eq!(u16::from_le_bytes([record[4], record[5]]), SCHEMA_VERSION);
        assert!(record.ends_with(b"{\"steps\":42000}"));
    }

    #[test]
    fn test_header_uses_persisted_field_names() {
        let record = encode(&sample()).unwrap();
        let len = header_len(&record).unwrap();
        let header: serde_json::Value =
            serde_json::from_slice(&record[PREAMBLE_LEN..PREAMBLE_LEN + len]).unwrap();

        for field in ["key", "timestamp", "ttl", "strategy", "version", "size"] {
            assert!(header.get(field).is_some(), "missing header field {}", field);
        }
        assert_eq!(header["algorithm"], "none");
    }

    #[test]
    fn test_decode_header_only() {
        let entry = sample();
        let record = encode(&entry).unwrap();
        let meta = decode_header(&record).unwrap();
        assert_eq!(meta, entry.meta);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut record = encode(&sample()).unwrap().to_vec();
        record[0] = b'X';
        assert_matches!(decode(Bytes::from(record)), Err(Error::Codec(_)));
    }

    #[test]
    fn test_rejects_unknown_schema() {
        let mut record = encode(&sample()).unwrap().to_vec();
        record[4..6].copy_from_slice(&99u16.to_le_bytes());
        let err = decode(Bytes::from(record)).unwrap_err();
        assert!(err.to_string().contains("unsupported schema version 99"));
    }

    #[test]
    fn test_rejects_truncation() {
        let record = encode(&sample()).unwrap();
        assert_matches!(decode(record.slice(..6)), Err(Error::Codec(_)));
        assert_matches!(decode(record.slice(..20)), Err(Error::Codec(_)));
        assert_matches!(
            decode(record.slice(..record.len() - 1)),
            Err(Error::Codec(_))
        );
    }

    #[test]
    fn test_compressed_flags_survive() {
        let entry = sample().to_compressed(Bytes::from_static(b"zz"), CompressionAlgorithm::Lz4);
        let decoded = decode(encode(&entry).unwrap()).unwrap();
        assert!(decoded.meta.compressed);
        assert_eq!(decoded.meta.algorithm, CompressionAlgorithm::Lz4);
        assert_eq!(decoded.payload().as_ref(), b"zz");
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            key in "[a-z0-9:/_-]{1,64}",
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
            version in 1u64..u64::MAX,
            ttl_ms in 0u64..10_000_000,
        ) {
            let entry = CacheEntry::new(key, Bytes::from(payload), Duration::from_millis(ttl_ms))
                .with_version(version);
            let decoded = decode(encode(&entry).unwrap()).unwrap();
            prop_assert_eq!(decoded, entry);
        }
    }
}

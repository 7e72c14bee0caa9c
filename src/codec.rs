//! Tier chunk codec: packs a run of per-bucket aggregate records into one
//! block-compressed blob, and merges freshly computed buckets into an
//! existing blob with later-wins semantics at bucket granularity.
//!
//! The codec carries no aggregation semantics. Rollup is responsible for
//! handing it fully computed bucket values; a merge simply replaces any
//! bucket whose start collides.

use crate::encoding::{compress_block, decompress_block, BlockCompression};
use crate::error::StoreError;
use crate::types::{AggSet, Bucket, Timestamp};

use std::collections::BTreeMap;

/// Magic bytes for a tier chunk blob.
pub const CHUNK_MAGIC: &[u8; 2] = b"TC";
pub const CHUNK_VERSION: u8 = 1;

/// Container header: magic(2) + version(1) + codec(1) + uncompressed_len(4).
const CONTAINER_HDR_LEN: usize = 8;
/// Payload header: resolution(4) + aggregate mask(1) + bucket_count(2).
const PAYLOAD_HDR_LEN: usize = 7;

/// A decoded tier chunk: the resolution and aggregate mask it was written
/// with, plus its buckets in ascending start order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkData {
    pub resolution: u32,
    pub mask: AggSet,
    pub buckets: Vec<Bucket>,
}

/// Encode buckets into a compressed chunk blob. Buckets must be in ascending
/// `start` order with distinct starts, each carrying exactly one value slot
/// per aggregate in `mask`.
pub fn encode_chunk(
    resolution: u32,
    mask: AggSet,
    buckets: &[Bucket],
    compression: BlockCompression,
) -> Result<Vec<u8>, StoreError> {
    if mask.is_empty() {
        return Err(StoreError::Internal(
            "Refusing to encode a chunk with an empty aggregate mask".to_string(),
        ));
    }
    if buckets.is_empty() {
        return Err(StoreError::Internal(
            "Refusing to encode an empty chunk".to_string(),
        ));
    }
    if buckets.len() > u16::MAX as usize {
        return Err(StoreError::Internal("Too many buckets for one chunk".to_string()));
    }
    let slots = mask.len();

    let mut payload = Vec::with_capacity(PAYLOAD_HDR_LEN + buckets.len() * (8 + 8 * slots));
    payload.extend_from_slice(&resolution.to_le_bytes());
    payload.push(mask.0);
    payload.extend_from_slice(&(buckets.len() as u16).to_le_bytes());

    let mut prev_start: Option<Timestamp> = None;
    for bucket in buckets {
        if bucket.values.len() != slots {
            return Err(StoreError::Internal(format!(
                "Bucket at {} has {} value slots, mask wants {}",
                bucket.start,
                bucket.values.len(),
                slots
            )));
        }
        if let Some(prev) = prev_start {
            if bucket.start <= prev {
                return Err(StoreError::Internal(
                    "Chunk buckets must be strictly ascending by start".to_string(),
                ));
            }
        }
        prev_start = Some(bucket.start);
        payload.extend_from_slice(&bucket.start.to_le_bytes());
        for v in &bucket.values {
            payload.extend_from_slice(&v.to_bits().to_le_bytes());
        }
    }

    let uncompressed_len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| StoreError::Internal("Chunk payload too large".to_string()))?;
    let (codec, stored) = compress_block(compression, &payload)?;

    let mut out = Vec::with_capacity(CONTAINER_HDR_LEN + stored.len());
    out.extend_from_slice(CHUNK_MAGIC);
    out.push(CHUNK_VERSION);
    out.push(codec);
    out.extend_from_slice(&uncompressed_len.to_le_bytes());
    out.extend_from_slice(&stored);
    Ok(out)
}

/// Decode a chunk blob back into bucket records.
pub fn decode_chunk(blob: &[u8]) -> Result<ChunkData, StoreError> {
    if blob.len() < CONTAINER_HDR_LEN {
        return Err(StoreError::CorruptChunk("Truncated chunk container".to_string()));
    }
    if &blob[..2] != CHUNK_MAGIC {
        return Err(StoreError::CorruptChunk("Bad chunk magic".to_string()));
    }
    if blob[2] != CHUNK_VERSION {
        return Err(StoreError::CorruptChunk(format!(
            "Unsupported chunk version {}",
            blob[2]
        )));
    }
    let codec = blob[3];
    let uncompressed_len = u32::from_le_bytes(blob[4..8].try_into().unwrap()) as usize;

    let payload = decompress_block(codec, &blob[CONTAINER_HDR_LEN..], uncompressed_len)
        .map_err(|e| StoreError::CorruptChunk(e.to_string()))?;
    if payload.len() != uncompressed_len || payload.len() < PAYLOAD_HDR_LEN {
        return Err(StoreError::CorruptChunk(
            "Chunk decompressed length mismatch".to_string(),
        ));
    }

    let resolution = u32::from_le_bytes(payload[..4].try_into().unwrap());
    let mask = AggSet(payload[4]);
    let bucket_count = u16::from_le_bytes(payload[5..7].try_into().unwrap()) as usize;
    let slots = mask.len();
    if mask.is_empty() {
        return Err(StoreError::CorruptChunk("Empty aggregate mask".to_string()));
    }

    let record_len = 8 + 8 * slots;
    let expected = PAYLOAD_HDR_LEN + bucket_count * record_len;
    if payload.len() != expected {
        return Err(StoreError::CorruptChunk(format!(
            "Chunk body length {} does not match bucket_count {}",
            payload.len(),
            bucket_count
        )));
    }

    let mut buckets = Vec::with_capacity(bucket_count);
    let mut off = PAYLOAD_HDR_LEN;
    let mut prev_start: Option<Timestamp> = None;
    for _ in 0..bucket_count {
        let start = i64::from_le_bytes(payload[off..off + 8].try_into().unwrap());
        off += 8;
        if let Some(prev) = prev_start {
            if start <= prev {
                return Err(StoreError::CorruptChunk(
                    "Chunk buckets out of order".to_string(),
                ));
            }
        }
        prev_start = Some(start);
        let mut values = Vec::with_capacity(slots);
        for _ in 0..slots {
            let bits = u64::from_le_bytes(payload[off..off + 8].try_into().unwrap());
            values.push(f64::from_bits(bits));
            off += 8;
        }
        buckets.push(Bucket { start, values });
    }

    Ok(ChunkData { resolution, mask, buckets })
}

/// Merge freshly computed buckets into an existing encoded chunk.
///
/// New buckets overwrite existing ones with the same start; the result is
/// re-encoded in ascending order. The existing blob's resolution and mask
/// must match what the caller is writing.
pub fn merge_chunk(
    existing: &[u8],
    new_buckets: &[Bucket],
    resolution: u32,
    mask: AggSet,
    compression: BlockCompression,
) -> Result<Vec<u8>, StoreError> {
    let decoded = decode_chunk(existing)?;
    if decoded.resolution != resolution || decoded.mask != mask {
        return Err(StoreError::CorruptChunk(format!(
            "Chunk layout mismatch: stored (res={}, mask={:#x}), writing (res={}, mask={:#x})",
            decoded.resolution, decoded.mask.0, resolution, mask.0
        )));
    }

    let mut by_start: BTreeMap<Timestamp, Bucket> = decoded
        .buckets
        .into_iter()
        .map(|b| (b.start, b))
        .collect();
    for bucket in new_buckets {
        by_start.insert(bucket.start, bucket.clone());
    }
    let merged: Vec<Bucket> = by_start.into_values().collect();
    encode_chunk(resolution, mask, &merged, compression)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{count_to_slot, Aggregate};

    fn bucket(start: i64, seed: f64, slots: usize) -> Bucket {
        Bucket {
            start,
            values: (0..slots).map(|i| seed + i as f64).collect(),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let mask = AggSet::ALL;
        let buckets: Vec<Bucket> = (0..24)
            .map(|i| bucket(1_700_000_000 + i * 3600, i as f64 * 1.5, mask.len()))
            .collect();
        let blob = encode_chunk(3600, mask, &buckets, BlockCompression::Zstd { level: 0 }).unwrap();
        let decoded = decode_chunk(&blob).unwrap();
        assert_eq!(decoded.resolution, 3600);
        assert_eq!(decoded.mask, mask);
        assert_eq!(decoded.buckets, buckets);
    }

    #[test]
    fn partial_mask_round_trip() {
        let mask = AggSet::of(&[Aggregate::Min, Aggregate::Max]);
        let buckets = vec![bucket(0, 1.0, 2), bucket(3600, 2.0, 2)];
        let blob = encode_chunk(3600, mask, &buckets, BlockCompression::None).unwrap();
        let decoded = decode_chunk(&blob).unwrap();
        assert_eq!(decoded.mask, mask);
        assert_eq!(decoded.buckets, buckets);
    }

    #[test]
    fn count_slot_survives_round_trip() {
        let mask = AggSet::of(&[Aggregate::Count]);
        let buckets = vec![Bucket { start: 0, values: vec![count_to_slot(123_456)] }];
        let blob = encode_chunk(60, mask, &buckets, BlockCompression::None).unwrap();
        let decoded = decode_chunk(&blob).unwrap();
        assert_eq!(crate::types::slot_to_count(decoded.buckets[0].values[0]), 123_456);
    }

    #[test]
    fn merge_overwrites_colliding_buckets_and_sorts() {
        let mask = AggSet::of(&[Aggregate::Sum]);
        let existing = encode_chunk(
            3600,
            mask,
            &[bucket(3600, 10.0, 1), bucket(7200, 20.0, 1)],
            BlockCompression::None,
        )
        .unwrap();

        let merged_blob = merge_chunk(
            &existing,
            &[bucket(0, 5.0, 1), bucket(7200, 99.0, 1)],
            3600,
            mask,
            BlockCompression::None,
        )
        .unwrap();
        let merged = decode_chunk(&merged_blob).unwrap();
        assert_eq!(
            merged.buckets,
            vec![bucket(0, 5.0, 1), bucket(3600, 10.0, 1), bucket(7200, 99.0, 1)]
        );
    }

    #[test]
    fn merge_rejects_layout_mismatch() {
        let blob = encode_chunk(
            3600,
            AggSet::of(&[Aggregate::Sum]),
            &[bucket(0, 1.0, 1)],
            BlockCompression::None,
        )
        .unwrap();
        let err = merge_chunk(
            &blob,
            &[bucket(3600, 1.0, 1)],
            60,
            AggSet::of(&[Aggregate::Sum]),
            BlockCompression::None,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::CorruptChunk(_)));
    }

    #[test]
    fn bad_magic_version_and_length_are_corruption() {
        let mask = AggSet::of(&[Aggregate::Avg]);
        let blob = encode_chunk(60, mask, &[bucket(0, 1.0, 1)], BlockCompression::None).unwrap();

        let mut bad_magic = blob.clone();
        bad_magic[0] = b'X';
        assert!(matches!(decode_chunk(&bad_magic), Err(StoreError::CorruptChunk(_))));

        let mut bad_version = blob.clone();
        bad_version[2] = 9;
        assert!(matches!(decode_chunk(&bad_version), Err(StoreError::CorruptChunk(_))));

        // Claim one more bucket than the body holds.
        let mut bad_count = blob.clone();
        // Uncompressed payload: header starts right after the container header.
        bad_count[CONTAINER_HDR_LEN + 5] = 2;
        assert!(matches!(decode_chunk(&bad_count), Err(StoreError::CorruptChunk(_))));
    }

    #[test]
    fn unordered_buckets_are_refused_on_encode() {
        let mask = AggSet::of(&[Aggregate::Avg]);
        let err = encode_chunk(
            60,
            mask,
            &[bucket(60, 1.0, 1), bucket(0, 2.0, 1)],
            BlockCompression::None,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Internal(_)));
    }

    #[test]
    fn wrong_slot_count_is_refused() {
        let mask = AggSet::ALL;
        let err = encode_chunk(60, mask, &[bucket(0, 1.0, 2)], BlockCompression::None).unwrap_err();
        assert!(matches!(err, StoreError::Internal(_)));
    }
}

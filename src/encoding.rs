//! Point-stream encoding: Gorilla delta-of-delta timestamps + XOR float
//! bitpacking, wrapped in a checksummed, block-compressed container. Used for
//! segment payloads and WAL checkpoint data.

use crate::error::StoreError;
use crate::types::{Timestamp, Value};

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};

/// Magic bytes for a compressed point stream container.
pub const POINTS_MAGIC: &[u8; 8] = b"STRPTS01";

const COMPRESS_NONE: u8 = 0;
const COMPRESS_LZ4: u8 = 1;
const COMPRESS_ZSTD: u8 = 2;

/// Block compressor applied after the bit-level encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BlockCompression {
    None,
    Lz4,
    /// Zstd with an explicit level; `level: 0` selects the library default.
    Zstd { level: i32 },
}

impl Default for BlockCompression {
    fn default() -> Self {
        BlockCompression::Zstd { level: 0 }
    }
}

/// Encode `(ts, value)` pairs into a self-describing compressed blob.
///
/// The stream is delta-of-delta over timestamps and XOR over float bit
/// patterns, so runs of regularly spaced, slowly changing samples cost a few
/// bits per point before block compression even starts.
pub fn compress_points(
    points: &[(Timestamp, Value)],
    compression: BlockCompression,
) -> Result<Vec<u8>, StoreError> {
    if points.is_empty() {
        return Err(StoreError::Internal(
            "Refusing to encode an empty point stream".to_string(),
        ));
    }

    let mut payload: Vec<u8> = Vec::with_capacity(16 + points.len() * 2);
    payload.extend_from_slice(&points[0].0.to_le_bytes());
    payload.extend_from_slice(&points[0].1.to_bits().to_le_bytes());

    let mut sink = BitSink::new(&mut payload);
    let mut prev_ts = points[0].0;
    let mut prev_delta: i64 = 0;
    let mut prev_bits = points[0].1.to_bits();
    let mut prev_leading: u32 = 0;
    let mut prev_trailing: u32 = 0;
    let mut prev_sigbits: u32 = 0;

    for &(ts, value) in &points[1..] {
        // Timestamp: delta-of-delta bit classes. Marker bits go out one at a
        // time, in the order the decoder tests them.
        let delta = ts.wrapping_sub(prev_ts);
        let dod = delta.wrapping_sub(prev_delta);
        match dod {
            0 => sink.put(0, 1),
            -63..=64 => {
                sink.put(1, 1);
                sink.put(0, 1);
                sink.put((dod + 63) as u64, 7);
            }
            -255..=256 => {
                sink.put(1, 1);
                sink.put(1, 1);
                sink.put(0, 1);
                sink.put((dod + 255) as u64, 9);
            }
            -2047..=2048 => {
                sink.put(1, 1);
                sink.put(1, 1);
                sink.put(1, 1);
                sink.put(0, 1);
                sink.put((dod + 2047) as u64, 12);
            }
            _ => {
                sink.put(1, 1);
                sink.put(1, 1);
                sink.put(1, 1);
                sink.put(1, 1);
                sink.put(dod as u64, 64);
            }
        }
        prev_delta = delta;
        prev_ts = ts;

        // Value: XOR with leading/trailing window reuse.
        let bits = value.to_bits();
        let x = prev_bits ^ bits;
        if x == 0 {
            sink.put(0, 1);
        } else {
            sink.put(1, 1);
            let leading = x.leading_zeros();
            let trailing = x.trailing_zeros();
            let sigbits = 64 - leading - trailing;

            if prev_sigbits != 0 && leading >= prev_leading && trailing >= prev_trailing {
                sink.put(0, 1);
                sink.put(x >> prev_trailing, prev_sigbits);
            } else {
                sink.put(1, 1);
                sink.put(leading as u64, 6);
                sink.put((sigbits - 1) as u64, 6);
                sink.put(x >> trailing, sigbits);
                prev_leading = leading;
                prev_trailing = trailing;
                prev_sigbits = sigbits;
            }
        }
        prev_bits = bits;
    }
    sink.finish();

    let uncompressed_len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| StoreError::Internal("Point stream payload too large".to_string()))?;
    let crc = crc32(&payload);
    let (codec, stored) = compress_block(compression, &payload)?;

    let mut out = Vec::with_capacity(17 + stored.len());
    out.extend_from_slice(POINTS_MAGIC);
    out.push(codec);
    out.extend_from_slice(&uncompressed_len.to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&stored);
    Ok(out)
}

/// Decode a blob produced by [`compress_points`]. The point count comes from
/// the surrounding metadata (segment index entry or WAL record header).
pub fn decompress_points(
    blob: &[u8],
    count: usize,
) -> Result<Vec<(Timestamp, Value)>, StoreError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if blob.len() < 17 {
        return Err(StoreError::CorruptSegment(
            "Truncated point stream container".to_string(),
        ));
    }
    if &blob[..8] != POINTS_MAGIC {
        return Err(StoreError::CorruptSegment(
            "Bad point stream magic".to_string(),
        ));
    }
    let codec = blob[8];
    let uncompressed_len = u32::from_le_bytes(blob[9..13].try_into().unwrap()) as usize;
    let expected_crc = u32::from_le_bytes(blob[13..17].try_into().unwrap());

    let payload = decompress_block(codec, &blob[17..], uncompressed_len)?;
    if payload.len() != uncompressed_len {
        return Err(StoreError::CorruptSegment(
            "Point stream decompressed length mismatch".to_string(),
        ));
    }
    if crc32(&payload) != expected_crc {
        return Err(StoreError::CorruptSegment(
            "Point stream payload CRC mismatch".to_string(),
        ));
    }
    if payload.len() < 16 {
        return Err(StoreError::CorruptSegment(
            "Point stream payload too short".to_string(),
        ));
    }

    let first_ts = i64::from_le_bytes(payload[..8].try_into().unwrap());
    let first_val = f64::from_bits(u64::from_le_bytes(payload[8..16].try_into().unwrap()));
    let mut out = Vec::with_capacity(count);
    out.push((first_ts, first_val));

    let mut src = BitSource::new(&payload[16..]);
    let mut prev_ts = first_ts;
    let mut prev_delta: i64 = 0;
    let mut prev_bits = first_val.to_bits();
    let mut prev_trailing: u32 = 0;
    let mut prev_sigbits: u32 = 0;

    for _ in 1..count {
        let dod: i64 = if src.take(1)? == 0 {
            0
        } else if src.take(1)? == 0 {
            src.take(7)? as i64 - 63
        } else if src.take(1)? == 0 {
            src.take(9)? as i64 - 255
        } else if src.take(1)? == 0 {
            src.take(12)? as i64 - 2047
        } else {
            src.take(64)? as i64
        };
        prev_delta = prev_delta.wrapping_add(dod);
        prev_ts = prev_ts.wrapping_add(prev_delta);

        let bits = if src.take(1)? == 0 {
            prev_bits
        } else if src.take(1)? == 0 {
            if prev_sigbits == 0 {
                return Err(StoreError::CorruptSegment(
                    "XOR window reuse before initialization".to_string(),
                ));
            }
            prev_bits ^ (src.take(prev_sigbits)? << prev_trailing)
        } else {
            let leading = src.take(6)? as u32;
            let sigbits = src.take(6)? as u32 + 1;
            if leading + sigbits > 64 {
                return Err(StoreError::CorruptSegment(
                    "Invalid XOR bit widths".to_string(),
                ));
            }
            let trailing = 64 - leading - sigbits;
            prev_trailing = trailing;
            prev_sigbits = sigbits;
            prev_bits ^ (src.take(sigbits)? << trailing)
        };
        prev_bits = bits;
        out.push((prev_ts, f64::from_bits(bits)));
    }
    Ok(out)
}

// --- block compression helpers (shared with the chunk codec) ---

pub(crate) fn compress_block(
    compression: BlockCompression,
    payload: &[u8],
) -> Result<(u8, Vec<u8>), StoreError> {
    match compression {
        BlockCompression::None => Ok((COMPRESS_NONE, payload.to_vec())),
        BlockCompression::Lz4 => Ok((COMPRESS_LZ4, lz4_flex::compress_prepend_size(payload))),
        BlockCompression::Zstd { level } => {
            let compressed = zstd::bulk::compress(payload, level)
                .map_err(|e| StoreError::Internal(format!("Zstd compress failed: {}", e)))?;
            Ok((COMPRESS_ZSTD, compressed))
        }
    }
}

pub(crate) fn decompress_block(
    codec: u8,
    stored: &[u8],
    uncompressed_len: usize,
) -> Result<Vec<u8>, StoreError> {
    if uncompressed_len > 512 * 1024 * 1024 {
        return Err(StoreError::CorruptSegment(
            "Refusing to allocate oversized block".to_string(),
        ));
    }
    match codec {
        COMPRESS_NONE => Ok(stored.to_vec()),
        COMPRESS_LZ4 => lz4_flex::decompress_size_prepended(stored)
            .map_err(|e| StoreError::CorruptSegment(format!("LZ4 decompress failed: {}", e))),
        COMPRESS_ZSTD => zstd::bulk::decompress(stored, uncompressed_len)
            .map_err(|e| StoreError::CorruptSegment(format!("Zstd decompress failed: {}", e))),
        other => Err(StoreError::CorruptSegment(format!(
            "Unknown compression codec {}",
            other
        ))),
    }
}

#[inline]
pub(crate) fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

// --- bit-level IO ---
//
// Bits are packed least-significant-first through a u64 accumulator; whole
// 64-bit words are spilled to the output as they fill, and the tail is
// flushed byte-wise. The reader mirrors this over a byte slice.

#[inline]
fn low_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

struct BitSink<'a> {
    out: &'a mut Vec<u8>,
    acc: u64,
    filled: u32,
}

impl<'a> BitSink<'a> {
    fn new(out: &'a mut Vec<u8>) -> Self {
        Self { out, acc: 0, filled: 0 }
    }

    /// Appends the low `width` bits of `v`.
    fn put(&mut self, v: u64, width: u32) {
        let mut v = v & low_mask(width);
        let mut width = width;
        while width > 0 {
            let room = 64 - self.filled;
            let take = width.min(room);
            self.acc |= (v & low_mask(take)) << self.filled;
            self.filled += take;
            width -= take;
            v = if take < 64 { v >> take } else { 0 };
            if self.filled == 64 {
                self.out.extend_from_slice(&self.acc.to_le_bytes());
                self.acc = 0;
                self.filled = 0;
            }
        }
    }

    fn finish(self) {
        let mut acc = self.acc;
        let mut left = self.filled;
        while left > 0 {
            self.out.push(acc as u8);
            acc >>= 8;
            left = left.saturating_sub(8);
        }
    }
}

struct BitSource<'a> {
    data: &'a [u8],
    next: usize,
    acc: u64,
    avail: u32,
}

impl<'a> BitSource<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, next: 0, acc: 0, avail: 0 }
    }

    /// Consumes `width` bits, returned in the low bits of the result.
    fn take(&mut self, width: u32) -> Result<u64, StoreError> {
        if width > 32 {
            // Wide reads split so the refill loop below never shifts a byte
            // past the top of the accumulator.
            let lo = self.take(32)?;
            let hi = self.take(width - 32)?;
            return Ok(lo | (hi << 32));
        }
        while self.avail < width {
            let byte = *self.data.get(self.next).ok_or_else(|| {
                StoreError::CorruptSegment("Truncated bit stream".to_string())
            })?;
            self.acc |= (byte as u64) << self.avail;
            self.next += 1;
            self.avail += 8;
        }
        let out = self.acc & low_mask(width);
        self.acc >>= width;
        self.avail -= width;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(points: &[(i64, f64)], compression: BlockCompression) {
        let blob = compress_points(points, compression).expect("encode");
        let decoded = decompress_points(&blob, points.len()).expect("decode");
        assert_eq!(decoded.len(), points.len());
        for (a, b) in points.iter().zip(decoded.iter()) {
            assert_eq!(a.0, b.0);
            assert_eq!(a.1.to_bits(), b.1.to_bits(), "bit-exact values");
        }
    }

    #[test]
    fn round_trip_regular_cadence() {
        let points: Vec<(i64, f64)> = (0..500)
            .map(|i| (1_700_000_000 + i * 15, 20.0 + (i % 7) as f64 * 0.5))
            .collect();
        round_trip(&points, BlockCompression::Zstd { level: 1 });
        round_trip(&points, BlockCompression::Lz4);
        round_trip(&points, BlockCompression::None);
    }

    #[test]
    fn round_trip_irregular_and_out_of_order() {
        let points = vec![
            (1_700_000_000, 1.0),
            (1_700_000_003, 1.0),
            (1_700_000_500, -4.25),
            (1_699_999_000, f64::MAX),
            (1_700_100_000, f64::MIN_POSITIVE),
            (1_700_100_001, 0.0),
        ];
        round_trip(&points, BlockCompression::Zstd { level: 0 });
    }

    #[test]
    fn round_trip_single_point_and_constant_values() {
        round_trip(&[(42, 3.5)], BlockCompression::None);
        let constant: Vec<(i64, f64)> = (0..100).map(|i| (i * 60, 99.0)).collect();
        round_trip(&constant, BlockCompression::Zstd { level: 0 });
    }

    #[test]
    fn nan_bit_patterns_survive() {
        let points = vec![(1, f64::NAN), (2, f64::from_bits(0x7ff8_dead_beef_0001))];
        let blob = compress_points(&points, BlockCompression::None).unwrap();
        let decoded = decompress_points(&blob, 2).unwrap();
        assert_eq!(decoded[0].1.to_bits(), points[0].1.to_bits());
        assert_eq!(decoded[1].1.to_bits(), points[1].1.to_bits());
    }

    #[test]
    fn regular_streams_compress_well() {
        let points: Vec<(i64, f64)> = (0..4000).map(|i| (i * 10, 100.0)).collect();
        let blob = compress_points(&points, BlockCompression::Zstd { level: 0 }).unwrap();
        // 4000 points raw would be 64 KB; the encoded stream should be far below.
        assert!(blob.len() < 8_000, "blob was {} bytes", blob.len());
    }

    #[test]
    fn empty_input_is_refused() {
        assert!(compress_points(&[], BlockCompression::None).is_err());
    }

    #[test]
    fn bad_magic_is_corruption() {
        let blob = compress_points(&[(1, 1.0)], BlockCompression::None).unwrap();
        let mut bad = blob.clone();
        bad[0] ^= 0xff;
        assert!(matches!(
            decompress_points(&bad, 1),
            Err(StoreError::CorruptSegment(_))
        ));
    }

    #[test]
    fn crc_mismatch_is_corruption() {
        let blob = compress_points(&[(1, 1.0), (2, 2.0)], BlockCompression::None).unwrap();
        let mut bad = blob.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        assert!(matches!(
            decompress_points(&bad, 2),
            Err(StoreError::CorruptSegment(_))
        ));
    }

    #[test]
    fn truncated_container_is_corruption() {
        let blob = compress_points(&[(1, 1.0)], BlockCompression::None).unwrap();
        assert!(matches!(
            decompress_points(&blob[..10], 1),
            Err(StoreError::CorruptSegment(_))
        ));
    }
}

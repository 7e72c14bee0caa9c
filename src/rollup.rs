//! Tiered rollup: one pass reads source data between the tier's watermark and
//! a safety-margin horizon, computes per-bucket aggregates, merges them into
//! the tier's chunks, and advances the watermark.
//!
//! Tier 0 sources sealed raw segments; every coarser tier sources the tier
//! before it, re-aggregated with the mathematically correct combiners. A raw
//! point therefore contributes to each tier exactly once, except when late
//! data forces an explicit recompute, which replaces the affected buckets
//! wholesale.

use crate::codec::{decode_chunk, encode_chunk, merge_chunk};
use crate::error::StoreError;
use crate::store::ShardStore;
use crate::types::{
    align_down, count_to_slot, slot_to_count, AggSet, Aggregate, Bucket, SeriesId, TierSpec,
    Timestamp, Value,
};

use std::collections::{BTreeMap, HashMap};

/// Running aggregates for one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub last_ts: Timestamp,
    pub last: f64,
}

impl BucketStats {
    pub fn from_point(ts: Timestamp, value: Value) -> Self {
        BucketStats {
            count: 1,
            sum: value,
            min: value,
            max: value,
            last_ts: ts,
            last: value,
        }
    }

    pub fn add_point(&mut self, ts: Timestamp, value: Value) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if ts >= self.last_ts {
            self.last_ts = ts;
            self.last = value;
        }
    }

    /// Pointwise combiner: `sum`/`min`/`max` combine directly, `count` sums,
    /// `last` takes the latest contributor's last.
    pub fn combine(&mut self, other: &BucketStats) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        if other.last_ts >= self.last_ts {
            self.last_ts = other.last_ts;
            self.last = other.last;
        }
    }

    pub fn avg(&self) -> f64 {
        self.sum / self.count as f64
    }

    /// Value slots in mask order for the codec.
    pub fn to_values(&self, mask: AggSet) -> Vec<f64> {
        mask.iter()
            .map(|agg| match agg {
                Aggregate::Avg => self.avg(),
                Aggregate::Min => self.min,
                Aggregate::Max => self.max,
                Aggregate::Count => count_to_slot(self.count),
                Aggregate::Sum => self.sum,
                Aggregate::Last => self.last,
            })
            .collect()
    }

    /// Reconstructs stats from a stored bucket. Fields missing from the mask
    /// degrade to the closest available value so coarser tiers with reduced
    /// aggregate sets still combine sensibly.
    pub fn from_bucket(mask: AggSet, bucket: &Bucket) -> Self {
        let mut avg = None;
        let mut min = None;
        let mut max = None;
        let mut count = None;
        let mut sum = None;
        let mut last = None;
        for (agg, &v) in mask.iter().zip(bucket.values.iter()) {
            match agg {
                Aggregate::Avg => avg = Some(v),
                Aggregate::Min => min = Some(v),
                Aggregate::Max => max = Some(v),
                Aggregate::Count => count = Some(slot_to_count(v)),
                Aggregate::Sum => sum = Some(v),
                Aggregate::Last => last = Some(v),
            }
        }
        let count = count.unwrap_or(1);
        let sum = sum.unwrap_or_else(|| avg.map(|a| a * count as f64).unwrap_or(0.0));
        let fallback = avg.unwrap_or(sum / count as f64);
        BucketStats {
            count,
            sum,
            min: min.unwrap_or(fallback),
            max: max.unwrap_or(fallback),
            last_ts: bucket.start,
            last: last.unwrap_or(fallback),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RollupOutcome {
    pub buckets: usize,
    pub chunks: usize,
    pub advanced_to: Timestamp,
}

/// Runs one rollup pass for `tier` on this shard.
///
/// `pending_floor` is the earliest timestamp still unsealed in the builder;
/// the pass never advances past it, so unsealed points cannot be skipped.
pub fn run_pass(
    store: &ShardStore,
    tiers: &[TierSpec],
    tier: usize,
    now: Timestamp,
    safety_margin: i64,
    pending_floor: Option<Timestamp>,
) -> Result<Option<RollupOutcome>, StoreError> {
    let spec = &tiers[tier];
    let res = spec.resolution;

    let wm = store.watermark(tier);
    let redo = store.take_redo(tier);
    let start = align_down(redo.map(|r| r.min(wm)).unwrap_or(wm), res);

    let mut safe_to = align_down(now - safety_margin, res);
    if let Some(floor) = pending_floor {
        safe_to = safe_to.min(align_down(floor, res));
    }
    if tier > 0 {
        safe_to = safe_to.min(align_down(store.watermark(tier - 1), res));
    }

    if start >= safe_to {
        if let Some(r) = redo {
            store.restore_redo(tier, r);
        }
        return Ok(None);
    }

    match compute_and_write(store, tiers, tier, start, safe_to) {
        Ok(outcome) => {
            store.set_watermark(tier, safe_to)?;
            Ok(Some(RollupOutcome { advanced_to: safe_to, ..outcome }))
        }
        Err(e) => {
            // The pass did not complete; keep the recompute mark alive.
            if let Some(r) = redo {
                store.restore_redo(tier, r);
            }
            Err(e)
        }
    }
}

fn compute_and_write(
    store: &ShardStore,
    tiers: &[TierSpec],
    tier: usize,
    start: Timestamp,
    safe_to: Timestamp,
) -> Result<RollupOutcome, StoreError> {
    let spec = &tiers[tier];
    let stats = if tier == 0 {
        buckets_from_raw(store, spec, start, safe_to)?
    } else {
        buckets_from_tier(store, tiers, tier, start, safe_to)?
    };
    if stats.is_empty() {
        return Ok(RollupOutcome::default());
    }

    let mut outcome = RollupOutcome::default();
    let mut writes: Vec<(SeriesId, Timestamp, Timestamp, Vec<u8>)> = Vec::new();
    for (series_id, buckets) in stats {
        // Group this series' buckets by their chunk.
        let mut by_chunk: BTreeMap<Timestamp, Vec<Bucket>> = BTreeMap::new();
        for (bucket_start, bs) in buckets {
            outcome.buckets += 1;
            by_chunk
                .entry(spec.chunk_start(bucket_start))
                .or_default()
                .push(Bucket { start: bucket_start, values: bs.to_values(spec.aggregates) });
        }

        for (chunk_start, new_buckets) in by_chunk {
            let res_u32 = spec.resolution as u32;
            let blob = match store.read_chunk(tier, series_id, chunk_start)? {
                Some(existing) => {
                    match merge_chunk(
                        &existing,
                        &new_buckets,
                        res_u32,
                        spec.aggregates,
                        store.compression(),
                    ) {
                        Ok(blob) => blob,
                        Err(StoreError::CorruptChunk(_)) => {
                            // Unreadable prior chunk: rebuild from what we have.
                            store.note_corruption();
                            encode_chunk(res_u32, spec.aggregates, &new_buckets, store.compression())?
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => encode_chunk(res_u32, spec.aggregates, &new_buckets, store.compression())?,
            };
            writes.push((series_id, chunk_start, chunk_start + spec.chunk_seconds, blob));
        }
    }

    outcome.chunks = writes.len();
    store.write_chunks(tier, writes)?;
    store.maybe_compact_tier(tier)?;
    Ok(outcome)
}

type SeriesBuckets = HashMap<SeriesId, BTreeMap<Timestamp, BucketStats>>;

fn buckets_from_raw(
    store: &ShardStore,
    spec: &TierSpec,
    start: Timestamp,
    safe_to: Timestamp,
) -> Result<SeriesBuckets, StoreError> {
    let raw = store.scan_raw(start, safe_to)?;
    let mut out: SeriesBuckets = HashMap::new();
    for (series_id, points) in raw {
        let buckets = out.entry(series_id).or_default();
        for (ts, value) in points {
            let b = spec.bucket_start(ts);
            buckets
                .entry(b)
                .and_modify(|bs| bs.add_point(ts, value))
                .or_insert_with(|| BucketStats::from_point(ts, value));
        }
    }
    Ok(out)
}

fn buckets_from_tier(
    store: &ShardStore,
    tiers: &[TierSpec],
    tier: usize,
    start: Timestamp,
    safe_to: Timestamp,
) -> Result<SeriesBuckets, StoreError> {
    let src = &tiers[tier - 1];
    let spec = &tiers[tier];
    let entries = store.chunk_entries_all(tier - 1, start, safe_to)?;

    let mut out: SeriesBuckets = HashMap::new();
    for entry in entries {
        let blob = match store.read_chunk_blob(tier - 1, &entry) {
            Ok(b) => b,
            Err(StoreError::CorruptChunk(_)) => {
                store.note_corruption();
                continue;
            }
            Err(e) => return Err(e),
        };
        let decoded = match decode_chunk(&blob) {
            Ok(d) => d,
            Err(StoreError::CorruptChunk(_)) => {
                store.note_corruption();
                continue;
            }
            Err(e) => return Err(e),
        };
        let buckets = out.entry(entry.series_id).or_default();
        for bucket in decoded.buckets {
            if bucket.start < start || bucket.start >= safe_to {
                continue;
            }
            let bs = BucketStats::from_bucket(src.aggregates, &bucket);
            buckets
                .entry(spec.bucket_start(bucket.start))
                .and_modify(|acc| acc.combine(&bs))
                .or_insert(bs);
        }
    }
    Ok(out)
}

//! Query planning: resolve matchers to series, pick the cheapest source tier,
//! stitch rolled-up history with the raw tail, and re-aggregate onto the
//! query's step grid.

use crate::builder::SegmentBuilder;
use crate::codec::decode_chunk;
use crate::error::StoreError;
use crate::registry::SeriesRegistry;
use crate::rollup::BucketStats;
use crate::store::ShardStore;
use crate::types::{
    align_down, shard_of, Aggregate, Labels, Matcher, Schema, SeriesId, Timestamp, Value,
};

use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Read-side view of one shard.
#[derive(Clone)]
pub(crate) struct ShardReader {
    pub builder: Arc<RwLock<SegmentBuilder>>,
    pub store: Arc<ShardStore>,
}

/// Query deadline; exceeded deadlines abandon partial work with `Timeout`.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Deadline(None)
    }

    pub fn after(d: Duration) -> Self {
        Deadline(Some(Instant::now() + d))
    }

    pub(crate) fn check(&self) -> Result<(), StoreError> {
        match self.0 {
            Some(t) if Instant::now() >= t => Err(StoreError::Timeout),
            _ => Ok(()),
        }
    }
}

/// One row of an instant query result.
#[derive(Debug, Clone, PartialEq)]
pub struct InstantSample {
    pub series_id: SeriesId,
    pub labels: Labels,
    pub timestamp: Timestamp,
    pub value: Value,
}

pub(crate) fn query_range(
    registry: &SeriesRegistry,
    shards: &[ShardReader],
    schema: &Schema,
    metric: &str,
    matchers: &[Matcher],
    from: Timestamp,
    to: Timestamp,
    step: i64,
    aggregator: Aggregate,
    now: Timestamp,
    deadline: Deadline,
) -> Result<Vec<(Timestamp, Value)>, StoreError> {
    if from >= to {
        return Err(StoreError::InvalidTimeRange { from, to });
    }
    if step <= 0 {
        return Err(StoreError::InvalidInput("step must be positive".to_string()));
    }
    deadline.check()?;

    let series = registry.resolve(metric, matchers)?;
    if series.is_empty() {
        return Ok(Vec::new());
    }

    let source = select_tier(schema, from, step, now);

    // Collect per-series grids in parallel, then combine across series with
    // the same combiner semantics.
    let per_series: Result<Vec<BTreeMap<Timestamp, BucketStats>>, StoreError> = series
        .par_iter()
        .map(|record| {
            deadline.check()?;
            let reader = &shards[shard_of(record.id, shards.len())];
            collect_series_grid(reader, schema, source, record.id, from, to, step, deadline)
        })
        .collect();

    let mut combined: BTreeMap<Timestamp, BucketStats> = BTreeMap::new();
    for grid in per_series? {
        for (g, bs) in grid {
            combined
                .entry(g)
                .and_modify(|acc| acc.combine(&bs))
                .or_insert(bs);
        }
    }

    Ok(combined
        .into_iter()
        .map(|(g, bs)| (g, extract(aggregator, &bs)))
        .collect())
}

/// The coarsest tier that is fine enough for `step` and still retains data
/// covering `from`; `None` means read raw.
fn select_tier(schema: &Schema, from: Timestamp, step: i64, now: Timestamp) -> Option<usize> {
    schema
        .tiers
        .iter()
        .enumerate()
        .rev()
        .find(|(_, tier)| {
            tier.resolution <= step
                && tier.retention.map(|r| now - r <= from).unwrap_or(true)
        })
        .map(|(idx, _)| idx)
}

#[allow(clippy::too_many_arguments)]
fn collect_series_grid(
    reader: &ShardReader,
    schema: &Schema,
    source: Option<usize>,
    series_id: SeriesId,
    from: Timestamp,
    to: Timestamp,
    step: i64,
    deadline: Deadline,
) -> Result<BTreeMap<Timestamp, BucketStats>, StoreError> {
    let mut grid: BTreeMap<Timestamp, BucketStats> = BTreeMap::new();
    let grid_key = |ts: Timestamp| from + ((ts - from) / step) * step;

    // Raw tail starts where tier coverage ends; the boundary sits on a tier
    // bucket edge so no bucket is split or double counted.
    let mut raw_from = from;
    if let Some(tier_idx) = source {
        let tier = &schema.tiers[tier_idx];
        let covered = align_down(reader.store.watermark(tier_idx), tier.resolution);
        let cut = covered.min(to).max(from);
        raw_from = cut;

        if cut > from {
            deadline.check()?;
            for entry in reader.store.chunk_entries(tier_idx, series_id, from, cut)? {
                let blob = match reader.store.read_chunk_blob(tier_idx, &entry) {
                    Ok(b) => b,
                    Err(StoreError::CorruptChunk(_)) => {
                        reader.store.note_corruption();
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let decoded = match decode_chunk(&blob) {
                    Ok(d) => d,
                    Err(StoreError::CorruptChunk(_)) => {
                        reader.store.note_corruption();
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                for bucket in decoded.buckets {
                    // A bucket straddling `from` still mostly belongs to the
                    // first grid cell; one fully before `from` does not.
                    if bucket.start + tier.resolution <= from || bucket.start >= cut {
                        continue;
                    }
                    let bs = BucketStats::from_bucket(tier.aggregates, &bucket);
                    grid.entry(grid_key(bucket.start.max(from)))
                        .and_modify(|acc| acc.combine(&bs))
                        .or_insert(bs);
                }
            }
        }
    }

    if raw_from < to {
        deadline.check()?;
        let sealed = reader.store.read_raw_series(series_id, raw_from, to)?;
        let pending = reader.builder.read()?.read(series_id, raw_from, to);
        for (ts, value) in sealed.into_iter().chain(pending) {
            grid.entry(grid_key(ts))
                .and_modify(|bs| bs.add_point(ts, value))
                .or_insert_with(|| BucketStats::from_point(ts, value));
        }
    }

    Ok(grid)
}

fn extract(aggregator: Aggregate, bs: &BucketStats) -> Value {
    match aggregator {
        Aggregate::Avg => bs.avg(),
        Aggregate::Min => bs.min,
        Aggregate::Max => bs.max,
        Aggregate::Count => bs.count as f64,
        Aggregate::Sum => bs.sum,
        Aggregate::Last => bs.last,
    }
}

pub(crate) fn query_instant(
    registry: &SeriesRegistry,
    shards: &[ShardReader],
    schema: &Schema,
    metric: &str,
    matchers: &[Matcher],
    at: Option<Timestamp>,
    deadline: Deadline,
) -> Result<Vec<InstantSample>, StoreError> {
    deadline.check()?;
    let series = registry.resolve(metric, matchers)?;
    let at = at.unwrap_or(i64::MAX - 1);

    let mut out = Vec::new();
    for record in series {
        deadline.check()?;
        let reader = &shards[shard_of(record.id, shards.len())];

        let pending = reader.builder.read()?.latest(record.id, at);
        let sealed = reader.store.latest_raw(record.id, at)?;
        let newest_raw = match (pending, sealed) {
            (Some(p), Some(s)) => Some(if p.0 >= s.0 { p } else { s }),
            (p, s) => p.or(s),
        };

        let best = match newest_raw {
            Some(p) => Some(p),
            // Raw already expired: fall back to the finest tier still holding
            // a bucket, reporting its last value at the bucket start.
            None => latest_from_tiers(reader, schema, record.id, at)?,
        };

        if let Some((timestamp, value)) = best {
            out.push(InstantSample {
                series_id: record.id,
                labels: record.labels.clone(),
                timestamp,
                value,
            });
        }
    }
    out.sort_by_key(|s| s.series_id);
    Ok(out)
}

fn latest_from_tiers(
    reader: &ShardReader,
    schema: &Schema,
    series_id: SeriesId,
    at: Timestamp,
) -> Result<Option<(Timestamp, Value)>, StoreError> {
    for (tier_idx, tier) in schema.tiers.iter().enumerate() {
        let entries = reader
            .store
            .chunk_entries(tier_idx, series_id, i64::MIN, at.saturating_add(1))?;
        let Some(entry) = entries.iter().max_by_key(|e| e.chunk_start) else {
            continue;
        };
        let blob = match reader.store.read_chunk_blob(tier_idx, entry) {
            Ok(b) => b,
            Err(StoreError::CorruptChunk(_)) => {
                reader.store.note_corruption();
                continue;
            }
            Err(e) => return Err(e),
        };
        let Ok(decoded) = decode_chunk(&blob) else {
            reader.store.note_corruption();
            continue;
        };
        let newest = decoded
            .buckets
            .iter()
            .filter(|b| b.start <= at)
            .next_back();
        if let Some(bucket) = newest {
            let bs = BucketStats::from_bucket(tier.aggregates, bucket);
            return Ok(Some((bucket.start, bs.last)));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TierSpec;

    fn schema() -> Schema {
        Schema {
            tiers: vec![
                TierSpec::new("hourly", 3_600, 24, Some(90 * 86_400)),
                TierSpec::new("daily", 86_400, 30, None),
            ],
        }
    }

    #[test]
    fn tier_selection_prefers_coarsest_adequate_tier() {
        let s = schema();
        let now = 100 * 86_400;

        // Step finer than any tier: raw.
        assert_eq!(select_tier(&s, now - 3_600, 60, now), None);
        // Hourly step within hourly retention.
        assert_eq!(select_tier(&s, now - 86_400, 3_600, now), Some(0));
        // Daily step picks the daily tier.
        assert_eq!(select_tier(&s, now - 86_400, 86_400, now), Some(1));
        // Hourly step past hourly retention: daily is too coarse, so raw.
        assert_eq!(select_tier(&s, now - 95 * 86_400, 3_600, now), None);
        // Daily step past hourly retention still lands on daily.
        assert_eq!(select_tier(&s, now - 95 * 86_400, 86_400, now), Some(1));
    }

    #[test]
    fn deadline_triggers_timeout() {
        let d = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(d.check(), Err(StoreError::Timeout)));
        assert!(Deadline::none().check().is_ok());
    }

    #[test]
    fn extract_covers_all_aggregators() {
        let mut bs = BucketStats::from_point(10, 2.0);
        bs.add_point(20, 6.0);
        assert_eq!(extract(Aggregate::Avg, &bs), 4.0);
        assert_eq!(extract(Aggregate::Min, &bs), 2.0);
        assert_eq!(extract(Aggregate::Max, &bs), 6.0);
        assert_eq!(extract(Aggregate::Count, &bs), 2.0);
        assert_eq!(extract(Aggregate::Sum, &bs), 8.0);
        assert_eq!(extract(Aggregate::Last, &bs), 6.0);
    }
}

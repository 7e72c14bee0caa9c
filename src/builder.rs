//! Per-shard segment builder: accumulates the open window's points in memory,
//! checkpoints them into the shard WAL, and hands sorted batches to the shard
//! store when a window closes.
//!
//! The pending map is the authoritative copy of the open window for reads;
//! the WAL exists only to survive crashes. Out-of-order points land in the
//! window their timestamp belongs to, so a straggler behind the open window
//! collects in its own (re)sealable window.

use crate::encoding::{compress_points, BlockCompression};
use crate::error::StoreError;
use crate::store::WalRecord;
use crate::types::{window_start, Point, SeriesId, Timestamp, Value};

use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
pub struct SegmentBuilder {
    window_duration: i64,
    /// window_start -> series -> points in submission order.
    pending: BTreeMap<Timestamp, HashMap<SeriesId, Vec<(Timestamp, Value)>>>,
    point_count: usize,
}

impl SegmentBuilder {
    pub fn new(window_duration: i64) -> Self {
        SegmentBuilder {
            window_duration,
            pending: BTreeMap::new(),
            point_count: 0,
        }
    }

    /// Appends a drained batch. Points are bucketed into their own windows.
    pub fn append(&mut self, points: &[Point]) {
        for p in points {
            let w = window_start(p.timestamp, self.window_duration);
            self.pending
                .entry(w)
                .or_default()
                .entry(p.series_id)
                .or_default()
                .push((p.timestamp, p.value));
            self.point_count += 1;
        }
    }

    /// Windows that should be sealed now: every window that has fallen behind
    /// the newest one with data, plus any window past its grace deadline.
    pub fn windows_due(&self, now: Timestamp, grace: i64) -> Vec<Timestamp> {
        let newest = match self.pending.keys().next_back() {
            Some(&w) => w,
            None => return Vec::new(),
        };
        self.pending
            .keys()
            .copied()
            .filter(|&w| w < newest || now >= w + self.window_duration + grace)
            .collect()
    }

    /// Removes and returns one window's pending points.
    pub fn take_window(
        &mut self,
        window: Timestamp,
    ) -> Option<HashMap<SeriesId, Vec<(Timestamp, Value)>>> {
        let taken = self.pending.remove(&window)?;
        self.point_count -= taken.values().map(Vec::len).sum::<usize>();
        Some(taken)
    }

    /// Compresses every pending series into WAL checkpoint records. Pending
    /// state is retained; records are cumulative and recovery keeps the last
    /// one per (window, series).
    pub fn checkpoint_records(
        &self,
        compression: BlockCompression,
    ) -> Result<Vec<WalRecord>, StoreError> {
        let mut out = Vec::new();
        for points_by_series in self.pending.values() {
            for (&series_id, points) in points_by_series {
                if points.is_empty() {
                    continue;
                }
                let start_time = points.iter().map(|p| p.0).min().unwrap_or(0);
                let end_time = points.iter().map(|p| p.0).max().unwrap_or(0);
                let data = compress_points(points, compression)?;
                out.push(WalRecord {
                    series_id,
                    start_time,
                    end_time,
                    point_count: points.len() as u32,
                    data,
                });
            }
        }
        Ok(out)
    }

    /// Points for one series within `[from, to)`, across all open windows.
    pub fn read(&self, series_id: SeriesId, from: Timestamp, to: Timestamp) -> Vec<(Timestamp, Value)> {
        let mut out: Vec<(Timestamp, Value)> = Vec::new();
        for (&w, points_by_series) in &self.pending {
            if w >= to || w + self.window_duration <= from {
                continue;
            }
            if let Some(points) = points_by_series.get(&series_id) {
                out.extend(points.iter().copied().filter(|p| p.0 >= from && p.0 < to));
            }
        }
        out.sort_by_key(|p| p.0);
        out
    }

    /// The newest pending point for a series at or before `at`.
    pub fn latest(&self, series_id: SeriesId, at: Timestamp) -> Option<(Timestamp, Value)> {
        let mut best: Option<(Timestamp, Value)> = None;
        for points_by_series in self.pending.values() {
            if let Some(points) = points_by_series.get(&series_id) {
                for &(ts, v) in points {
                    if ts <= at && best.map(|b| ts >= b.0).unwrap_or(true) {
                        best = Some((ts, v));
                    }
                }
            }
        }
        best
    }

    /// Earliest pending timestamp, if any (used to hold back rollup).
    pub fn min_pending_ts(&self) -> Option<Timestamp> {
        self.pending
            .values()
            .flat_map(|m| m.values())
            .flat_map(|pts| pts.iter().map(|p| p.0))
            .min()
    }

    pub fn point_count(&self) -> usize {
        self.point_count
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: i64 = 14_400;

    fn point(sid: u64, ts: i64, value: f64) -> Point {
        Point { series_id: sid, timestamp: ts, value }
    }

    #[test]
    fn points_land_in_their_windows() {
        let mut b = SegmentBuilder::new(WINDOW);
        b.append(&[
            point(1, 100, 1.0),
            point(1, WINDOW + 5, 2.0),
            point(2, 50, 3.0),
        ]);
        assert_eq!(b.point_count(), 3);

        let w0 = b.take_window(0).unwrap();
        assert_eq!(w0[&1], vec![(100, 1.0)]);
        assert_eq!(w0[&2], vec![(50, 3.0)]);
        let w1 = b.take_window(WINDOW).unwrap();
        assert_eq!(w1[&1], vec![(WINDOW + 5, 2.0)]);
        assert!(b.is_empty());
    }

    #[test]
    fn due_windows_trail_the_newest_or_expire_by_grace() {
        let mut b = SegmentBuilder::new(WINDOW);
        b.append(&[point(1, 100, 1.0)]);
        // Open window, inside grace: nothing due.
        assert!(b.windows_due(WINDOW, 60).is_empty());
        // Past end + grace: due.
        assert_eq!(b.windows_due(WINDOW + 61, 60), vec![0]);

        // A point in the next window makes the previous one due immediately.
        b.append(&[point(1, WINDOW + 1, 2.0)]);
        assert_eq!(b.windows_due(WINDOW + 2, 3600), vec![0]);
    }

    #[test]
    fn late_point_reopens_an_older_window() {
        let mut b = SegmentBuilder::new(WINDOW);
        b.append(&[point(1, WINDOW * 3 + 10, 1.0)]);
        b.append(&[point(1, 5, 9.0)]);
        let due = b.windows_due(WINDOW * 3 + 20, 3600);
        assert_eq!(due, vec![0]);
        let w0 = b.take_window(0).unwrap();
        assert_eq!(w0[&1], vec![(5, 9.0)]);
    }

    #[test]
    fn read_filters_range_and_sorts() {
        let mut b = SegmentBuilder::new(WINDOW);
        b.append(&[
            point(1, 30, 3.0),
            point(1, 10, 1.0),
            point(1, 20, 2.0),
            point(2, 15, 9.0),
        ]);
        assert_eq!(b.read(1, 10, 30), vec![(10, 1.0), (20, 2.0)]);
        assert_eq!(b.read(1, 0, 100), vec![(10, 1.0), (20, 2.0), (30, 3.0)]);
        assert!(b.read(3, 0, 100).is_empty());
    }

    #[test]
    fn latest_respects_at_bound() {
        let mut b = SegmentBuilder::new(WINDOW);
        b.append(&[point(1, 10, 1.0), point(1, 20, 2.0)]);
        assert_eq!(b.latest(1, 100), Some((20, 2.0)));
        assert_eq!(b.latest(1, 15), Some((10, 1.0)));
        assert_eq!(b.latest(1, 5), None);
    }

    #[test]
    fn checkpoint_keeps_pending() {
        let mut b = SegmentBuilder::new(WINDOW);
        b.append(&[point(1, 10, 1.0), point(1, 20, 2.0)]);
        let records = b.checkpoint_records(BlockCompression::None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].series_id, 1);
        assert_eq!(records[0].start_time, 10);
        assert_eq!(records[0].end_time, 20);
        assert_eq!(records[0].point_count, 2);
        assert_eq!(b.point_count(), 2, "checkpoint must not drain pending");
    }
}

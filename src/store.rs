//! On-disk storage for one shard: sealed raw segment files with footer
//! indexes, the open-window WAL, per-tier chunk files with side indexes,
//! watermarks, dead-space compaction, and retention.
//!
//! All installs are atomic (tmp + rename + parent dir fsync). Sealed files
//! are never modified in place; replacement happens by rename, and readers
//! holding an old mapping keep a consistent view of the old inode.

use crate::encoding::{compress_points, decompress_points, BlockCompression};
use crate::error::StoreError;
use crate::types::{SeriesId, TierSpec, Timestamp, Value};

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub const SEG_MAGIC: &[u8; 2] = b"TS";
pub const SEG_VERSION: u8 = 1;
const SEG_HEADER_LEN: u64 = 12; // magic(2) + version(1) + segment_count(4) + reserved(5)
const SEG_INDEX_ENTRY_LEN: u64 = 44;
const SEG_FOOTER_LEN: u64 = 8;

const WAL_MAGIC: &[u8; 8] = b"STRWAL01";
const WAL_VERSION: u32 = 1;
const WAL_HEADER_LEN: u64 = 12;

const CHUNK_INDEX_ENTRY_LEN: u64 = 40;

/// Fraction of dead bytes in a tier chunk file that triggers compaction.
const COMPACTION_DEAD_RATIO: f64 = 0.30;

/// One WAL checkpoint record: a compressed point blob for one series within
/// one window, CRC-framed on disk.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub series_id: SeriesId,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub point_count: u32,
    pub data: Vec<u8>,
}

/// Parsed `.seg` index entry.
#[derive(Debug, Clone, Copy)]
pub struct SegIndexEntry {
    pub series_id: SeriesId,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub point_count: u32,
    pub offset: u64,
    pub length: u32,
}

/// `index.bin` entry for one tier chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkIndexEntry {
    pub series_id: SeriesId,
    pub chunk_start: Timestamp,
    pub chunk_end: Timestamp,
    pub offset: u64,
    pub length: u32,
    pub flags: u32,
}

#[derive(Debug)]
struct SegmentFile {
    window: Timestamp,
    path: PathBuf,
    mmap: Mmap,
    entries: Vec<SegIndexEntry>,
}

#[derive(Debug)]
struct TierFiles {
    dir: PathBuf,
    /// Sorted by (series_id, chunk_start); at most one live entry per pair.
    index: Vec<ChunkIndexEntry>,
    data_len: u64,
    dead_bytes: u64,
    map: Option<Arc<Mmap>>,
    generation: u64,
}

#[derive(Debug)]
struct ShardState {
    segments: BTreeMap<Timestamp, Arc<SegmentFile>>,
    tiers: Vec<TierFiles>,
    watermarks: Vec<Timestamp>,
    /// Per-tier low-water mark forced by late sealed data; `i64::MAX` = none.
    redo: Vec<Timestamp>,
}

/// Durable storage for one shard.
#[derive(Debug)]
pub struct ShardStore {
    shard: usize,
    dir: PathBuf,
    raw_dir: PathBuf,
    window_duration: i64,
    compression: BlockCompression,
    tiers: Vec<TierSpec>,
    state: RwLock<ShardState>,
    corruption_count: AtomicU64,
    paused: AtomicBool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionStats {
    pub removed_segments: usize,
    pub dropped_chunks: usize,
    pub compacted_tiers: usize,
}

impl ShardStore {
    pub fn open<P: AsRef<Path>>(
        dir: P,
        shard: usize,
        window_duration: i64,
        tiers: &[TierSpec],
        compression: BlockCompression,
    ) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        let raw_dir = dir.join("raw");
        fs::create_dir_all(&raw_dir)?;

        let mut corruption = 0u64;
        let mut segments = BTreeMap::new();
        for entry in fs::read_dir(&raw_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".seg") else { continue };
            let Ok(window) = stem.parse::<i64>() else { continue };
            match SegmentFile::open(entry.path(), window) {
                Ok(seg) => {
                    segments.insert(window, Arc::new(seg));
                }
                Err(_) => corruption += 1,
            }
        }
        // A seal interrupted before rename leaves a stray tmp behind.
        for entry in fs::read_dir(&raw_dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().ends_with(".seg.tmp") {
                let _ = fs::remove_file(entry.path());
            }
        }

        let mut tier_files = Vec::with_capacity(tiers.len());
        for tier in tiers {
            let tdir = dir.join(format!("tier_{}", tier.name));
            fs::create_dir_all(&tdir)?;
            for name in ["chunks.dat.tmp", "index.bin.tmp"] {
                let _ = fs::remove_file(tdir.join(name));
            }
            let index = load_chunk_index(&tdir.join("index.bin"))?;
            let data_len = fs::metadata(tdir.join("chunks.dat")).map(|m| m.len()).unwrap_or(0);
            let live: u64 = index.iter().map(|e| e.length as u64).sum();
            tier_files.push(TierFiles {
                dir: tdir,
                index,
                data_len,
                dead_bytes: data_len.saturating_sub(live),
                map: None,
                generation: 0,
            });
        }

        let watermarks = read_watermarks(&dir.join("watermarks.bin"), tiers.len())?;

        Ok(ShardStore {
            shard,
            raw_dir,
            dir,
            window_duration,
            compression,
            tiers: tiers.to_vec(),
            state: RwLock::new(ShardState {
                segments,
                tiers: tier_files,
                watermarks,
                redo: vec![i64::MAX; tiers.len()],
            }),
            corruption_count: AtomicU64::new(corruption),
            paused: AtomicBool::new(false),
        })
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn compression(&self) -> BlockCompression {
        self.compression
    }

    // --- WAL ---

    fn wal_path(&self) -> PathBuf {
        self.raw_dir.join("current.wal")
    }

    /// Appends checkpoint records and fsyncs once for the batch.
    pub fn append_wal(&self, records: &[WalRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let path = self.wal_path();
        let fresh = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if fresh {
            file.write_all(WAL_MAGIC)?;
            file.write_all(&WAL_VERSION.to_le_bytes())?;
        }
        let mut w = BufWriter::new(file);
        for rec in records {
            let mut hasher = Crc32::new();
            hasher.update(&rec.data);
            let crc = hasher.finalize();
            w.write_all(&(rec.series_id as i64).to_le_bytes())?;
            w.write_all(&rec.start_time.to_le_bytes())?;
            w.write_all(&rec.end_time.to_le_bytes())?;
            w.write_all(&rec.point_count.to_le_bytes())?;
            w.write_all(&(rec.data.len() as u32).to_le_bytes())?;
            w.write_all(&crc.to_le_bytes())?;
            w.write_all(&rec.data)?;
        }
        w.flush()?;
        w.get_ref().sync_data()?;
        Ok(())
    }

    /// Scans the WAL, truncating at the first damaged record. Returns the
    /// surviving records in append order.
    pub fn recover_wal(&self) -> Result<Vec<WalRecord>, StoreError> {
        let path = self.wal_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut f = File::open(&path)?;
        let mut header = [0u8; WAL_HEADER_LEN as usize];
        if f.read_exact(&mut header).is_err() || &header[..8] != WAL_MAGIC {
            // Unusable WAL; drop it rather than guessing at framing.
            drop(f);
            fs::remove_file(&path)?;
            self.corruption_count.fetch_add(1, Ordering::Relaxed);
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut valid_len = WAL_HEADER_LEN;
        loop {
            let mut fixed = [0u8; 36];
            match f.read_exact(&mut fixed) {
                Ok(()) => {}
                Err(_) => break,
            }
            let series_id = i64::from_le_bytes(fixed[0..8].try_into().unwrap()) as u64;
            let start_time = i64::from_le_bytes(fixed[8..16].try_into().unwrap());
            let end_time = i64::from_le_bytes(fixed[16..24].try_into().unwrap());
            let point_count = u32::from_le_bytes(fixed[24..28].try_into().unwrap());
            let data_length = u32::from_le_bytes(fixed[28..32].try_into().unwrap()) as usize;
            let crc = u32::from_le_bytes(fixed[32..36].try_into().unwrap());

            let mut data = vec![0u8; data_length];
            if f.read_exact(&mut data).is_err() {
                break;
            }
            let mut hasher = Crc32::new();
            hasher.update(&data);
            if hasher.finalize() != crc {
                self.corruption_count.fetch_add(1, Ordering::Relaxed);
                break;
            }
            valid_len += 36 + data_length as u64;
            out.push(WalRecord { series_id, start_time, end_time, point_count, data });
        }

        let actual = f.metadata()?.len();
        drop(f);
        if actual > valid_len {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        Ok(out)
    }

    pub fn delete_wal(&self) -> Result<(), StoreError> {
        let path = self.wal_path();
        if path.exists() {
            fs::remove_file(&path)?;
            sync_dir(&self.raw_dir)?;
        }
        Ok(())
    }

    // --- sealed segments ---

    /// Seals one window: merges with any existing segment file for the same
    /// window, writes data + index + footer to a tmp file, fsyncs, renames.
    pub fn seal_window(
        &self,
        window: Timestamp,
        mut batch: HashMap<SeriesId, Vec<(Timestamp, Value)>>,
    ) -> Result<(), StoreError> {
        batch.retain(|_, pts| !pts.is_empty());

        // Late data for an already-sealed window: fold the old contents in
        // and replace the file atomically.
        let existing = {
            let st = self.state.read()?;
            st.segments.get(&window).cloned()
        };
        if let Some(seg) = existing {
            for entry in &seg.entries {
                let points = seg.read_entry(entry)?;
                batch.entry(entry.series_id).or_default().extend(points);
            }
        }
        if batch.is_empty() {
            return Ok(());
        }

        let mut series: Vec<SeriesId> = batch.keys().copied().collect();
        series.sort_unstable();

        let final_path = self.raw_dir.join(format!("{}.seg", window));
        let tmp_path = self.raw_dir.join(format!("{}.seg.tmp", window));

        let file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
        let mut w = BufWriter::new(file);
        w.write_all(SEG_MAGIC)?;
        w.write_all(&[SEG_VERSION])?;
        w.write_all(&(series.len() as u32).to_le_bytes())?;
        w.write_all(&[0u8; 5])?;

        let mut entries: Vec<SegIndexEntry> = Vec::with_capacity(series.len());
        let mut offset = SEG_HEADER_LEN;
        for &sid in &series {
            let points = batch.get_mut(&sid).expect("series exists");
            points.sort_by_key(|p| p.0);
            let blob = compress_points(points, self.compression)?;
            w.write_all(&blob)?;
            entries.push(SegIndexEntry {
                series_id: sid,
                start_time: points.first().map(|p| p.0).unwrap_or(0),
                end_time: points.last().map(|p| p.0).unwrap_or(0),
                point_count: points.len() as u32,
                offset,
                length: blob.len() as u32,
            });
            offset += blob.len() as u64;
        }

        let index_offset = offset;
        for e in &entries {
            w.write_all(&(e.series_id as i64).to_le_bytes())?;
            w.write_all(&e.start_time.to_le_bytes())?;
            w.write_all(&e.end_time.to_le_bytes())?;
            w.write_all(&e.point_count.to_le_bytes())?;
            w.write_all(&e.offset.to_le_bytes())?;
            w.write_all(&e.length.to_le_bytes())?;
            w.write_all(&[0u8; 4])?;
        }
        w.write_all(&index_offset.to_le_bytes())?;
        w.flush()?;
        w.get_ref().sync_data()?;
        drop(w);

        fs::rename(&tmp_path, &final_path)?;
        sync_dir(&self.raw_dir)?;

        let seg = Arc::new(SegmentFile::open(final_path, window)?);
        let min_ts = seg.entries.iter().map(|e| e.start_time).min().unwrap_or(window);
        {
            let mut st = self.state.write()?;
            st.segments.insert(window, seg);
            // Sealed data older than a tier watermark forces that tier to
            // recompute from the affected bucket onward.
            for t in 0..st.watermarks.len() {
                if min_ts < st.watermarks[t] {
                    st.redo[t] = st.redo[t].min(min_ts);
                }
            }
        }
        Ok(())
    }

    /// All raw points of one series within `[from, to)`, ascending.
    /// Damaged segments are counted and skipped rather than failing the read.
    pub fn read_raw_series(
        &self,
        series_id: SeriesId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<(Timestamp, Value)>, StoreError> {
        let segments = self.overlapping_segments(from, to)?;
        let mut out = Vec::new();
        for seg in segments {
            match seg.read_series(series_id, from, to) {
                Ok(mut points) => out.append(&mut points),
                Err(StoreError::CorruptSegment(_)) => {
                    self.corruption_count.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// All raw points of every series within `[from, to)`, grouped by series.
    pub fn scan_raw(
        &self,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<HashMap<SeriesId, Vec<(Timestamp, Value)>>, StoreError> {
        let segments = self.overlapping_segments(from, to)?;
        let mut out: HashMap<SeriesId, Vec<(Timestamp, Value)>> = HashMap::new();
        for seg in segments {
            for entry in &seg.entries {
                if entry.end_time < from || entry.start_time >= to {
                    continue;
                }
                match seg.read_entry(entry) {
                    Ok(points) => {
                        let dst = out.entry(entry.series_id).or_default();
                        dst.extend(points.into_iter().filter(|p| p.0 >= from && p.0 < to));
                    }
                    Err(StoreError::CorruptSegment(_)) => {
                        self.corruption_count.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        for points in out.values_mut() {
            points.sort_by_key(|p| p.0);
        }
        Ok(out)
    }

    /// Newest sealed point for a series at or before `at`.
    pub fn latest_raw(
        &self,
        series_id: SeriesId,
        at: Timestamp,
    ) -> Result<Option<(Timestamp, Value)>, StoreError> {
        let segments: Vec<Arc<SegmentFile>> = {
            let st = self.state.read()?;
            st.segments.values().rev().cloned().collect()
        };
        for seg in segments {
            if seg.window > at {
                continue;
            }
            match seg.read_series(series_id, i64::MIN, at.saturating_add(1)) {
                Ok(points) => {
                    if let Some(&last) = points.last() {
                        return Ok(Some(last));
                    }
                }
                Err(StoreError::CorruptSegment(_)) => {
                    self.corruption_count.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn overlapping_segments(
        &self,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Arc<SegmentFile>>, StoreError> {
        let st = self.state.read()?;
        Ok(st
            .segments
            .values()
            .filter(|seg| seg.window < to && seg.window + self.window_duration > from)
            .cloned()
            .collect())
    }

    /// Sorted list of sealed window starts.
    pub fn sealed_windows(&self) -> Vec<Timestamp> {
        self.state
            .read()
            .map(|st| st.segments.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Total points across sealed segment indexes.
    pub fn sealed_point_count(&self) -> u64 {
        self.state
            .read()
            .map(|st| {
                st.segments
                    .values()
                    .flat_map(|s| s.entries.iter().map(|e| e.point_count as u64))
                    .sum()
            })
            .unwrap_or(0)
    }

    // --- tier chunks ---

    /// Live index entries for one series overlapping `[from, to)`.
    pub fn chunk_entries(
        &self,
        tier: usize,
        series_id: SeriesId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<ChunkIndexEntry>, StoreError> {
        let st = self.state.read()?;
        let index = &st.tiers[tier].index;
        let lo = index.partition_point(|e| e.series_id < series_id);
        Ok(index[lo..]
            .iter()
            .take_while(|e| e.series_id == series_id)
            .filter(|e| e.chunk_end > from && e.chunk_start < to)
            .copied()
            .collect())
    }

    /// Live index entries across all series overlapping `[from, to)`.
    pub fn chunk_entries_all(
        &self,
        tier: usize,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<ChunkIndexEntry>, StoreError> {
        let st = self.state.read()?;
        Ok(st.tiers[tier]
            .index
            .iter()
            .filter(|e| e.chunk_end > from && e.chunk_start < to)
            .copied()
            .collect())
    }

    /// The stored blob for an exact `(series, chunk_start)` pair, if any.
    pub fn read_chunk(
        &self,
        tier: usize,
        series_id: SeriesId,
        chunk_start: Timestamp,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let entry = {
            let st = self.state.read()?;
            let index = &st.tiers[tier].index;
            let lo = index.partition_point(|e| {
                (e.series_id, e.chunk_start) < (series_id, chunk_start)
            });
            match index.get(lo) {
                Some(e) if e.series_id == series_id && e.chunk_start == chunk_start => *e,
                _ => return Ok(None),
            }
        };
        self.read_chunk_blob(tier, &entry).map(Some)
    }

    /// Reads a chunk blob through the tier's mapping, remapping if the file
    /// has grown past the cached map.
    pub fn read_chunk_blob(
        &self,
        tier: usize,
        entry: &ChunkIndexEntry,
    ) -> Result<Vec<u8>, StoreError> {
        let end = entry.offset + entry.length as u64;
        let map = self.tier_map(tier, end)?;
        if end > map.len() as u64 {
            self.corruption_count.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::CorruptChunk(format!(
                "Chunk entry beyond data file (offset {} len {})",
                entry.offset, entry.length
            )));
        }
        Ok(map[entry.offset as usize..end as usize].to_vec())
    }

    fn tier_map(&self, tier: usize, need_end: u64) -> Result<Arc<Mmap>, StoreError> {
        {
            let st = self.state.read()?;
            if let Some(map) = &st.tiers[tier].map {
                if map.len() as u64 >= need_end {
                    return Ok(Arc::clone(map));
                }
            }
        }
        let mut st = self.state.write()?;
        if let Some(map) = &st.tiers[tier].map {
            if map.len() as u64 >= need_end {
                return Ok(Arc::clone(map));
            }
        }
        let path = st.tiers[tier].dir.join("chunks.dat");
        let file = File::open(&path)?;
        let map = Arc::new(unsafe { Mmap::map(&file)? });
        st.tiers[tier].map = Some(Arc::clone(&map));
        Ok(map)
    }

    /// Appends new/updated chunk blobs and atomically installs the rewritten
    /// index. Superseded blobs become dead space until compaction.
    pub fn write_chunks(
        &self,
        tier: usize,
        writes: Vec<(SeriesId, Timestamp, Timestamp, Vec<u8>)>,
    ) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        let (data_path, mut offset) = {
            let st = self.state.read()?;
            (st.tiers[tier].dir.join("chunks.dat"), st.tiers[tier].data_len)
        };

        let file = OpenOptions::new().create(true).append(true).open(&data_path)?;
        let mut w = BufWriter::new(file);
        let mut new_entries = Vec::with_capacity(writes.len());
        for (series_id, chunk_start, chunk_end, blob) in &writes {
            w.write_all(blob)?;
            new_entries.push(ChunkIndexEntry {
                series_id: *series_id,
                chunk_start: *chunk_start,
                chunk_end: *chunk_end,
                offset,
                length: blob.len() as u32,
                flags: 0,
            });
            offset += blob.len() as u64;
        }
        w.flush()?;
        w.get_ref().sync_data()?;
        drop(w);

        let mut st = self.state.write()?;
        let tf = &mut st.tiers[tier];
        for entry in new_entries {
            let pos = tf.index.partition_point(|e| {
                (e.series_id, e.chunk_start) < (entry.series_id, entry.chunk_start)
            });
            match tf.index.get(pos) {
                Some(old)
                    if old.series_id == entry.series_id && old.chunk_start == entry.chunk_start =>
                {
                    tf.dead_bytes += old.length as u64;
                    tf.index[pos] = entry;
                }
                _ => tf.index.insert(pos, entry),
            }
        }
        tf.data_len = offset;
        write_chunk_index(&tf.dir, &tf.index)?;
        Ok(())
    }

    /// Rewrites the tier's data file without dead space when the trigger is
    /// crossed. Returns whether a compaction ran.
    pub fn maybe_compact_tier(&self, tier: usize) -> Result<bool, StoreError> {
        {
            let st = self.state.read()?;
            let tf = &st.tiers[tier];
            if tf.data_len == 0
                || (tf.dead_bytes as f64) / (tf.data_len as f64) < COMPACTION_DEAD_RATIO
            {
                return Ok(false);
            }
        }
        self.compact_tier(tier)?;
        Ok(true)
    }

    pub fn compact_tier(&self, tier: usize) -> Result<(), StoreError> {
        let mut st = self.state.write()?;
        let tf = &mut st.tiers[tier];
        let data_path = tf.dir.join("chunks.dat");
        let data_tmp = tf.dir.join("chunks.dat.tmp");

        let old: Vec<u8> = fs::read(&data_path).unwrap_or_default();
        let mut new_index = Vec::with_capacity(tf.index.len());
        let out = OpenOptions::new().create(true).write(true).truncate(true).open(&data_tmp)?;
        let mut w = BufWriter::new(out);
        let mut offset = 0u64;
        for e in &tf.index {
            let end = e.offset + e.length as u64;
            if end > old.len() as u64 {
                self.corruption_count.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            w.write_all(&old[e.offset as usize..end as usize])?;
            new_index.push(ChunkIndexEntry { offset, ..*e });
            offset += e.length as u64;
        }
        w.flush()?;
        w.get_ref().sync_data()?;
        drop(w);

        fs::rename(&data_tmp, &data_path)?;
        sync_dir(&tf.dir)?;

        tf.index = new_index;
        tf.data_len = offset;
        tf.dead_bytes = 0;
        tf.map = None;
        tf.generation += 1;
        write_chunk_index(&tf.dir, &tf.index)?;
        Ok(())
    }

    // --- watermarks and rollup bookkeeping ---

    pub fn watermark(&self, tier: usize) -> Timestamp {
        self.state.read().map(|st| st.watermarks[tier]).unwrap_or(0)
    }

    /// Advances a tier watermark (never decreases) and fsyncs the file.
    pub fn set_watermark(&self, tier: usize, wm: Timestamp) -> Result<(), StoreError> {
        let mut st = self.state.write()?;
        if wm <= st.watermarks[tier] {
            return Ok(());
        }
        st.watermarks[tier] = wm;
        let path = self.dir.join("watermarks.bin");
        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.seek(SeekFrom::Start(tier as u64 * 8))?;
        file.write_all(&wm.to_le_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Takes the pending recompute low-water mark for a tier, if any.
    pub fn take_redo(&self, tier: usize) -> Option<Timestamp> {
        let mut st = self.state.write().ok()?;
        let redo = st.redo[tier];
        st.redo[tier] = i64::MAX;
        (redo != i64::MAX).then_some(redo)
    }

    pub fn restore_redo(&self, tier: usize, from: Timestamp) {
        if let Ok(mut st) = self.state.write() {
            st.redo[tier] = st.redo[tier].min(from);
        }
    }

    // --- retention ---

    pub fn apply_retention(
        &self,
        now: Timestamp,
        raw_retention: Option<i64>,
    ) -> Result<RetentionStats, StoreError> {
        let mut stats = RetentionStats::default();

        if let Some(raw_ret) = raw_retention {
            let cutoff = now - raw_ret;
            let expired: Vec<(Timestamp, PathBuf)> = {
                let st = self.state.read()?;
                st.segments
                    .values()
                    .filter(|s| s.window + self.window_duration <= cutoff)
                    .map(|s| (s.window, s.path.clone()))
                    .collect()
            };
            if !expired.is_empty() {
                let mut st = self.state.write()?;
                for (w, _) in &expired {
                    st.segments.remove(w);
                }
                drop(st);
                for (_, path) in expired {
                    let _ = fs::remove_file(path);
                    stats.removed_segments += 1;
                }
                sync_dir(&self.raw_dir)?;
            }
        }

        for (t, tier) in self.tiers.iter().enumerate() {
            let Some(ret) = tier.retention else { continue };
            let cutoff = now - ret;
            let dropped = {
                let mut st = self.state.write()?;
                let tf = &mut st.tiers[t];
                let before = tf.index.len();
                let mut freed = 0u64;
                tf.index.retain(|e| {
                    // Chunks straddling the cutoff stay until fully expired.
                    if e.chunk_end <= cutoff {
                        freed += e.length as u64;
                        false
                    } else {
                        true
                    }
                });
                let dropped = before - tf.index.len();
                if dropped > 0 {
                    tf.dead_bytes += freed;
                    write_chunk_index(&tf.dir, &tf.index)?;
                }
                dropped
            };
            stats.dropped_chunks += dropped;
            if dropped > 0 && self.maybe_compact_tier(t)? {
                stats.compacted_tiers += 1;
            }
        }
        Ok(stats)
    }

    // --- accounting ---

    pub fn storage_bytes(&self) -> u64 {
        fn walk(dir: &Path) -> u64 {
            let mut total = 0;
            if let Ok(rd) = fs::read_dir(dir) {
                for entry in rd.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        total += walk(&path);
                    } else if let Ok(meta) = entry.metadata() {
                        total += meta.len();
                    }
                }
            }
            total
        }
        walk(&self.dir)
    }

    pub fn corruption_count(&self) -> u64 {
        self.corruption_count.load(Ordering::Relaxed)
    }

    pub fn note_corruption(&self) {
        self.corruption_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn watermarks(&self) -> Vec<Timestamp> {
        self.state.read().map(|st| st.watermarks.clone()).unwrap_or_default()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }
}

impl SegmentFile {
    fn open(path: PathBuf, window: Timestamp) -> Result<Self, StoreError> {
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        if len < SEG_HEADER_LEN + SEG_FOOTER_LEN {
            return Err(StoreError::CorruptSegment(format!(
                "Truncated segment file {:?}",
                path
            )));
        }
        let mmap = unsafe { Mmap::map(&file)? };
        if &mmap[..2] != SEG_MAGIC {
            return Err(StoreError::CorruptSegment(format!("Bad segment magic in {:?}", path)));
        }
        if mmap[2] != SEG_VERSION {
            return Err(StoreError::CorruptSegment(format!(
                "Unsupported segment version {} in {:?}",
                mmap[2], path
            )));
        }
        let declared = u32::from_le_bytes(mmap[3..7].try_into().unwrap()) as u64;

        let footer_off = (len - SEG_FOOTER_LEN) as usize;
        let index_offset = u64::from_le_bytes(mmap[footer_off..footer_off + 8].try_into().unwrap());
        if index_offset < SEG_HEADER_LEN || index_offset > len - SEG_FOOTER_LEN {
            return Err(StoreError::CorruptSegment(format!(
                "Segment index offset out of bounds in {:?}",
                path
            )));
        }
        let index_bytes = len - SEG_FOOTER_LEN - index_offset;
        if index_bytes % SEG_INDEX_ENTRY_LEN != 0 {
            return Err(StoreError::CorruptSegment(format!(
                "Segment index length not a multiple of entry size in {:?}",
                path
            )));
        }
        let count = index_bytes / SEG_INDEX_ENTRY_LEN;
        if count != declared {
            return Err(StoreError::CorruptSegment(format!(
                "Segment index count {} does not match header {} in {:?}",
                count, declared, path
            )));
        }

        let mut entries = Vec::with_capacity(count as usize);
        let mut off = index_offset as usize;
        for _ in 0..count {
            let series_id = i64::from_le_bytes(mmap[off..off + 8].try_into().unwrap()) as u64;
            let start_time = i64::from_le_bytes(mmap[off + 8..off + 16].try_into().unwrap());
            let end_time = i64::from_le_bytes(mmap[off + 16..off + 24].try_into().unwrap());
            let point_count = u32::from_le_bytes(mmap[off + 24..off + 28].try_into().unwrap());
            let offset = u64::from_le_bytes(mmap[off + 28..off + 36].try_into().unwrap());
            let length = u32::from_le_bytes(mmap[off + 36..off + 40].try_into().unwrap());
            if offset + length as u64 > index_offset {
                return Err(StoreError::CorruptSegment(format!(
                    "Segment entry beyond data region in {:?}",
                    path
                )));
            }
            entries.push(SegIndexEntry {
                series_id,
                start_time,
                end_time,
                point_count,
                offset,
                length,
            });
            off += SEG_INDEX_ENTRY_LEN as usize;
        }

        Ok(SegmentFile { window, path, mmap, entries })
    }

    fn read_entry(&self, entry: &SegIndexEntry) -> Result<Vec<(Timestamp, Value)>, StoreError> {
        let start = entry.offset as usize;
        let end = start + entry.length as usize;
        decompress_points(&self.mmap[start..end], entry.point_count as usize)
    }

    fn read_series(
        &self,
        series_id: SeriesId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<(Timestamp, Value)>, StoreError> {
        let lo = self.entries.partition_point(|e| e.series_id < series_id);
        let mut out = Vec::new();
        for entry in self.entries[lo..].iter().take_while(|e| e.series_id == series_id) {
            if entry.end_time < from || entry.start_time >= to {
                continue;
            }
            let points = self.read_entry(entry)?;
            out.extend(points.into_iter().filter(|p| p.0 >= from && p.0 < to));
        }
        Ok(out)
    }
}

// --- file helpers ---

fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    let d = File::open(dir)?;
    d.sync_data()?;
    Ok(())
}

fn load_chunk_index(path: &Path) -> Result<Vec<ChunkIndexEntry>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() as u64 % CHUNK_INDEX_ENTRY_LEN != 0 {
        return Err(StoreError::CorruptChunk(format!(
            "Chunk index {:?} has a torn tail",
            path
        )));
    }
    let mut out = Vec::with_capacity(bytes.len() / CHUNK_INDEX_ENTRY_LEN as usize);
    let mut off = 0;
    while off < bytes.len() {
        out.push(ChunkIndexEntry {
            series_id: i64::from_le_bytes(bytes[off..off + 8].try_into().unwrap()) as u64,
            chunk_start: i64::from_le_bytes(bytes[off + 8..off + 16].try_into().unwrap()),
            chunk_end: i64::from_le_bytes(bytes[off + 16..off + 24].try_into().unwrap()),
            offset: u64::from_le_bytes(bytes[off + 24..off + 32].try_into().unwrap()),
            length: u32::from_le_bytes(bytes[off + 32..off + 36].try_into().unwrap()),
            flags: u32::from_le_bytes(bytes[off + 36..off + 40].try_into().unwrap()),
        });
        off += CHUNK_INDEX_ENTRY_LEN as usize;
    }
    out.sort_by_key(|e| (e.series_id, e.chunk_start));
    Ok(out)
}

fn write_chunk_index(dir: &Path, index: &[ChunkIndexEntry]) -> Result<(), StoreError> {
    let tmp = dir.join("index.bin.tmp");
    let final_path = dir.join("index.bin");
    let file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
    let mut w = BufWriter::new(file);
    for e in index {
        w.write_all(&(e.series_id as i64).to_le_bytes())?;
        w.write_all(&e.chunk_start.to_le_bytes())?;
        w.write_all(&e.chunk_end.to_le_bytes())?;
        w.write_all(&e.offset.to_le_bytes())?;
        w.write_all(&e.length.to_le_bytes())?;
        w.write_all(&e.flags.to_le_bytes())?;
    }
    w.flush()?;
    w.get_ref().sync_data()?;
    drop(w);
    fs::rename(&tmp, &final_path)?;
    sync_dir(dir)?;
    Ok(())
}

fn read_watermarks(path: &Path, tiers: usize) -> Result<Vec<Timestamp>, StoreError> {
    let mut out = vec![0i64; tiers];
    match fs::read(path) {
        Ok(bytes) => {
            for (t, wm) in out.iter_mut().enumerate() {
                let off = t * 8;
                if off + 8 <= bytes.len() {
                    *wm = i64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
                }
            }
            // A schema that grew tiers needs the file extended with zeros.
            if bytes.len() < tiers * 8 {
                write_watermarks_file(path, &out)?;
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            write_watermarks_file(path, &out)?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(out)
}

fn write_watermarks_file(path: &Path, watermarks: &[Timestamp]) -> Result<(), StoreError> {
    let mut file = OpenOptions::new().create(true).write(true).open(path)?;
    for wm in watermarks {
        file.write_all(&wm.to_le_bytes())?;
    }
    file.sync_data()?;
    Ok(())
}

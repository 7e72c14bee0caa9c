//! Core store handle: configuration, the per-shard worker threads, and the
//! public write/query/info API.
//!
//! Each shard owns a write buffer, a segment builder and a shard store, all
//! serviced by one worker thread. The worker serializes sealing, WAL
//! checkpoints, rollup passes and retention for its shard, so every file is
//! single-writer; queries only ever take read-side views.

use crate::buffer::WriteBuffer;
use crate::builder::SegmentBuilder;
use crate::encoding::BlockCompression;
use crate::error::StoreError;
use crate::query::{self, Deadline, InstantSample, ShardReader};
use crate::registry::{validate_labels, validate_metric, SeriesRegistry};
use crate::rollup;
use crate::store::ShardStore;
use crate::telemetry::{noop_event_listener, store_metrics, StoreEvent, StoreEventListener};
use crate::types::{
    shard_of, window_start, Aggregate, Clock, Labels, Matcher, Point, Sample, Schema, SystemClock,
    Timestamp, Value,
};

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const STORE_MAGIC: &[u8; 8] = b"STRSTOR1";
const STORE_VERSION: u32 = 1;

/// Configuration for a [`TsStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for shards and metadata.
    pub data_dir: PathBuf,
    /// Number of write shards. Must not change for an existing store.
    pub shards: usize,
    /// Raw segment window size in seconds.
    pub segment_duration: i64,
    /// Write buffer -> builder drain cadence.
    pub flush_interval: Duration,
    /// Buffered point count that nudges an early drain.
    pub flush_threshold: usize,
    /// Hard capacity of each shard's write buffer; beyond it writes fail
    /// with `Backpressure`.
    pub buffer_capacity: usize,
    /// WAL checkpoint cadence for the open window.
    pub pending_flush_interval: Duration,
    /// Extra seconds past a window's end before it is sealed.
    pub seal_grace: i64,
    /// Cadence of rollup passes per shard.
    pub rollup_interval: Duration,
    /// Seconds held back from `now` when advancing a tier watermark.
    pub rollup_safety_margin: i64,
    /// Cadence of retention passes per shard.
    pub retention_check_interval: Duration,
    /// Raw segment retention in seconds; `None` keeps raw data forever.
    pub raw_retention: Option<i64>,
    /// Block compressor for segments, WAL payloads and tier chunks.
    pub compression: BlockCompression,
    /// Tier definitions, finest first.
    pub schema: Schema,
    /// Default deadline applied to queries; `None` disables it.
    pub query_deadline: Option<Duration>,
    /// Time source (injectable for tests).
    pub clock: Arc<dyn Clock>,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn StoreEventListener>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            data_dir: PathBuf::from("./data"),
            shards: thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            segment_duration: 14_400,
            flush_interval: Duration::from_secs(5),
            flush_threshold: 10_000,
            buffer_capacity: 40_000,
            pending_flush_interval: Duration::from_secs(60),
            seal_grace: 120,
            rollup_interval: Duration::from_secs(60),
            rollup_safety_margin: 120,
            retention_check_interval: Duration::from_secs(60),
            raw_retention: Some(7 * 86_400),
            compression: BlockCompression::default(),
            schema: Schema::default(),
            query_deadline: Some(Duration::from_secs(30)),
            clock: Arc::new(SystemClock),
            event_listener: noop_event_listener(),
        }
    }
}

/// Outcome of a batched write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchResult {
    pub accepted: usize,
    pub rejected: usize,
}

/// Snapshot of store-wide state reported by [`TsStore::info`].
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub series_count: usize,
    pub points_estimate: u64,
    pub storage_bytes_by_shard: Vec<u64>,
    pub metadata_bytes: u64,
    /// `[shard][tier]` in schema order.
    pub tier_watermarks: Vec<Vec<Timestamp>>,
    pub corruption_count: u64,
    pub paused_shards: Vec<usize>,
    pub retention_removed_segments: u64,
    pub retention_dropped_chunks: u64,
}

#[derive(Debug, Default)]
struct RetentionCounters {
    segments: AtomicU64,
    chunks: AtomicU64,
}

enum ShardCommand {
    Flush { ack: Option<mpsc::Sender<Result<(), StoreError>>> },
    Checkpoint { ack: mpsc::Sender<Result<(), StoreError>> },
    Rollup { ack: mpsc::Sender<Result<(), StoreError>> },
    Retention { ack: mpsc::Sender<Result<(), StoreError>> },
    Compact { ack: mpsc::Sender<Result<(), StoreError>> },
    Shutdown,
}

struct Shard {
    buffer: Arc<Mutex<WriteBuffer>>,
    builder: Arc<RwLock<SegmentBuilder>>,
    store: Arc<ShardStore>,
    tx: mpsc::Sender<ShardCommand>,
    handle: Option<JoinHandle<()>>,
}

/// The embedded time-series store.
#[derive(Debug)]
pub struct TsStore {
    config: StoreConfig,
    registry: Arc<SeriesRegistry>,
    shards: Vec<Shard>,
    retention_counters: Arc<RetentionCounters>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard").field("store", &self.store.shard()).finish()
    }
}

impl TsStore {
    /// Opens (or creates) a store at `config.data_dir`, recovers shard WALs
    /// into the open windows, and starts one worker thread per shard.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if config.shards == 0 {
            return Err(StoreError::Config("shards must be positive".to_string()));
        }
        if config.segment_duration <= 0 {
            return Err(StoreError::Config("segment_duration must be positive".to_string()));
        }
        config.schema.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        check_manifest(&config)?;

        let registry = Arc::new(SeriesRegistry::open(config.data_dir.join("metadata.db"))?);
        let counters = Arc::new(RetentionCounters::default());

        let mut shards = Vec::with_capacity(config.shards);
        for i in 0..config.shards {
            let store = Arc::new(ShardStore::open(
                config.data_dir.join(format!("shard_{}", i)),
                i,
                config.segment_duration,
                &config.schema.tiers,
                config.compression,
            )?);

            let mut builder = SegmentBuilder::new(config.segment_duration);
            replay_wal(&store, &mut builder, config.segment_duration);
            let builder = Arc::new(RwLock::new(builder));
            let buffer = Arc::new(Mutex::new(WriteBuffer::new(i, config.buffer_capacity)));

            let (tx, rx) = mpsc::channel();
            let ctx = WorkerCtx {
                shard: i,
                buffer: Arc::clone(&buffer),
                builder: Arc::clone(&builder),
                store: Arc::clone(&store),
                schema: config.schema.clone(),
                clock: Arc::clone(&config.clock),
                events: Arc::clone(&config.event_listener),
                counters: Arc::clone(&counters),
                seal_grace: config.seal_grace,
                pending_flush_interval: config.pending_flush_interval,
                rollup_interval: config.rollup_interval,
                rollup_safety_margin: config.rollup_safety_margin,
                retention_check_interval: config.retention_check_interval,
                raw_retention: config.raw_retention,
            };
            let tick = config.flush_interval;
            let handle = thread::Builder::new()
                .name(format!("strata-shard-{}", i))
                .spawn(move || worker_loop(ctx, rx, tick))
                .map_err(|e| StoreError::BackgroundTask(format!("spawn failed: {}", e)))?;

            shards.push(Shard { buffer, builder, store, tx, handle: Some(handle) });
        }

        Ok(TsStore { config, registry, shards, retention_counters: counters })
    }

    /// Writes one sample. Fails fast on invalid input, a paused shard, or a
    /// full write buffer.
    pub fn write(
        &self,
        metric: &str,
        labels: &Labels,
        value: Value,
        ts: Timestamp,
    ) -> Result<(), StoreError> {
        validate_metric(metric)?;
        validate_labels(labels)?;
        if value.is_nan() {
            return Err(StoreError::InvalidInput("value must not be NaN".to_string()));
        }
        if ts <= 0 {
            return Err(StoreError::InvalidInput("timestamp must be positive".to_string()));
        }

        let id = self.registry.get_or_create(metric, labels, self.config.clock.now())?;
        let shard_idx = shard_of(id, self.shards.len());
        let shard = &self.shards[shard_idx];
        if shard.store.is_paused() {
            return Err(StoreError::ShardPaused(shard_idx));
        }

        let len = shard
            .buffer
            .lock()?
            .stage(Point { series_id: id, timestamp: ts, value })?;
        store_metrics::record_ingest_points(1);
        if len == self.config.flush_threshold {
            let _ = shard.tx.send(ShardCommand::Flush { ack: None });
        }
        Ok(())
    }

    /// Writes a batch, counting per-sample successes and failures.
    pub fn write_batch(&self, samples: &[Sample]) -> BatchResult {
        let mut result = BatchResult { accepted: 0, rejected: 0 };
        for s in samples {
            match self.write(&s.metric, &s.labels, s.value, s.timestamp) {
                Ok(()) => result.accepted += 1,
                Err(_) => result.rejected += 1,
            }
        }
        result
    }

    /// Range query: re-aggregated `(bucket_start, value)` pairs on a step
    /// grid anchored at `from`, combined across all matching series.
    pub fn query_range(
        &self,
        metric: &str,
        matchers: &[Matcher],
        from: Timestamp,
        to: Timestamp,
        step: i64,
        aggregator: Aggregate,
    ) -> Result<Vec<(Timestamp, Value)>, StoreError> {
        let deadline = self
            .config
            .query_deadline
            .map(Deadline::after)
            .unwrap_or_else(Deadline::none);
        self.query_range_with_deadline(metric, matchers, from, to, step, aggregator, deadline)
    }

    /// Range query with an explicit deadline.
    #[allow(clippy::too_many_arguments)]
    pub fn query_range_with_deadline(
        &self,
        metric: &str,
        matchers: &[Matcher],
        from: Timestamp,
        to: Timestamp,
        step: i64,
        aggregator: Aggregate,
        deadline: Deadline,
    ) -> Result<Vec<(Timestamp, Value)>, StoreError> {
        let started = Instant::now();
        let out = query::query_range(
            &self.registry,
            &self.shard_readers(),
            &self.config.schema,
            metric,
            matchers,
            from,
            to,
            step,
            aggregator,
            self.config.clock.now(),
            deadline,
        );
        store_metrics::record_query(started.elapsed());
        out
    }

    /// Latest value per matching series, at or before `at` (defaults to the
    /// newest point in the store).
    pub fn query_instant(
        &self,
        metric: &str,
        matchers: &[Matcher],
        at: Option<Timestamp>,
    ) -> Result<Vec<InstantSample>, StoreError> {
        let deadline = self
            .config
            .query_deadline
            .map(Deadline::after)
            .unwrap_or_else(Deadline::none);
        let started = Instant::now();
        let out = query::query_instant(
            &self.registry,
            &self.shard_readers(),
            &self.config.schema,
            metric,
            matchers,
            at,
            deadline,
        );
        store_metrics::record_query(started.elapsed());
        out
    }

    pub fn list_metrics(&self) -> Result<Vec<String>, StoreError> {
        self.registry.list_metrics()
    }

    pub fn list_label_values(&self, name: &str) -> Result<Vec<String>, StoreError> {
        self.registry.list_label_values(name)
    }

    pub fn list_series(&self, metric: &str) -> Result<Vec<Labels>, StoreError> {
        self.registry.list_series(metric)
    }

    /// Store-wide accounting: series, points, bytes per shard dir, tier
    /// watermarks, corruption and retention counters, paused shards.
    pub fn info(&self) -> StoreInfo {
        let mut storage = Vec::with_capacity(self.shards.len());
        let mut watermarks = Vec::with_capacity(self.shards.len());
        let mut corruption = 0;
        let mut paused = Vec::new();
        let mut points = 0u64;
        for (i, shard) in self.shards.iter().enumerate() {
            storage.push(shard.store.storage_bytes());
            watermarks.push(shard.store.watermarks());
            corruption += shard.store.corruption_count();
            if shard.store.is_paused() {
                paused.push(i);
            }
            points += shard.store.sealed_point_count();
            points += shard
                .builder
                .read()
                .map(|b| b.point_count() as u64)
                .unwrap_or(0);
            points += shard.buffer.lock().map(|b| b.len() as u64).unwrap_or(0);
        }

        StoreInfo {
            series_count: self.registry.series_count(),
            points_estimate: points,
            storage_bytes_by_shard: storage,
            metadata_bytes: fs::metadata(self.registry.path()).map(|m| m.len()).unwrap_or(0),
            tier_watermarks: watermarks,
            corruption_count: corruption,
            paused_shards: paused,
            retention_removed_segments: self.retention_counters.segments.load(Ordering::Relaxed),
            retention_dropped_chunks: self.retention_counters.chunks.load(Ordering::Relaxed),
        }
    }

    /// Drains buffers and seals every due window, waiting for completion.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.broadcast(|ack| ShardCommand::Flush { ack: Some(ack) })
    }

    /// Forces a WAL checkpoint of all open windows, waiting for completion.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        self.broadcast(|ack| ShardCommand::Checkpoint { ack })
    }

    /// Runs one rollup pass for every tier on every shard, waiting for
    /// completion.
    pub fn rollup_now(&self) -> Result<(), StoreError> {
        self.broadcast(|ack| ShardCommand::Rollup { ack })
    }

    /// Runs a retention pass on every shard, waiting for completion.
    pub fn retention_now(&self) -> Result<(), StoreError> {
        self.broadcast(|ack| ShardCommand::Retention { ack })
    }

    /// Compacts every tier chunk file, waiting for completion.
    pub fn compact(&self) -> Result<(), StoreError> {
        self.broadcast(|ack| ShardCommand::Compact { ack })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn shard_readers(&self) -> Vec<ShardReader> {
        self.shards
            .iter()
            .map(|s| ShardReader { builder: Arc::clone(&s.builder), store: Arc::clone(&s.store) })
            .collect()
    }

    fn broadcast(
        &self,
        make: impl Fn(mpsc::Sender<Result<(), StoreError>>) -> ShardCommand,
    ) -> Result<(), StoreError> {
        let mut receivers = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let (tx, rx) = mpsc::channel();
            shard
                .tx
                .send(make(tx))
                .map_err(|e| StoreError::BackgroundTask(format!("worker unreachable: {}", e)))?;
            receivers.push(rx);
        }
        for rx in receivers {
            rx.recv()
                .map_err(|e| StoreError::BackgroundTask(format!("worker ack lost: {}", e)))??;
        }
        Ok(())
    }
}

impl Drop for TsStore {
    fn drop(&mut self) {
        for shard in &self.shards {
            let _ = shard.tx.send(ShardCommand::Shutdown);
        }
        for shard in &mut self.shards {
            if let Some(handle) = shard.handle.take() {
                if handle.join().is_err() {
                    self.config
                        .event_listener
                        .on_event(StoreEvent::WorkerPanicked { shard: shard.store.shard() });
                }
            }
        }
    }
}

// --- WAL replay ---

/// Loads surviving WAL records into the builder. Records are cumulative per
/// checkpoint, so the last record per (window, series) wins.
fn replay_wal(store: &ShardStore, builder: &mut SegmentBuilder, window_duration: i64) {
    let records = match store.recover_wal() {
        Ok(r) => r,
        Err(_) => {
            store.note_corruption();
            return;
        }
    };
    let mut last: HashMap<(Timestamp, u64), crate::store::WalRecord> = HashMap::new();
    for rec in records {
        let window = window_start(rec.start_time, window_duration);
        last.insert((window, rec.series_id), rec);
    }
    for ((_, series_id), rec) in last {
        match crate::encoding::decompress_points(&rec.data, rec.point_count as usize) {
            Ok(points) => {
                let points: Vec<Point> = points
                    .into_iter()
                    .map(|(timestamp, value)| Point { series_id, timestamp, value })
                    .collect();
                builder.append(&points);
            }
            Err(_) => store.note_corruption(),
        }
    }
}

// --- manifest ---

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct TierFingerprint {
    name: String,
    resolution: i64,
    chunk_seconds: i64,
    aggregates: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestData {
    shards: u32,
    segment_duration: i64,
    tiers: Vec<TierFingerprint>,
}

fn manifest_of(config: &StoreConfig) -> ManifestData {
    ManifestData {
        shards: config.shards as u32,
        segment_duration: config.segment_duration,
        tiers: config
            .schema
            .tiers
            .iter()
            .map(|t| TierFingerprint {
                name: t.name.clone(),
                resolution: t.resolution,
                chunk_seconds: t.chunk_seconds,
                aggregates: t.aggregates.0,
            })
            .collect(),
    }
}

/// The shard count and existing tier layout are load-bearing for on-disk
/// data; any regression fails startup instead of silently misreading.
fn check_manifest(config: &StoreConfig) -> Result<(), StoreError> {
    let path = config.data_dir.join("STORE.bin");
    let new = manifest_of(config);

    if path.exists() {
        let old = read_manifest(&path)?;
        if old.shards != new.shards {
            return Err(StoreError::Config(format!(
                "store was created with {} shards, configured with {} (series placement depends on it)",
                old.shards, new.shards
            )));
        }
        if old.segment_duration != new.segment_duration {
            return Err(StoreError::Config(format!(
                "store was created with segment_duration {}, configured with {}",
                old.segment_duration, new.segment_duration
            )));
        }
        for (i, old_tier) in old.tiers.iter().enumerate() {
            match new.tiers.get(i) {
                Some(t) if t == old_tier => {}
                Some(t) => {
                    return Err(StoreError::Config(format!(
                        "tier {} changed from {:?} to {:?}",
                        i, old_tier.name, t.name
                    )))
                }
                None => {
                    return Err(StoreError::Config(format!(
                        "tier {:?} removed from schema",
                        old_tier.name
                    )))
                }
            }
        }
        if new.tiers.len() > old.tiers.len() {
            write_manifest(&path, &new)?;
        }
        return Ok(());
    }
    write_manifest(&path, &new)
}

fn read_manifest(path: &Path) -> Result<ManifestData, StoreError> {
    let mut f = File::open(path)?;
    let mut header = [0u8; 24];
    f.read_exact(&mut header)
        .map_err(|_| StoreError::Config("Truncated store manifest".to_string()))?;
    if &header[..8] != STORE_MAGIC {
        return Err(StoreError::Config("Bad store manifest magic".to_string()));
    }
    let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
    if version != STORE_VERSION {
        return Err(StoreError::Config(format!(
            "Unsupported store manifest version {}",
            version
        )));
    }
    let len = u64::from_le_bytes(header[12..20].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(header[20..24].try_into().unwrap());
    let mut buf = vec![0u8; len];
    f.read_exact(&mut buf)
        .map_err(|_| StoreError::Config("Truncated store manifest body".to_string()))?;
    let mut hasher = Crc32::new();
    hasher.update(&buf);
    if hasher.finalize() != crc {
        return Err(StoreError::Config("Store manifest CRC mismatch".to_string()));
    }
    bincode::deserialize(&buf).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn write_manifest(path: &Path, manifest: &ManifestData) -> Result<(), StoreError> {
    let bytes = bincode::serialize(manifest).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let mut hasher = Crc32::new();
    hasher.update(&bytes);
    let crc = hasher.finalize();

    let tmp = path.with_extension("bin.tmp");
    let mut w = BufWriter::new(OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?);
    w.write_all(STORE_MAGIC)?;
    w.write_all(&STORE_VERSION.to_le_bytes())?;
    w.write_all(&(bytes.len() as u64).to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(&bytes)?;
    w.flush()?;
    w.get_ref().sync_data()?;
    drop(w);
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        let d = File::open(parent)?;
        d.sync_data()?;
    }
    Ok(())
}

// --- per-shard worker ---

struct WorkerCtx {
    shard: usize,
    buffer: Arc<Mutex<WriteBuffer>>,
    builder: Arc<RwLock<SegmentBuilder>>,
    store: Arc<ShardStore>,
    schema: Schema,
    clock: Arc<dyn Clock>,
    events: Arc<dyn StoreEventListener>,
    counters: Arc<RetentionCounters>,
    seal_grace: i64,
    pending_flush_interval: Duration,
    rollup_interval: Duration,
    rollup_safety_margin: i64,
    retention_check_interval: Duration,
    raw_retention: Option<i64>,
}

fn worker_loop(ctx: WorkerCtx, rx: mpsc::Receiver<ShardCommand>, tick: Duration) {
    ctx.events.on_event(StoreEvent::WorkerStarted { shard: ctx.shard });
    let mut last_checkpoint = Instant::now();
    let mut last_rollup = Instant::now();
    let mut last_retention = Instant::now();
    let mut sealed_since_rollup = false;

    loop {
        match rx.recv_timeout(tick) {
            Ok(ShardCommand::Flush { ack }) => {
                let res = do_flush(&ctx, &mut sealed_since_rollup);
                if let Some(ack) = ack {
                    let _ = ack.send(res);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let _ = do_flush(&ctx, &mut sealed_since_rollup);
            }
            Ok(ShardCommand::Checkpoint { ack }) => {
                let _ = ack.send(do_checkpoint(&ctx));
                last_checkpoint = Instant::now();
            }
            Ok(ShardCommand::Rollup { ack }) => {
                let _ = ack.send(do_rollup(&ctx));
                last_rollup = Instant::now();
                sealed_since_rollup = false;
            }
            Ok(ShardCommand::Retention { ack }) => {
                let _ = ack.send(do_retention(&ctx));
                last_retention = Instant::now();
            }
            Ok(ShardCommand::Compact { ack }) => {
                let _ = ack.send(do_compact(&ctx));
            }
            Ok(ShardCommand::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                // Make everything buffered durable before exit; the open
                // window stays open and is recovered from the WAL next start.
                let _ = do_flush(&ctx, &mut sealed_since_rollup);
                let _ = do_checkpoint(&ctx);
                ctx.events.on_event(StoreEvent::WorkerStopping { shard: ctx.shard });
                break;
            }
        }

        // Scheduled duties, piggybacked on the tick loop. An overrunning pass
        // simply delays its next run; missed ticks are not queued.
        if last_checkpoint.elapsed() >= ctx.pending_flush_interval {
            let _ = do_checkpoint(&ctx);
            last_checkpoint = Instant::now();
        }
        if sealed_since_rollup || last_rollup.elapsed() >= ctx.rollup_interval {
            let _ = do_rollup(&ctx);
            last_rollup = Instant::now();
            sealed_since_rollup = false;
        }
        if last_retention.elapsed() >= ctx.retention_check_interval {
            let _ = do_retention(&ctx);
            last_retention = Instant::now();
        }
    }
}

fn do_flush(ctx: &WorkerCtx, sealed_since_rollup: &mut bool) -> Result<(), StoreError> {
    let points = { ctx.buffer.lock()?.drain() };
    if !points.is_empty() {
        ctx.builder.write()?.append(&points);
    }
    if ctx.store.is_paused() {
        return Ok(());
    }

    let now = ctx.clock.now();
    let due = { ctx.builder.read()?.windows_due(now, ctx.seal_grace) };
    if due.is_empty() {
        return Ok(());
    }

    let mut sealed_any = false;
    for window in due {
        let Some(batch) = ctx.builder.write()?.take_window(window) else { continue };
        let series = batch.len();
        let point_count: usize = batch.values().map(Vec::len).sum();
        let started = Instant::now();

        let mut result = Ok(());
        for attempt in 0..3 {
            result = ctx.store.seal_window(window, batch.clone());
            match &result {
                Ok(()) => break,
                Err(StoreError::Io(_)) if attempt < 2 => continue,
                Err(_) => break,
            }
        }
        match result {
            Ok(()) => {
                sealed_any = true;
                store_metrics::record_seal(started.elapsed(), point_count as u64);
                ctx.events.on_event(StoreEvent::WindowSealed { shard: ctx.shard, window, series });
            }
            Err(e) => {
                // Keep the window's points reachable in memory, then stop
                // taking writes on this shard.
                let restored: Vec<Point> = batch
                    .into_iter()
                    .flat_map(|(series_id, pts)| {
                        pts.into_iter()
                            .map(move |(timestamp, value)| Point { series_id, timestamp, value })
                    })
                    .collect();
                ctx.builder.write()?.append(&restored);
                ctx.store.pause();
                ctx.events.on_event(StoreEvent::SealFailed {
                    shard: ctx.shard,
                    window,
                    error: e.to_string(),
                });
                ctx.events.on_event(StoreEvent::ShardPaused { shard: ctx.shard });
                return Err(e);
            }
        }
    }

    if sealed_any {
        // The sealed windows' WAL records are obsolete; restart the log with
        // a fresh checkpoint of whatever is still pending.
        ctx.store.delete_wal()?;
        do_checkpoint(ctx)?;
        *sealed_since_rollup = true;
    }
    Ok(())
}

fn do_checkpoint(ctx: &WorkerCtx) -> Result<(), StoreError> {
    let records = { ctx.builder.read()?.checkpoint_records(ctx.store.compression())? };
    if records.is_empty() {
        return Ok(());
    }
    let bytes: u64 = records.iter().map(|r| r.data.len() as u64 + 36).sum();
    match ctx.store.append_wal(&records) {
        Ok(()) => {
            store_metrics::record_wal_bytes_written(bytes);
            Ok(())
        }
        Err(e) => {
            ctx.events.on_event(StoreEvent::WalCheckpointFailed {
                shard: ctx.shard,
                error: e.to_string(),
            });
            Err(e)
        }
    }
}

fn do_rollup(ctx: &WorkerCtx) -> Result<(), StoreError> {
    let now = ctx.clock.now();
    let pending_floor = { ctx.builder.read()?.min_pending_ts() };
    for (tier_idx, tier) in ctx.schema.tiers.iter().enumerate() {
        let started = Instant::now();
        match rollup::run_pass(
            &ctx.store,
            &ctx.schema.tiers,
            tier_idx,
            now,
            ctx.rollup_safety_margin,
            pending_floor,
        ) {
            Ok(Some(outcome)) => {
                store_metrics::record_rollup(started.elapsed(), outcome.buckets as u64);
                ctx.events.on_event(StoreEvent::RollupCompleted {
                    shard: ctx.shard,
                    tier: tier.name.clone(),
                    buckets: outcome.buckets,
                    advanced_to: outcome.advanced_to,
                });
            }
            Ok(None) => {}
            Err(e) => {
                ctx.events.on_event(StoreEvent::RollupFailed {
                    shard: ctx.shard,
                    tier: tier.name.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        }
    }
    Ok(())
}

fn do_retention(ctx: &WorkerCtx) -> Result<(), StoreError> {
    let now = ctx.clock.now();
    match ctx.store.apply_retention(now, ctx.raw_retention) {
        Ok(stats) => {
            if stats.removed_segments > 0 || stats.dropped_chunks > 0 {
                ctx.counters.segments.fetch_add(stats.removed_segments as u64, Ordering::Relaxed);
                ctx.counters.chunks.fetch_add(stats.dropped_chunks as u64, Ordering::Relaxed);
                ctx.events.on_event(StoreEvent::RetentionApplied {
                    shard: ctx.shard,
                    removed_segments: stats.removed_segments,
                    dropped_chunks: stats.dropped_chunks,
                });
            }
            Ok(())
        }
        Err(e) => {
            ctx.events.on_event(StoreEvent::RetentionFailed {
                shard: ctx.shard,
                error: e.to_string(),
            });
            Err(e)
        }
    }
}

fn do_compact(ctx: &WorkerCtx) -> Result<(), StoreError> {
    for (tier_idx, tier) in ctx.schema.tiers.iter().enumerate() {
        ctx.store.compact_tier(tier_idx)?;
        ctx.events.on_event(StoreEvent::CompactionCompleted {
            shard: ctx.shard,
            tier: tier.name.clone(),
        });
    }
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly is not acceptable for
/// production. Callers provide an implementation that forwards these events
/// to `tracing`, `log`, metrics, or custom sinks.
pub trait StoreEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: StoreEvent);
}

/// Structured events emitted by the core.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    WorkerStarted { shard: usize },
    WorkerStopping { shard: usize },
    WorkerPanicked { shard: usize },

    WindowSealed { shard: usize, window: i64, series: usize },
    SealFailed { shard: usize, window: i64, error: String },
    WalCheckpointFailed { shard: usize, error: String },

    RollupCompleted { shard: usize, tier: String, buckets: usize, advanced_to: i64 },
    RollupFailed { shard: usize, tier: String, error: String },

    RetentionApplied { shard: usize, removed_segments: usize, dropped_chunks: usize },
    RetentionFailed { shard: usize, error: String },
    CompactionCompleted { shard: usize, tier: String },

    CorruptionDetected { path: PathBuf, detail: String },
    ShardPaused { shard: usize },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl StoreEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: StoreEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn StoreEventListener> {
    Arc::new(NoopEventListener)
}

/// Metrics instrumentation and in-process scraping.
///
/// ## Key properties
/// - Library-safe: recording is effectively a no-op until a recorder is installed.
/// - Serverless scraping: callers can render Prometheus exposition text in-process.
/// - Low operational overhead: a lightweight upkeep thread keeps histograms bounded.
pub mod store_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // Counters are exposed as `<name>_total` by the Prometheus exporter;
    // histograms as `<name>_bucket`, `<name>_sum`, `<name>_count`.

    pub const INGEST_POINTS: &str = "strata_ingest_points";
    pub const SEAL_POINTS: &str = "strata_seal_points";
    pub const SEAL_DURATION_SECONDS: &str = "strata_seal_duration_seconds";

    pub const WAL_BYTES_WRITTEN: &str = "strata_wal_bytes_written";

    pub const ROLLUP_BUCKETS: &str = "strata_rollup_buckets";
    pub const ROLLUP_DURATION_SECONDS: &str = "strata_rollup_duration_seconds";

    pub const QUERY_DURATION_SECONDS: &str = "strata_query_duration_seconds";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts
        /// a small upkeep thread for exporter internals.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("strata-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_ingest_points(points: u64) {
        if points > 0 {
            ::metrics::counter!(INGEST_POINTS).increment(points);
        }
    }

    #[inline]
    pub fn record_seal(duration: Duration, points: u64) {
        ::metrics::histogram!(SEAL_DURATION_SECONDS).record(duration.as_secs_f64());
        if points > 0 {
            ::metrics::counter!(SEAL_POINTS).increment(points);
        }
    }

    #[inline]
    pub fn record_wal_bytes_written(bytes: u64) {
        if bytes > 0 {
            ::metrics::counter!(WAL_BYTES_WRITTEN).increment(bytes);
        }
    }

    #[inline]
    pub fn record_rollup(duration: Duration, buckets: u64) {
        ::metrics::histogram!(ROLLUP_DURATION_SECONDS).record(duration.as_secs_f64());
        if buckets > 0 {
            ::metrics::counter!(ROLLUP_BUCKETS).increment(buckets);
        }
    }

    #[inline]
    pub fn record_query(duration: Duration) {
        ::metrics::histogram!(QUERY_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    fn describe_all() {
        describe_counter!(
            INGEST_POINTS,
            Unit::Count,
            "Total number of points accepted by the write API."
        );
        describe_counter!(
            SEAL_POINTS,
            Unit::Count,
            "Total number of points sealed into segment files."
        );
        describe_counter!(
            WAL_BYTES_WRITTEN,
            Unit::Bytes,
            "Total number of logical bytes appended to shard WALs."
        );
        describe_counter!(
            ROLLUP_BUCKETS,
            Unit::Count,
            "Total number of tier buckets written by rollup passes."
        );

        describe_histogram!(
            SEAL_DURATION_SECONDS,
            Unit::Seconds,
            "Time to build, fsync and install one sealed segment file."
        );
        describe_histogram!(
            ROLLUP_DURATION_SECONDS,
            Unit::Seconds,
            "Duration of one rollup pass for one tier on one shard."
        );
        describe_histogram!(
            QUERY_DURATION_SECONDS,
            Unit::Seconds,
            "End-to-end range/instant query latency."
        );
    }
}

//! Production daemon for the strata time-series store.
//!
//! Loads configuration from (in precedence order): defaults, config file,
//! environment variables (`STRATA_*`), and CLI flags. Opens the store (which
//! recovers shard WALs), serves health/readiness endpoints, and runs until
//! graceful shutdown (SIGINT/SIGTERM).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use std::convert::Infallible;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use clap::Parser;
use config::{Config, Environment, File};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::graceful::GracefulShutdown;
use strata::{BlockCompression, Schema, StoreConfig, TierSpec, TsStore};

// ---------- CLI ----------

/// strata time-series store daemon.
#[derive(Parser, Debug)]
#[command(name = "stratad", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, no file is loaded unless the default path exists.
    #[arg(long, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override data directory (shards, WALs, tier chunks, metadata).
    #[arg(long, env = "STRATA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config, print the effective settings, then exit without opening the store.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// HTTP listen address for health/readiness endpoints (e.g. 127.0.0.1:8080).
    #[arg(long, env = "STRATA_HTTP_BIND")]
    pub http_bind: Option<String>,
}

// ---------- File/env config (all optional for partial config) ----------

/// One tier in the config file: `[[schema]]` tables with
/// `name = "hourly", resolution_secs = 3600, buckets_per_chunk = 24`.
#[derive(Debug, serde::Deserialize)]
pub struct TierFileConfig {
    pub name: String,
    pub resolution_secs: i64,
    pub buckets_per_chunk: i64,
    pub retention_secs: Option<i64>,
}

/// Top-level daemon config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct DaemonFileConfig {
    /// HTTP listen address for /healthz and /readyz.
    pub http_bind: Option<String>,
    pub data_dir: Option<String>,
    pub shards: Option<usize>,
    pub segment_duration_secs: Option<i64>,
    pub flush_interval_secs: Option<u64>,
    pub flush_threshold: Option<usize>,
    pub buffer_capacity: Option<usize>,
    pub pending_flush_interval_secs: Option<u64>,
    pub seal_grace_secs: Option<i64>,
    pub rollup_interval_secs: Option<u64>,
    pub rollup_safety_margin_secs: Option<i64>,
    pub retention_check_interval_secs: Option<u64>,
    pub raw_retention_secs: Option<i64>,
    pub query_deadline_secs: Option<u64>,
    /// Table form in TOML: `[compression]` with `type = "zstd", level = 3`.
    pub compression: Option<BlockCompression>,
    pub schema: Option<Vec<TierFileConfig>>,
}

/// Runtime options for the daemon derived from config + env + CLI.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Address to bind the HTTP health/readiness server.
    pub http_bind: SocketAddr,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            http_bind: "127.0.0.1:8080".parse().expect("default http_bind"),
        }
    }
}

fn parse_http_bind(s: &str) -> Result<SocketAddr, String> {
    s.parse::<SocketAddr>()
        .map_err(|e| format!("invalid http_bind {:?}: {}", s, e))
}

/// Load merged config and daemon options. CLI overrides file/env for both.
fn load_daemon_config(cli: &Cli) -> Result<(StoreConfig, DaemonOptions), String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from("stratad.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("STRATA")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: DaemonFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut store_config = StoreConfig::default();
    merge_into_store_config(&mut store_config, &partial);

    if let Some(ref d) = cli.data_dir {
        store_config.data_dir = d.clone();
    }

    let http_bind_str = cli
        .http_bind
        .as_deref()
        .or(partial.http_bind.as_deref())
        .unwrap_or("127.0.0.1:8080");
    let http_bind = parse_http_bind(http_bind_str)?;

    Ok((store_config, DaemonOptions { http_bind }))
}

/// Merge file/env partial config onto `StoreConfig`. Only overwrites fields that are `Some`.
fn merge_into_store_config(base: &mut StoreConfig, partial: &DaemonFileConfig) {
    if let Some(s) = &partial.data_dir {
        base.data_dir = PathBuf::from(s);
    }
    if let Some(n) = partial.shards {
        base.shards = n;
    }
    if let Some(secs) = partial.segment_duration_secs {
        base.segment_duration = secs;
    }
    if let Some(secs) = partial.flush_interval_secs {
        base.flush_interval = Duration::from_secs(secs);
    }
    if let Some(n) = partial.flush_threshold {
        base.flush_threshold = n;
    }
    if let Some(n) = partial.buffer_capacity {
        base.buffer_capacity = n;
    }
    if let Some(secs) = partial.pending_flush_interval_secs {
        base.pending_flush_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = partial.seal_grace_secs {
        base.seal_grace = secs;
    }
    if let Some(secs) = partial.rollup_interval_secs {
        base.rollup_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = partial.rollup_safety_margin_secs {
        base.rollup_safety_margin = secs;
    }
    if let Some(secs) = partial.retention_check_interval_secs {
        base.retention_check_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = partial.raw_retention_secs {
        base.raw_retention = (secs > 0).then_some(secs);
    }
    if let Some(secs) = partial.query_deadline_secs {
        base.query_deadline = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(c) = partial.compression {
        base.compression = c;
    }
    if let Some(tiers) = &partial.schema {
        base.schema = Schema {
            tiers: tiers
                .iter()
                .map(|t| {
                    TierSpec::new(&t.name, t.resolution_secs, t.buckets_per_chunk, t.retention_secs)
                })
                .collect(),
        };
    }
}

// ---------- Safe startup checks ----------

/// Ensures `data_dir` exists and is writable. Returns an error message on failure.
fn check_data_dir_writable(data_dir: &std::path::Path) -> Result<(), String> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| format!("data_dir {} cannot be created: {}", data_dir.display(), e))?;
    let probe = data_dir.join(".strata_write_probe");
    std::fs::write(&probe, b"")
        .map_err(|e| format!("data_dir {} not writable: {}", data_dir.display(), e))?;
    let _ = std::fs::remove_file(probe);
    Ok(())
}

// ---------- Health HTTP server ----------

/// Shared state for the health service (readiness flag only).
struct HealthState {
    ready: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

async fn health_service(
    state: std::sync::Arc<HealthState>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (status, body) = match (req.method(), req.uri().path()) {
        (&hyper::Method::GET, "/healthz") => {
            // Liveness: process is alive and responding.
            (hyper::StatusCode::OK, Bytes::from("ok"))
        }
        (&hyper::Method::GET, "/readyz") => {
            // Readiness: store opened and recovered; safe to send traffic.
            if state.ready.load(Ordering::Acquire) {
                (hyper::StatusCode::OK, Bytes::from("ok"))
            } else {
                (
                    hyper::StatusCode::SERVICE_UNAVAILABLE,
                    Bytes::from("not ready"),
                )
            }
        }
        _ => (hyper::StatusCode::NOT_FOUND, Bytes::from("not found")),
    };
    Ok(Response::builder()
        .status(status)
        .body(Full::new(body))
        .expect("response build"))
}

/// Returns a future that completes when SIGINT (Ctrl+C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("ctrl_c handler");
    };
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

/// Runs the daemon: spawns the health HTTP server, waits for the shutdown
/// signal, then flushes the store and drops it (sealing due windows and
/// checkpointing the WALs).
async fn run_with_health_server(
    store: TsStore,
    options: DaemonOptions,
    ready: std::sync::Arc<std::sync::atomic::AtomicBool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(options.http_bind)
        .await
        .map_err(|e| format!("failed to bind {}: {}", options.http_bind, e))?;
    eprintln!(
        "stratad running (data_dir={}, shards={}, http={}). Press Ctrl+C or send SIGTERM to stop.",
        store.config().data_dir.display(),
        store.config().shards,
        options.http_bind
    );

    let state = std::sync::Arc::new(HealthState { ready });
    let server = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            Ok((stream, _addr)) = listener.accept() => {
                let io = TokioIo::new(Box::pin(stream));
                let state = std::sync::Arc::clone(&state);
                let conn = server.serve_connection_with_upgrades(io, service_fn(move |req| {
                    let state = std::sync::Arc::clone(&state);
                    async move { health_service(state, req).await }
                }));
                let fut = graceful.watch(conn.into_owned());
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        eprintln!("health connection error: {:?}", e);
                    }
                });
            }
            _ = &mut shutdown => {
                eprintln!("shutdown signal received");
                break;
            }
        }
    }

    drop(listener);
    const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
    tokio::select! {
        _ = graceful.shutdown() => {
            eprintln!("all health connections closed");
        }
        _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
            eprintln!("shutdown timeout waiting for connections");
        }
    }

    eprintln!("flushing store and checkpointing WALs...");
    if let Err(e) = store.flush() {
        eprintln!("flush during shutdown: {}", e);
    }
    drop(store);
    eprintln!("shutdown complete");
    Ok(())
}

// ---------- Main ----------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let (store_config, options) = load_daemon_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        println!("data_dir={}", store_config.data_dir.display());
        println!("shards={}", store_config.shards);
        println!("segment_duration_secs={}", store_config.segment_duration);
        println!("tiers={}", store_config.schema.tiers.len());
        println!("http_bind={}", options.http_bind);
        return Ok(());
    }

    // Safe startup: data_dir must exist and be writable before opening the store.
    check_data_dir_writable(&store_config.data_dir).map_err(|e| {
        eprintln!("startup check failed: {}", e);
        e
    })?;

    let store = TsStore::open(store_config).map_err(|e| {
        eprintln!("failed to open store: {}", e);
        e
    })?;

    let ready = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
    run_with_health_server(store, options, ready).await
}

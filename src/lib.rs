#![doc = r#"
strata: Embedded Time-Series Storage and Rollup Core in Rust

This crate provides the storage engine of an embedded time-series database:
ingestion of numeric samples keyed by metric name and label set, a sharded
on-disk layout of compressed immutable segment files with write-ahead
logging, tiered rollups at configurable resolutions with per-tier retention,
and range queries that transparently stitch raw and rolled-up data. It
supports:
- Per-shard write buffering with backpressure and background sealing
- Gorilla-compressed segment files read through mmap
- Hourly/daily/monthly (configurable) rollup tiers with watermarks
- Retention and dead-space compaction that never block readers
- Label matcher resolution including anchored regular expressions

See the README for usage examples and more details.
"#]
// Declare modules
pub mod buffer;
pub mod builder;
pub mod codec;
pub mod core;
pub mod encoding;
pub mod error;
pub mod query;
pub mod registry;
pub mod rollup;
pub mod store;
pub mod telemetry;
pub mod types;

/// Main entry point for interacting with the time-series store.
pub use crate::core::TsStore;
/// Configuration options for the store.
pub use crate::core::{BatchResult, StoreConfig, StoreInfo};
/// Error type for store operations.
pub use crate::error::StoreError;
/// Query deadline and instant query result types.
pub use crate::query::{Deadline, InstantSample};
/// Structured event hook for observability.
pub use crate::telemetry::{StoreEvent, StoreEventListener};
/// Core value and schema types.
pub use crate::types::{
    Aggregate, AggSet, Clock, Labels, ManualClock, Matcher, MatchOp, Point, Sample, Schema,
    SeriesId, SystemClock, TierSpec, Timestamp, Value,
};
/// Block compressor selection for segments and chunks.
pub use crate::encoding::BlockCompression;

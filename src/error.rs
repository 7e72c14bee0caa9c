use thiserror::Error;

/// Error type for all store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Write buffer full on shard {shard} ({capacity} points)")]
    Backpressure { shard: usize, capacity: usize },

    #[error("Corrupt tier chunk: {0}")]
    CorruptChunk(String),

    #[error("Corrupt segment: {0}")]
    CorruptSegment(String),

    #[error("Corrupt WAL record: {0}")]
    CorruptWal(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Query deadline exceeded")]
    Timeout,

    #[error("Series not found: {0}")]
    SeriesNotFound(String),

    #[error("Invalid time range: from={from}, to={to}")]
    InvalidTimeRange { from: i64, to: i64 },

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Shard {0} is paused after repeated write failures")]
    ShardPaused(usize),

    #[error("Lock acquisition failed: {0}")]
    Lock(String),

    #[error("Background task error: {0}")]
    BackgroundTask(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Poisoned locks are reported rather than propagating a panic across threads.
impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StoreError::Lock(format!("Mutex/RwLock poisoned: {}", err))
    }
}

//! Error taxonomy for the log engine.
//!
//! The engine never panics or unwinds across its public API; every fallible
//! operation returns a [`LogError`] instead. This mirrors the on-media
//! error-code contract (§7) while giving callers `std::error::Error` and `?`.

use std::io;

/// Convenience result alias for fallible engine operations.
pub type LogResult<T> = Result<T, LogError>;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("allocator out of space: requested {requested} bytes, {available} available")]
    OutOfSpace { requested: u64, available: u64 },

    #[error("append would exceed region bounds: offset {offset} + size {size} > region size {region_size}")]
    RegionFull {
        offset: u64,
        size: u64,
        region_size: u64,
    },

    #[error("stream is not initialized (signature mismatch on a fresh mapping)")]
    NotInitialized,

    #[error("region at offset {0} is corrupt: span type outside the known set or overruns its region")]
    CorruptRegion(u64),

    #[error("no region at offset {0}")]
    UnknownRegion(u64),

    #[error("thread-id space exhausted: max_concurrency = {0}")]
    TooManyThreads(u64),

    #[error("i/o error backing the mapping")]
    Io(#[from] io::Error),
}

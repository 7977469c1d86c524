//! Stream-wide tunables, validated once at open time: a small plain struct,
//! checked eagerly so later code can assume it's sound.

use crate::error::{LogError, LogResult};

/// Default id-space size for the thread-id service (§6, §4.8).
pub const DEFAULT_MAX_CONCURRENCY: u64 = 1024;

/// Tunables supplied to [`crate::PmemLog::create_or_open`].
///
/// `max_concurrency` is a stream invariant (see DESIGN.md's resolution of
/// the corresponding open question): reopening a stream with a different
/// value than it was created with is a caller error this crate does not
/// detect, since the value isn't itself persisted on media.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// Total mapping size in bytes.
    pub stream_size: u64,
    /// Region alignment granularity; must be a power of two and a multiple of 64.
    pub block_size: u64,
    /// Upper bound on concurrently live appending threads.
    pub max_concurrency: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_size: 16 * 1024 * 1024,
            block_size: 4096,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> LogResult<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(LogError::InvalidArgument("block_size must be a power of two"));
        }
        if self.block_size % 64 != 0 {
            return Err(LogError::InvalidArgument("block_size must be a multiple of 64"));
        }
        if self.max_concurrency == 0 {
            return Err(LogError::InvalidArgument("max_concurrency must be nonzero"));
        }
        let min_size = crate::header::arena_offset(self.block_size) + self.block_size;
        if self.stream_size < min_size {
            return Err(LogError::InvalidArgument(
                "stream_size must exceed the header region by at least one block_size",
            ));
        }
        Ok(())
    }
}

//! The stream facade (§6): ties the span, PSLL, allocator, region-runtime,
//! timestamp/commit, thread-id, and iterator layers into the public
//! `PmemLog` type.
//!
//! Lifecycle (§7 "durable state not initialized"): on open, a zero
//! signature triggers a one-shot format — header fields are written first,
//! persisted, and the signature is written and persisted last, so a crash
//! mid-format always looks like "never initialized" on the next open.
//! `alloc::runtime_init` then repairs any torn allocator mutation from a
//! prior crash, and the MPMC queue is reset to the recovered
//! `persisted_timestamp` so timestamps stay contiguous across reopens.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::task::{Context, Poll};

use log::debug;
use parking_lot::Mutex;

use crate::alloc;
use crate::config::StreamConfig;
use crate::error::{LogError, LogResult};
use crate::header::{self, StreamHeader};
use crate::iter::{EntryIter, LogEntry, Region, RegionIter};
use crate::mem::Mapping;
use crate::mpmc::MpmcQueue;
use crate::region::RegionRuntimeMap;
use crate::span;
use crate::thread_id::ThreadIdService;
use crate::wait;

/// A handle to a durably reserved but not-yet-published entry, returned by
/// [`PmemLog::reserve`]. The caller fills [`ReservedEntry::data_mut`] with
/// the payload before handing it to [`PmemLog::publish`].
pub struct ReservedEntry<'a> {
    log: &'a PmemLog,
    entry_offset: u64,
    payload_size: u64,
}

impl<'a> ReservedEntry<'a> {
    fn data_offset(&self) -> u64 {
        self.entry_offset + span::ENTRY_HEADER_SIZE
    }

    pub fn len(&self) -> usize {
        self.payload_size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.payload_size == 0
    }

    /// The reserved payload destination. Exclusive to this reservation until
    /// it's published: no other caller can observe this offset, since
    /// `append_offset` only ever advances past it once.
    ///
    /// # Safety
    /// The caller must not retain the slice past `publish`/`append`, and
    /// must not write past `self.len()` bytes.
    pub unsafe fn data_mut(&self) -> &mut [u8] {
        self.log.map.slice_at_mut(self.data_offset(), self.len())
    }
}

/// A chained future for `append_async` (§4.7, §9): memcpy step then publish
/// step. The memcpy step runs inline here rather than being driven by an
/// external data-mover, since this crate owns no async runtime or mover
/// abstraction of its own; a host embedding a real mover would replace the
/// `Start` arm's copy with a registered completion instead. The publish
/// step never blocks this function's caller: `poll` re-arms the waker and
/// returns `Pending` rather than parking, which would stall whatever
/// executor drives it.
pub struct AppendFuture<'a> {
    log: &'a PmemLog,
    state: AppendState<'a>,
}

enum AppendState<'a> {
    Start { region: Region, data: &'a [u8] },
    WaitingWatermark { entry: LogEntry, timestamp: u64 },
    Done,
}

impl<'a> Future for AppendFuture<'a> {
    type Output = LogResult<LogEntry>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.state, AppendState::Done) {
                AppendState::Start { region, data } => {
                    let reserved = match this.log.reserve(region, data.len() as u64) {
                        Ok(r) => r,
                        Err(e) => return Poll::Ready(Err(e)),
                    };
                    // SAFETY: this reservation is exclusively ours and `data`
                    // is exactly `reserved.len()` bytes.
                    unsafe { reserved.data_mut().copy_from_slice(data) };
                    match this.log.commit_reserved(&reserved) {
                        Ok((entry, timestamp)) => {
                            if this.log.persisted_timestamp() >= timestamp {
                                return Poll::Ready(Ok(entry));
                            }
                            this.state = AppendState::WaitingWatermark { entry, timestamp };
                        }
                        Err(e) => return Poll::Ready(Err(e)),
                    }
                }
                AppendState::WaitingWatermark { entry, timestamp } => {
                    this.log.try_advance_watermark();
                    if this.log.persisted_timestamp() >= timestamp {
                        return Poll::Ready(Ok(entry));
                    }
                    this.state = AppendState::WaitingWatermark { entry, timestamp };
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                AppendState::Done => {
                    return Poll::Ready(Err(LogError::InvalidArgument(
                        "AppendFuture polled after completion",
                    )))
                }
            }
        }
    }
}

/// A crash-consistent, concurrent append-only log over a byte-addressable
/// mapping (§2). Owns every piece of volatile runtime state; nothing about
/// a stream lives outside its handle (§9 "Global mutable state: none").
pub struct PmemLog {
    map: Mapping,
    block_size: u64,
    region_runtimes: RegionRuntimeMap,
    thread_ids: ThreadIdService,
    mpmc: MpmcQueue,
    persisted_timestamp_cache: AtomicU64,
    /// Bumped whenever `persisted_timestamp_cache` changes; waiters in
    /// `publish` park on this instead of the real (64-bit) watermark, since
    /// `atomic-wait` only parks on 32-bit words.
    wait_epoch: AtomicU32,
    alloc_lock: Mutex<()>,
}

impl PmemLog {
    /// Opens (creating and formatting if necessary) a file-backed stream.
    pub fn create_or_open(path: impl AsRef<Path>, config: StreamConfig) -> LogResult<Self> {
        config.validate()?;
        let map = Mapping::open_file(path, config.stream_size)?;
        Self::from_mapping(map, config)
    }

    /// Opens a heap-backed stream with no durability across process exit.
    /// Used by tests and callers that want the engine's concurrency and
    /// recovery semantics without a temp file.
    pub fn open_anonymous(config: StreamConfig) -> LogResult<Self> {
        config.validate()?;
        let map = Mapping::anonymous(config.stream_size as usize)?;
        Self::from_mapping(map, config)
    }

    fn from_mapping(map: Mapping, config: StreamConfig) -> LogResult<Self> {
        // SAFETY: the stream header always occupies the start of the mapping.
        let hdr: StreamHeader = unsafe { map.read_at(header::STREAM_HEADER_OFFSET) };
        if !hdr.is_initialized() {
            debug!(
                "formatting fresh stream: {} bytes, block_size {}",
                config.stream_size, config.block_size
            );
            let fresh = StreamHeader::fresh(config.stream_size, config.block_size);
            // SAFETY: see above; signature is left zeroed in `fresh`.
            unsafe { map.write_at(header::STREAM_HEADER_OFFSET, fresh) };
            map.persist()?;
            // SAFETY: writes exactly the signature field, last.
            unsafe {
                map.write_at(header::STREAM_HEADER_OFFSET, StreamHeader::signature_for_init())
            };
            map.persist()?;
        }

        alloc::runtime_init(&map);

        // SAFETY: see above.
        let hdr: StreamHeader = unsafe { map.read_at(header::STREAM_HEADER_OFFSET) };
        if hdr.block_size != config.block_size || hdr.stream_size != config.stream_size {
            return Err(LogError::InvalidArgument(
                "config does not match the geometry of the existing stream header",
            ));
        }

        let persisted = hdr.persisted_timestamp;
        let mpmc = MpmcQueue::new(config.max_concurrency, u64::MAX);
        mpmc.reset(persisted);

        Ok(Self {
            map,
            block_size: config.block_size,
            region_runtimes: RegionRuntimeMap::new(),
            thread_ids: ThreadIdService::new(config.max_concurrency),
            mpmc,
            persisted_timestamp_cache: AtomicU64::new(persisted),
            wait_epoch: AtomicU32::new(0),
            alloc_lock: Mutex::new(()),
        })
    }

    /// Flushes outstanding writes. Dropping a `PmemLog` without calling this
    /// is exactly the "force-crash" scenario §8 exercises: whatever made it
    /// to media is recovered on the next open, nothing more.
    pub fn close(self) {
        let _ = self.map.persist();
    }

    pub fn allocate_region(&self, size: u64) -> LogResult<Region> {
        let _guard = self.alloc_lock.lock();
        let offset = alloc::allocate(&self.map, self.block_size, size)?;
        Ok(Region(offset))
    }

    pub fn free_region(&self, region: Region) -> LogResult<()> {
        let _guard = self.alloc_lock.lock();
        alloc::free(&self.map, region.0)?;
        self.region_runtimes.remove(region.0);
        Ok(())
    }

    pub fn region_size(&self, region: Region) -> LogResult<u64> {
        alloc::region_size(&self.map, region.0)
    }

    pub fn reserve(&self, region: Region, size: u64) -> LogResult<ReservedEntry<'_>> {
        let region_payload_size = alloc::region_size(&self.map, region.0)?;
        let rt = self.region_runtimes.get_or_create(region.0);
        rt.ensure_write_ready(&self.map, region.0, region_payload_size, self.persisted_timestamp())?;
        rt.zero_tail_if_dirty(&self.map, region.0, region_payload_size);

        let region_view = span::span_at(&self.map, region.0)?;
        let region_end = region_view.data_offset() + region_payload_size;
        let entry_total = span::align_up(span::ENTRY_HEADER_SIZE + size, 8);
        let entry_offset = rt.reserve(entry_total, region_end)?;

        Ok(ReservedEntry {
            log: self,
            entry_offset,
            payload_size: size,
        })
    }

    /// Acquires a timestamp, writes the entry header, and produces on the
    /// MPMC queue (§4.7 steps 1-3 of `publish`). Does not block.
    fn commit_reserved(&self, reserved: &ReservedEntry<'_>) -> LogResult<(LogEntry, u64)> {
        let id = self.thread_ids.id_for_current_thread()?;
        let granted = self
            .mpmc
            .acquire(id, 1)
            .ok_or(LogError::OutOfSpace { requested: 1, available: 0 })?;
        let timestamp = header::FIRST_TIMESTAMP + granted;

        span::create_entry(&self.map, reserved.entry_offset, reserved.payload_size, timestamp);
        self.map.persist()?;
        self.mpmc.produce(id);
        self.try_advance_watermark();

        let entry = LogEntry {
            offset: reserved.entry_offset,
            timestamp,
            len: reserved.payload_size,
        };
        Ok((entry, timestamp))
    }

    /// Any thread may consume (§4.6 step 4): compute the lowest still-granted
    /// offset and, if it moved, publish the new watermark and wake waiters.
    fn try_advance_watermark(&self) {
        let (old, ready) = self.mpmc.consume();
        if ready == 0 {
            return;
        }
        let new_value = old + ready;
        // SAFETY: addresses a live field of the stream header.
        unsafe { self.map.write_at(header::PERSISTED_TIMESTAMP_OFFSET, new_value) };
        let _ = self.map.persist();
        self.persisted_timestamp_cache.store(new_value, Ordering::Release);
        self.wait_epoch.fetch_add(1, Ordering::Release);
        wait::wake_all(&self.wait_epoch);
    }

    /// Writes the header, persists header + payload, produces, then blocks
    /// until the durable watermark reaches this entry's timestamp.
    pub fn publish(&self, reserved: ReservedEntry<'_>) -> LogResult<LogEntry> {
        let (entry, timestamp) = self.commit_reserved(&reserved)?;
        loop {
            if self.persisted_timestamp() >= timestamp {
                return Ok(entry);
            }
            let epoch = self.wait_epoch.load(Ordering::Acquire);
            self.try_advance_watermark();
            if self.persisted_timestamp() >= timestamp {
                return Ok(entry);
            }
            wait::wait_u32(&self.wait_epoch, epoch);
        }
    }

    /// `reserve`, memcpy, `publish`.
    pub fn append(&self, region: Region, data: &[u8]) -> LogResult<LogEntry> {
        let reserved = self.reserve(region, data.len() as u64)?;
        // SAFETY: this reservation is exclusively ours and `data` is exactly
        // `reserved.len()` bytes.
        unsafe { reserved.data_mut().copy_from_slice(data) };
        self.publish(reserved)
    }

    /// Identical to `append`, except the memcpy/publish chain is a pollable
    /// future instead of a blocking call.
    pub fn append_async<'a>(&'a self, region: Region, data: &'a [u8]) -> AppendFuture<'a> {
        AppendFuture {
            log: self,
            state: AppendState::Start { region, data },
        }
    }

    pub fn region_iter(&self) -> RegionIter<'_> {
        RegionIter::new(&self.map)
    }

    pub fn entry_iter(&self, region: Region) -> EntryIter<'_> {
        let payload_size = alloc::region_size(&self.map, region.0).unwrap_or(0);
        let runtime = self.region_runtimes.get_or_create(region.0);
        EntryIter::new(&self.map, region.0, payload_size, self.persisted_timestamp(), runtime)
    }

    pub fn committed_timestamp(&self) -> u64 {
        self.mpmc.consumed_offset()
    }

    pub fn persisted_timestamp(&self) -> u64 {
        self.persisted_timestamp_cache.load(Ordering::Acquire)
    }

    pub fn entry_timestamp(&self, entry: LogEntry) -> Option<u64> {
        let view = span::span_at(&self.map, entry.offset).ok()?;
        if view.span_type != span::SpanType::Entry {
            return None;
        }
        Some(span::read_entry_body(&self.map, entry.offset).timestamp)
    }

    pub fn entry_data(&self, entry: LogEntry) -> Option<&[u8]> {
        let view = span::span_at(&self.map, entry.offset).ok()?;
        if view.span_type != span::SpanType::Entry {
            return None;
        }
        // SAFETY: bounds validated by `span_at`.
        Some(unsafe { self.map.slice_at(view.data_offset(), view.size as usize) })
    }

    #[cfg(test)]
    pub(crate) fn raw_map(&self) -> &Mapping {
        &self.map
    }
}

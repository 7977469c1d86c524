//! Region runtime and recovery (§4.4): the volatile append cursor for one
//! region, rebuilt lazily by scanning entries, plus the map that owns every
//! live region's runtime state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LogError, LogResult};
use crate::header::{DIRTY_BIT, INVALID_OFFSET};
use crate::mem::Mapping;
use crate::span::{self, SpanType};

/// Scans a region's entries starting at its data offset, validating each
/// against `persisted_timestamp`, and returns the offset of the first
/// invalid (or out-of-bounds) span — the recovered append offset.
fn scan_tail(
    map: &Mapping,
    region_offset: u64,
    region_payload_size: u64,
    persisted_timestamp: u64,
) -> LogResult<u64> {
    let region_view = span::span_at(map, region_offset)?;
    if region_view.span_type != SpanType::Region {
        return Err(LogError::UnknownRegion(region_offset));
    }
    let data_start = region_view.data_offset();
    let region_end = data_start + region_payload_size;

    let mut cur = data_start;
    while cur < region_end {
        let view = match span::span_at(map, cur) {
            Ok(v) => v,
            Err(_) => break,
        };
        if view.span_type != SpanType::Entry {
            break;
        }
        let body = span::read_entry_body(map, cur);
        if body.timestamp > persisted_timestamp {
            break;
        }
        let next = cur + view.total_size();
        if next > region_end {
            // a span claiming to extend past its region is unrecoverable
            // corruption for that region; truncate here (§7).
            break;
        }
        cur = next;
    }
    Ok(cur)
}

/// Per-region volatile state: `append_offset` tagged with [`DIRTY_BIT`] until
/// the tail has been zeroed following recovery.
#[derive(Debug)]
pub struct RegionRuntime {
    append_offset: AtomicU64,
    init_lock: Mutex<()>,
}

impl RegionRuntime {
    pub(crate) fn new() -> Self {
        Self {
            append_offset: AtomicU64::new(INVALID_OFFSET),
            init_lock: Mutex::new(()),
        }
    }

    pub fn is_write_ready(&self) -> bool {
        self.append_offset.load(Ordering::Acquire) != INVALID_OFFSET
    }

    /// `READ_READY -> WRITE_READY`: scans entries under the per-region lock
    /// if nobody has done so yet. Idempotent.
    pub fn ensure_write_ready(
        &self,
        map: &Mapping,
        region_offset: u64,
        region_payload_size: u64,
        persisted_timestamp: u64,
    ) -> LogResult<()> {
        if self.append_offset.load(Ordering::Acquire) != INVALID_OFFSET {
            return Ok(());
        }
        let _guard = self.init_lock.lock();
        if self.append_offset.load(Ordering::Acquire) != INVALID_OFFSET {
            return Ok(());
        }
        let tail = scan_tail(map, region_offset, region_payload_size, persisted_timestamp)?;
        self.append_offset.store(tail | DIRTY_BIT, Ordering::Release);
        Ok(())
    }

    /// Zeroes the tail (append_offset..region_end) and clears the dirty bit,
    /// if not already done by a concurrent writer. Must be called with
    /// `ensure_write_ready` already having succeeded.
    pub fn zero_tail_if_dirty(&self, map: &Mapping, region_offset: u64, region_payload_size: u64) {
        if self.append_offset.load(Ordering::Acquire) & DIRTY_BIT == 0 {
            return;
        }
        let _guard = self.init_lock.lock();
        let cur = self.append_offset.load(Ordering::Acquire);
        if cur & DIRTY_BIT == 0 {
            return;
        }
        let tail = cur & !DIRTY_BIT;
        let region_view = span::span_at(map, region_offset).expect("region validated by ensure_write_ready");
        let region_end = region_view.data_offset() + region_payload_size;
        // SAFETY: `tail..region_end` lies within the region, validated above.
        unsafe { map.zero_at(tail, (region_end - tail) as usize) };
        let _ = map.persist();
        self.append_offset.store(tail, Ordering::Release);
    }

    /// Atomically bumps `append_offset` by `size`, returning the
    /// pre-reservation offset. Fails without mutating state if the
    /// reservation would exceed `region_end`.
    pub fn reserve(&self, size: u64, region_end: u64) -> LogResult<u64> {
        loop {
            let cur = self.append_offset.load(Ordering::Acquire);
            debug_assert_eq!(cur & DIRTY_BIT, 0, "tail must be zeroed before reserving");
            let next = cur
                .checked_add(size)
                .ok_or(LogError::InvalidArgument("reservation size overflow"))?;
            if next > region_end {
                return Err(LogError::RegionFull {
                    offset: cur,
                    size,
                    region_size: region_end,
                });
            }
            if self
                .append_offset
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(cur);
            }
        }
    }

    pub fn append_offset(&self) -> u64 {
        self.append_offset.load(Ordering::Acquire) & !DIRTY_BIT
    }
}

/// Concurrent ordered map of live region runtimes, keyed by region offset.
/// Per §4.4: "a concurrent ordered map keyed by region offset, implemented
/// behind a lock used only for insertion" — lookups after creation don't
/// contend on the lock since each entry is an `Arc`.
#[derive(Debug, Default)]
pub struct RegionRuntimeMap {
    inner: Mutex<BTreeMap<u64, Arc<RegionRuntime>>>,
}

impl RegionRuntimeMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get_or_create(&self, region_offset: u64) -> Arc<RegionRuntime> {
        self.inner
            .lock()
            .entry(region_offset)
            .or_insert_with(|| Arc::new(RegionRuntime::new()))
            .clone()
    }

    pub fn remove(&self, region_offset: u64) {
        self.inner.lock().remove(&region_offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span;

    fn region_with_entries(entries: &[(u64, &[u8])], payload_size: u64) -> (Mapping, u64) {
        let mut map = Mapping::anonymous(1 << 16).unwrap();
        let region_offset = 0u64;
        span::create_region(&mut map, region_offset, payload_size, u64::MAX, u64::MAX);
        let mut cur = span::span_at(&map, region_offset).unwrap().data_offset();
        for (ts, payload) in entries {
            span::create_entry(&mut map, cur, payload.len() as u64, *ts);
            let dst = cur + span::ENTRY_HEADER_SIZE;
            // SAFETY: within the region's reserved payload area by construction.
            unsafe { map.copy_at(dst, payload) };
            let view = span::span_at(&map, cur).unwrap();
            cur += view.total_size();
        }
        (map, region_offset)
    }

    #[test]
    fn recovers_tail_past_valid_entries_only() {
        let (map, region_offset) = region_with_entries(&[(1, b"A"), (2, b"BB"), (5, b"ignored")], 4096);
        let view = span::span_at(&map, region_offset).unwrap();
        let tail = scan_tail(&map, region_offset, view.size, 2).unwrap();

        let e0 = span::span_at(&map, view.data_offset()).unwrap();
        let e1_offset = view.data_offset() + e0.total_size();
        let e1 = span::span_at(&map, e1_offset).unwrap();
        assert_eq!(tail, e1_offset + e1.total_size());
    }

    #[test]
    fn write_ready_lifecycle_zeroes_stale_tail() {
        let (mut map, region_offset) = region_with_entries(&[(1, b"A")], 4096);
        let view = span::span_at(&map, region_offset).unwrap();
        let payload_size = view.size;

        // Leave stale bytes beyond the true tail as if a prior incarnation
        // reserved but never published.
        let entry0 = span::span_at(&map, view.data_offset()).unwrap();
        let stale_offset = view.data_offset() + entry0.total_size();
        span::create_entry(&mut map, stale_offset, 3, 99);

        let rt = RegionRuntime::new();
        rt.ensure_write_ready(&map, region_offset, payload_size, 1).unwrap();
        assert!(rt.append_offset() <= stale_offset);
        assert_ne!(rt.append_offset.load(Ordering::Acquire) & DIRTY_BIT, 0);

        rt.zero_tail_if_dirty(&mut map, region_offset, payload_size);
        assert_eq!(rt.append_offset.load(Ordering::Acquire) & DIRTY_BIT, 0);

        let cleared = span::span_at(&map, stale_offset).unwrap();
        assert_eq!(cleared.span_type, SpanType::Empty);
    }

    #[test]
    fn map_returns_same_runtime_for_same_offset() {
        let map = RegionRuntimeMap::new();
        let a = map.get_or_create(128);
        let b = map.get_or_create(128);
        assert!(Arc::ptr_eq(&a, &b));
        map.remove(128);
        let c = map.get_or_create(128);
        assert!(!Arc::ptr_eq(&a, &c));
    }
}

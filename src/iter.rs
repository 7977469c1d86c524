//! Region and entry iterators (§4.5).
//!
//! Both implement `std::iter::Iterator` as well as the explicit
//! `seek_first`/`next`/`is_valid`/`get` operations named in §6, so neither
//! surface is dropped.

use std::sync::Arc;

use crate::header::{self, StreamHeader};
use crate::mem::Mapping;
use crate::region::RegionRuntime;
use crate::span::{self, SpanType};

/// A region handle: its span offset in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Region(pub u64);

/// A durable, user-visible record: its offset, timestamp, and payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub offset: u64,
    pub timestamp: u64,
    pub len: u64,
}

/// Walks the span chain from the start of the arena up to the allocator's
/// growth watermark, yielding offsets where `type == REGION` and skipping
/// `EMPTY` runs.
pub struct RegionIter<'a> {
    map: &'a Mapping,
    cur: u64,
    end: u64,
}

impl<'a> RegionIter<'a> {
    pub fn new(map: &'a Mapping) -> Self {
        let hdr: StreamHeader = unsafe { map.read_at(header::STREAM_HEADER_OFFSET) };
        Self {
            map,
            cur: header::arena_offset(hdr.block_size),
            end: hdr.allocator.free_offset,
        }
    }

    pub fn seek_first(map: &'a Mapping) -> Self {
        Self::new(map)
    }

    pub fn is_valid(&self) -> bool {
        self.cur < self.end
    }
}

impl<'a> Iterator for RegionIter<'a> {
    type Item = Region;

    fn next(&mut self) -> Option<Region> {
        while self.cur < self.end {
            let view = span::span_at(self.map, self.cur).ok()?;
            let offset = self.cur;
            self.cur += view.total_size();
            if view.span_type == SpanType::Region {
                return Some(Region(offset));
            }
            // EMPTY run: keep scanning.
        }
        None
    }
}

/// Advances through a region's entries, stopping at the first span that is
/// not a validly-committed entry. Safe to run concurrently with appends:
/// appends only grow the sequence and never rewrite a byte this iterator
/// has already validated.
pub struct EntryIter<'a> {
    map: &'a Mapping,
    region_offset: u64,
    region_payload_size: u64,
    region_end: u64,
    persisted_timestamp: u64,
    runtime: Arc<RegionRuntime>,
    cur: u64,
    done: bool,
}

impl<'a> EntryIter<'a> {
    pub fn new(
        map: &'a Mapping,
        region_offset: u64,
        region_payload_size: u64,
        persisted_timestamp: u64,
        runtime: Arc<RegionRuntime>,
    ) -> Self {
        let data_start = span::span_at(map, region_offset)
            .map(|v| v.data_offset())
            .unwrap_or(region_offset);
        Self {
            map,
            region_offset,
            region_payload_size,
            region_end: data_start + region_payload_size,
            persisted_timestamp,
            runtime,
            cur: data_start,
            done: false,
        }
    }

    pub fn seek_first(
        map: &'a Mapping,
        region_offset: u64,
        region_payload_size: u64,
        persisted_timestamp: u64,
        runtime: Arc<RegionRuntime>,
    ) -> Self {
        Self::new(map, region_offset, region_payload_size, persisted_timestamp, runtime)
    }

    pub fn is_valid(&self) -> bool {
        !self.done && self.cur < self.region_end
    }

    /// Reads the entry's payload at `entry.offset`. Returns `None` if the
    /// offset no longer names a valid entry (mirrors §6's "invalid inputs
    /// return INVALID_TIMESTAMP / None rather than failing").
    pub fn get<'b>(&self, map: &'b Mapping, entry: LogEntry) -> Option<&'b [u8]> {
        let view = span::span_at(map, entry.offset).ok()?;
        if view.span_type != SpanType::Entry {
            return None;
        }
        // SAFETY: `view` bounds were validated by `span_at`.
        Some(unsafe { map.slice_at(view.data_offset(), view.size as usize) })
    }
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        if self.done || self.cur >= self.region_end {
            return None;
        }

        if self.runtime.is_write_ready() && self.cur == self.runtime.append_offset() {
            self.done = true;
            return None;
        }

        let view = match span::span_at(self.map, self.cur) {
            Ok(v) => v,
            Err(_) => {
                self.done = true;
                return None;
            }
        };

        let valid = view.span_type == SpanType::Entry && {
            let body = span::read_entry_body(self.map, self.cur);
            body.timestamp <= self.persisted_timestamp
        };

        if !valid {
            if !self.runtime.is_write_ready() {
                let _ = self.runtime.ensure_write_ready(
                    self.map,
                    self.region_offset,
                    self.region_payload_size,
                    self.persisted_timestamp,
                );
            }
            self.done = true;
            return None;
        }

        let body = span::read_entry_body(self.map, self.cur);
        let offset = self.cur;
        let total = view.total_size();
        self.cur += total;
        Some(LogEntry {
            offset,
            timestamp: body.timestamp,
            len: view.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc;

    fn fresh_map(stream_size: u64, block_size: u64) -> Mapping {
        let mut map = Mapping::anonymous(stream_size as usize).unwrap();
        let hdr = StreamHeader::fresh(stream_size, block_size);
        // SAFETY: header fits at offset 0 by construction.
        unsafe { map.write_at(0, hdr) };
        let _ = map.persist();
        map
    }

    #[test]
    fn region_iter_yields_only_allocated_and_freed_regions() {
        let mut map = fresh_map(1 << 20, 4096);
        let r1 = alloc::allocate(&mut map, 4096, 4096).unwrap();
        let r2 = alloc::allocate(&mut map, 4096, 4096).unwrap();
        let found: Vec<_> = RegionIter::new(&map).collect();
        assert_eq!(found, vec![Region(r1), Region(r2)]);
    }

    #[test]
    fn entry_iter_stops_before_dirty_tail() {
        let mut map = fresh_map(1 << 20, 4096);
        let region_offset = alloc::allocate(&mut map, 4096, 4096).unwrap();
        let payload_size = alloc::region_size(&map, region_offset).unwrap();
        let data_start = span::span_at(&map, region_offset).unwrap().data_offset();

        span::create_entry(&mut map, data_start, 1, 1);
        // SAFETY: within the allocated region payload.
        unsafe { map.copy_at(data_start + span::ENTRY_HEADER_SIZE, b"A") };

        let runtime = Arc::new(crate::region::RegionRuntime::new());
        let entries: Vec<_> = EntryIter::new(&map, region_offset, payload_size, 1, runtime).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].timestamp, 1);
        assert_eq!(entries[0].len, 1);
    }
}

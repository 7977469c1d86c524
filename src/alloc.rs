//! Region allocator (§4.3): a crash-safe free/allocated list pair over a
//! contiguous arena. All allocations are the same size (rounded up to
//! `block_size`), matching the "fixed region size" non-goal in §1.

use crate::error::{LogError, LogResult};
use crate::header::{self, INVALID_OFFSET};
use crate::mem::Mapping;
use crate::psll::{self, Link};
use crate::span;

fn free_offset(map: &Mapping) -> u64 {
    // SAFETY: addresses a live field of the stream header.
    unsafe { map.read_at(header::FREE_OFFSET_OFFSET) }
}

fn set_free_offset(map: &Mapping, value: u64) {
    // SAFETY: see `free_offset`.
    unsafe { map.write_at(header::FREE_OFFSET_OFFSET, value) };
}

fn total_size(map: &Mapping) -> u64 {
    // SAFETY: see `free_offset`.
    unsafe { map.read_at(header::TOTAL_SIZE_OFFSET) }
}

fn offset_to_free(map: &Mapping) -> u64 {
    // SAFETY: see `free_offset`.
    unsafe { map.read_at(header::OFFSET_TO_FREE_OFFSET) }
}

fn set_offset_to_free(map: &Mapping, value: u64) {
    // SAFETY: see `free_offset`.
    unsafe { map.write_at(header::OFFSET_TO_FREE_OFFSET, value) };
}

/// Runs PSLL runtime-init on both lists, then replays the three recovery
/// steps in §4.3, in order. Idempotent: running it twice is a no-op the
/// second time.
pub fn runtime_init(map: &Mapping) {
    psll::runtime_init(map, header::FREE_LIST_OFFSET, Link::Free);
    psll::runtime_init(map, header::ALLOCATED_LIST_OFFSET, Link::Allocated);

    recover_free_list_extension(map);
    recover_allocation_in_progress(map);
    recover_free_in_progress(map);
}

/// Free-list extension recovery: a span was linked at the free list head but
/// `free_offset`'s advance did not become durable.
fn recover_free_list_extension(map: &Mapping) {
    let head = psll::head(map, header::FREE_LIST_OFFSET);
    if head == INVALID_OFFSET {
        return;
    }
    let fo = free_offset(map);
    if head > fo {
        if let Ok(view) = span::span_at(map, head) {
            set_free_offset(map, head + view.total_size());
            let _ = map.persist();
        }
    }
}

/// Allocation-in-progress recovery: the allocated list holds exactly one
/// node (head == tail), meaning a crash interrupted the very first
/// free→allocated move; finish it by popping the (identical) free-list head.
fn recover_allocation_in_progress(map: &Mapping) {
    let head = psll::head(map, header::ALLOCATED_LIST_OFFSET);
    let tail = psll::tail(map, header::ALLOCATED_LIST_OFFSET);
    if head != INVALID_OFFSET && head == tail {
        psll::remove_head(map, header::FREE_LIST_OFFSET, Link::Free);
    }
}

/// Free-in-progress recovery: `offset_to_free` names a region whose move
/// from the allocated list back to the free list may be half-done.
fn recover_free_in_progress(map: &Mapping) {
    let pending = offset_to_free(map);
    if pending == INVALID_OFFSET {
        return;
    }

    let free_head = psll::head(map, header::FREE_LIST_OFFSET);
    if free_head != pending {
        // crash just after publishing offset_to_free, before the free-list insert
        psll::insert_head(map, header::FREE_LIST_OFFSET, Link::Free, pending);
        psll::remove(map, header::ALLOCATED_LIST_OFFSET, Link::Allocated, pending);
    } else {
        // crash before or after the allocated-list removal; remove is idempotent
        // as long as the node is still present.
        if psll::foreach(map, header::ALLOCATED_LIST_OFFSET, Link::Allocated).contains(&pending) {
            psll::remove(map, header::ALLOCATED_LIST_OFFSET, Link::Allocated, pending);
        }
    }

    set_offset_to_free(map, INVALID_OFFSET);
    let _ = map.persist();
}

fn extend_free_list(map: &Mapping, block_size: u64, payload_size: u64) -> LogResult<()> {
    let span_view_total = span::align_up(span::REGION_HEADER_SIZE + payload_size, block_size);
    let fo = free_offset(map);
    let arena_total = total_size(map);
    if fo + span_view_total > arena_total {
        return Err(LogError::OutOfSpace {
            requested: span_view_total,
            available: arena_total.saturating_sub(fo),
        });
    }

    span::create_region(map, fo, payload_size, INVALID_OFFSET, INVALID_OFFSET);
    let _ = map.persist();

    psll::insert_head(map, header::FREE_LIST_OFFSET, Link::Free, fo);
    set_free_offset(map, fo + span_view_total);
    let _ = map.persist();
    Ok(())
}

/// Allocates a region of at least `requested` payload bytes. Returns the
/// region span's offset. Every region ends up with the same payload size:
/// `align_up(REGION_HEADER_SIZE + requested, block_size) - REGION_HEADER_SIZE`.
pub fn allocate(map: &Mapping, block_size: u64, requested: u64) -> LogResult<u64> {
    let payload_size =
        span::align_up(span::REGION_HEADER_SIZE + requested, block_size) - span::REGION_HEADER_SIZE;

    if psll::is_empty(map, header::FREE_LIST_OFFSET) {
        extend_free_list(map, block_size, payload_size)?;
    }

    let candidate = psll::head(map, header::FREE_LIST_OFFSET);
    debug_assert_ne!(candidate, INVALID_OFFSET);

    let view = span::span_at(map, candidate)?;
    debug_assert_eq!(view.size, payload_size);

    // zero payload before it becomes visible as an allocated region
    // SAFETY: `view`'s bounds were validated by `span_at`.
    unsafe { map.zero_at(view.data_offset(), view.size as usize) };
    let _ = map.persist();

    psll::insert_tail(map, header::ALLOCATED_LIST_OFFSET, Link::Allocated, candidate);
    psll::remove_head(map, header::FREE_LIST_OFFSET, Link::Free);

    Ok(candidate)
}

/// Moves a region from the allocated list back to the free list.
pub fn free(map: &Mapping, offset: u64) -> LogResult<()> {
    if !psll::foreach(map, header::ALLOCATED_LIST_OFFSET, Link::Allocated).contains(&offset) {
        return Err(LogError::UnknownRegion(offset));
    }

    set_offset_to_free(map, offset);
    let _ = map.persist();

    psll::insert_head(map, header::FREE_LIST_OFFSET, Link::Free, offset);
    psll::remove(map, header::ALLOCATED_LIST_OFFSET, Link::Allocated, offset);

    set_offset_to_free(map, INVALID_OFFSET);
    let _ = map.persist();
    Ok(())
}

/// Payload size (bytes) of an allocated region.
pub fn region_size(map: &Mapping, offset: u64) -> LogResult<u64> {
    let view = span::span_at(map, offset)?;
    if view.span_type != span::SpanType::Region {
        return Err(LogError::UnknownRegion(offset));
    }
    Ok(view.size)
}

pub fn allocated_regions(map: &Mapping) -> Vec<u64> {
    psll::foreach(map, header::ALLOCATED_LIST_OFFSET, Link::Allocated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_map(stream_size: u64, block_size: u64) -> Mapping {
        let mut map = Mapping::anonymous(stream_size as usize).unwrap();
        let hdr = header::StreamHeader::fresh(stream_size, block_size);
        // SAFETY: header fits at offset 0 by construction.
        unsafe { map.write_at(0, hdr) };
        let _ = map.persist();
        map
    }

    #[test]
    fn allocate_rounds_up_and_free_reuses() {
        let mut map = fresh_map(1 << 20, 4096);
        let r1 = allocate(&mut map, 4096, 256 * 1024).unwrap();
        assert_eq!(r1, header::arena_offset(4096));
        let size = region_size(&map, r1).unwrap();
        assert!(size >= 256 * 1024);
        assert_eq!((r1) % 4096, 0);

        free(&mut map, r1).unwrap();
        assert!(allocated_regions(&map).is_empty());

        let r2 = allocate(&mut map, 4096, 256 * 1024).unwrap();
        assert_eq!(r1, r2, "freed region must be reused before extending the arena");
    }

    #[test]
    fn out_of_space_then_recovers_after_free() {
        let mut map = fresh_map(64 * 1024, 4096);
        let mut regions = Vec::new();
        loop {
            match allocate(&mut map, 4096, 4096) {
                Ok(off) => regions.push(off),
                Err(LogError::OutOfSpace { .. }) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(!regions.is_empty());
        let freed = regions[0];
        free(&mut map, freed).unwrap();
        let reused = allocate(&mut map, 4096, 4096).unwrap();
        assert_eq!(reused, freed);
    }

    #[test]
    fn runtime_init_completes_torn_free() {
        let mut map = fresh_map(1 << 20, 4096);
        let r1 = allocate(&mut map, 4096, 4096).unwrap();
        let r2 = allocate(&mut map, 4096, 4096).unwrap();

        // simulate a crash mid-free(r1): offset_to_free set and the free-list
        // insert completed, but the allocated-list removal did not happen.
        set_offset_to_free(&mut map, r1);
        psll::insert_head(&mut map, header::FREE_LIST_OFFSET, Link::Free, r1);

        runtime_init(&mut map);

        assert_eq!(offset_to_free(&map), INVALID_OFFSET);
        assert!(!allocated_regions(&map).contains(&r1));
        assert!(allocated_regions(&map).contains(&r2));
    }
}

//! Persistent singly linked list (§4.2): a crash-safe intrusive list whose
//! nodes are region spans, linked through one of their two link fields
//! (`next_free` for the free list, `next_allocated` for the allocated list).
//!
//! The list's head/tail pair itself lives on media (inside the stream
//! header's `AllocatorHeader`), addressed here by `list_offset`: the byte
//! offset of its `{head: u64, tail: u64}` pair in the mapping. Every store
//! is flushed individually and a `drain` separates dependent stores, per the
//! single-store-atomicity table in §4.2. Every entry point takes `link`
//! explicitly so it always matches which field `list_offset`'s nodes are
//! threaded through.

use log::debug;

use crate::header::INVALID_OFFSET;
use crate::mem::Mapping;
use crate::span;

/// Which of a region span's two link fields this list threads through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Free,
    Allocated,
}

fn next_of(map: &Mapping, node_offset: u64, link: Link) -> u64 {
    let body = span::read_region_body(map, node_offset);
    match link {
        Link::Free => body.next_free,
        Link::Allocated => body.next_allocated,
    }
}

fn set_next(map: &Mapping, node_offset: u64, link: Link, value: u64) {
    let mut body = span::read_region_body(map, node_offset);
    match link {
        Link::Free => body.next_free = value,
        Link::Allocated => body.next_allocated = value,
    }
    span::write_region_body(map, node_offset, body);
}

fn read_head(map: &Mapping, list_offset: u64) -> u64 {
    // SAFETY: `list_offset` addresses a live `ListHead` inside the stream header.
    unsafe { map.read_at(list_offset) }
}

fn read_tail(map: &Mapping, list_offset: u64) -> u64 {
    // SAFETY: see `read_head`.
    unsafe { map.read_at(list_offset + 8) }
}

fn write_head(map: &Mapping, list_offset: u64, value: u64) {
    // SAFETY: see `read_head`.
    unsafe { map.write_at(list_offset, value) };
}

fn write_tail(map: &Mapping, list_offset: u64, value: u64) {
    // SAFETY: see `read_head`.
    unsafe { map.write_at(list_offset + 8, value) };
}

/// Clears `head`/`tail` to `INVALID_OFFSET`.
pub fn init(map: &Mapping, list_offset: u64) {
    write_head(map, list_offset, INVALID_OFFSET);
    write_tail(map, list_offset, INVALID_OFFSET);
    let _ = map.persist();
}

/// Idempotent post-crash repair, restoring the list invariants (§4.2):
/// `head == INVALID ⇔ tail == INVALID`; `next(tail) == INVALID`; every node
/// from `head` reaches `tail` in finite steps.
pub fn runtime_init(map: &Mapping, list_offset: u64, link: Link) {
    let head = read_head(map, list_offset);
    if head == INVALID_OFFSET {
        let stale_tail = read_tail(map, list_offset);
        if stale_tail != INVALID_OFFSET {
            debug!(
                "psll runtime_init: repaired empty list at offset {list_offset} \
                 (stale tail {stale_tail} from a crash between insert_tail's tail \
                 and head stores)"
            );
        }
        write_tail(map, list_offset, INVALID_OFFSET);
        let _ = map.persist();
        return;
    }

    let mut tail = read_tail(map, list_offset);
    debug_assert_ne!(tail, INVALID_OFFSET, "non-empty list must have a tail");

    // A crash inside `insert_head`/`insert_tail` can leave `next(tail) !=
    // INVALID`: the node link was published but the new tail wasn't yet.
    // Walk forward and advance tail to the true last node.
    let mut next = next_of(map, tail, link);
    let mut advanced = false;
    while next != INVALID_OFFSET {
        tail = next;
        next = next_of(map, tail, link);
        advanced = true;
    }
    if advanced {
        debug!("psll runtime_init: advanced torn tail at offset {list_offset} to {tail}");
        write_tail(map, list_offset, tail);
        let _ = map.persist();
    }
}

pub fn is_empty(map: &Mapping, list_offset: u64) -> bool {
    read_head(map, list_offset) == INVALID_OFFSET
}

pub fn head(map: &Mapping, list_offset: u64) -> u64 {
    read_head(map, list_offset)
}

pub fn tail(map: &Mapping, list_offset: u64) -> u64 {
    read_tail(map, list_offset)
}

/// Links `offset` at the head of the list.
pub fn insert_head(map: &Mapping, list_offset: u64, link: Link, offset: u64) {
    let head = read_head(map, list_offset);
    set_next(map, offset, link, head);
    map.drain();
    if head == INVALID_OFFSET {
        write_tail(map, list_offset, offset);
        map.drain();
    }
    write_head(map, list_offset, offset);
    let _ = map.persist();
}

/// Links `offset` at the tail of the list.
pub fn insert_tail(map: &Mapping, list_offset: u64, link: Link, offset: u64) {
    set_next(map, offset, link, INVALID_OFFSET);
    map.drain();
    let old_tail = read_tail(map, list_offset);
    if old_tail == INVALID_OFFSET {
        // Empty list: write `tail` before `head`, the same order
        // `insert_head` uses for its own empty-list case. A crash after only
        // one of the two stores then still lands on a state `runtime_init`'s
        // `head == INVALID` branch can repair (it always resets tail to
        // INVALID when head is still INVALID). Writing `head` first would
        // leave a non-INVALID head with a stale INVALID tail, which
        // `runtime_init`'s non-empty path can't recover from.
        write_tail(map, list_offset, offset);
        map.drain();
        write_head(map, list_offset, offset);
    } else {
        set_next(map, old_tail, link, offset);
        map.drain();
        write_tail(map, list_offset, offset);
    }
    let _ = map.persist();
}

/// Unlinks the current head, leaving the list empty if it was the only node.
pub fn remove_head(map: &Mapping, list_offset: u64, link: Link) {
    let head = read_head(map, list_offset);
    debug_assert_ne!(head, INVALID_OFFSET, "remove_head on an empty list");
    let new_head = next_of(map, head, link);
    if new_head == INVALID_OFFSET {
        init(map, list_offset);
    } else {
        write_head(map, list_offset, new_head);
        let _ = map.persist();
    }
}

/// Removes `offset` from the list, wherever it is.
pub fn remove(map: &Mapping, list_offset: u64, link: Link, offset: u64) {
    let head = read_head(map, list_offset);
    if head == offset {
        remove_head(map, list_offset, link);
        return;
    }
    let mut pred = head;
    loop {
        debug_assert_ne!(pred, INVALID_OFFSET, "offset is not a member of this list");
        let next = next_of(map, pred, link);
        if next == offset {
            break;
        }
        pred = next;
    }
    let removed_next = next_of(map, offset, link);
    let was_tail = read_tail(map, list_offset) == offset;
    if was_tail {
        write_tail(map, list_offset, pred);
        map.drain();
    }
    set_next(map, pred, link, removed_next);
    let _ = map.persist();
}

/// Collects every node offset from `head` to `tail`, in order.
pub fn foreach(map: &Mapping, list_offset: u64, link: Link) -> Vec<u64> {
    let mut out = Vec::new();
    let mut cur = read_head(map, list_offset);
    while cur != INVALID_OFFSET {
        out.push(cur);
        cur = next_of(map, cur, link);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn region(map: &Mapping, offset: u64) {
        crate::span::create_region(map, offset, 64, INVALID_OFFSET, INVALID_OFFSET);
    }

    #[test]
    fn insert_and_foreach() {
        let mut map = Mapping::anonymous(8192).unwrap();
        let list_offset = 4096u64;
        init(&mut map, list_offset);
        for off in [128u64, 256, 384] {
            region(&mut map, off);
            insert_tail(&mut map, list_offset, Link::Free, off);
        }
        assert_eq!(foreach(&map, list_offset, Link::Free), vec![128, 256, 384]);
        assert_eq!(head(&map, list_offset), 128);
        assert_eq!(tail(&map, list_offset), 384);
    }

    #[test]
    fn insert_head_then_remove() {
        let mut map = Mapping::anonymous(8192).unwrap();
        let list_offset = 4096u64;
        init(&mut map, list_offset);
        for off in [128u64, 256, 384] {
            region(&mut map, off);
        }
        insert_head(&mut map, list_offset, Link::Allocated, 384);
        insert_head(&mut map, list_offset, Link::Allocated, 256);
        insert_head(&mut map, list_offset, Link::Allocated, 128);
        assert_eq!(
            foreach(&map, list_offset, Link::Allocated),
            vec![128, 256, 384]
        );

        remove(&mut map, list_offset, Link::Allocated, 256);
        assert_eq!(foreach(&map, list_offset, Link::Allocated), vec![128, 384]);
        assert_eq!(tail(&map, list_offset), 384);

        remove(&mut map, list_offset, Link::Allocated, 384);
        assert_eq!(foreach(&map, list_offset, Link::Allocated), vec![128]);
        assert_eq!(tail(&map, list_offset), 128);

        remove_head(&mut map, list_offset, Link::Allocated);
        assert!(is_empty(&map, list_offset));
        assert_eq!(tail(&map, list_offset), INVALID_OFFSET);
    }

    #[test]
    fn runtime_init_advances_torn_tail() {
        init_logging();
        let mut map = Mapping::anonymous(8192).unwrap();
        let list_offset = 4096u64;
        init(&mut map, list_offset);
        for off in [128u64, 256] {
            region(&mut map, off);
        }
        // Simulate a crash inside `insert_tail(256)` after the node link and
        // head (first insert) were published but before `tail` advanced.
        insert_tail(&mut map, list_offset, Link::Free, 128);
        set_next(&mut map, 128, Link::Free, 256);
        // tail still points at 128, as if the crash happened here.
        runtime_init(&mut map, list_offset, Link::Free);
        assert_eq!(tail(&map, list_offset), 256);
        assert_eq!(foreach(&map, list_offset, Link::Free), vec![128, 256]);
    }

    #[test]
    fn insert_tail_into_empty_list_crash_before_head_is_recoverable() {
        init_logging();
        let map = Mapping::anonymous(8192).unwrap();
        let list_offset = 4096u64;
        init(&map, list_offset);
        region(&map, 128);

        // Simulate a crash inside `insert_tail(128)` on an empty list after
        // `tail` was published but before `head` was: the node's own next
        // link and the list's tail both point at 128, but head is still
        // INVALID, as if the crash happened right here.
        set_next(&map, 128, Link::Free, INVALID_OFFSET);
        write_tail(&map, list_offset, 128);

        // Must not panic (the old head-first ordering would hit the
        // `debug_assert_ne!` in runtime_init's non-empty path) and must
        // recover to a consistent empty list.
        runtime_init(&map, list_offset, Link::Free);
        assert!(is_empty(&map, list_offset));
        assert_eq!(tail(&map, list_offset), INVALID_OFFSET);
        assert_eq!(foreach(&map, list_offset, Link::Free), Vec::<u64>::new());

        // The list must still be usable afterwards.
        insert_tail(&map, list_offset, Link::Free, 128);
        assert_eq!(foreach(&map, list_offset, Link::Free), vec![128]);
    }
}

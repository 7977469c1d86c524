//! MPMC reservation queue (§4.6): assigns globally monotonic timestamps to
//! concurrent appends and advances a contiguous "committed" watermark.
//!
//! Purely volatile — unlike the allocator and PSLL this never touches the
//! mapping — so it's reset from the recovered `persisted_timestamp` each
//! time a stream is opened (see [`MpmcQueue::reset`]).

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU64, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU64, Ordering};

use crate::header::INVALID_OFFSET;

/// Cache-line padded atomic slot, one per live producer, matching the
/// "cache-line-padded per-producer `granted_offset[N]`" layout in §3/§4.6.
#[repr(align(64))]
struct Slot(AtomicU64);

pub struct MpmcQueue {
    capacity: u64,
    produce_offset: AtomicU64,
    consume_offset: AtomicU64,
    granted: Vec<Slot>,
}

impl MpmcQueue {
    /// `max_concurrency` bounds the number of live producer slots; `capacity`
    /// bounds the total offset domain (effectively unlimited for a log that
    /// never recycles timestamps).
    pub fn new(max_concurrency: u64, capacity: u64) -> Self {
        let granted = (0..max_concurrency)
            .map(|_| Slot(AtomicU64::new(INVALID_OFFSET)))
            .collect();
        Self {
            capacity,
            produce_offset: AtomicU64::new(0),
            consume_offset: AtomicU64::new(0),
            granted,
        }
    }

    /// Resets the queue to a recovered watermark at open time.
    pub fn reset(&self, offset: u64) {
        self.produce_offset.store(offset, Ordering::Relaxed);
        self.consume_offset.store(offset, Ordering::Relaxed);
        for slot in &self.granted {
            slot.0.store(INVALID_OFFSET, Ordering::Relaxed);
        }
    }

    pub fn consumed_offset(&self) -> u64 {
        self.consume_offset.load(Ordering::Acquire)
    }

    /// Atomically publishes `granted[producer_id]` and advances
    /// `produce_offset` via CAS. Returns `None` (`OFFSET_MAX`) if the
    /// reservation would exceed capacity.
    pub fn acquire(&self, producer_id: u64, size: u64) -> Option<u64> {
        let idx = producer_id as usize;
        loop {
            let cur = self.produce_offset.load(Ordering::Relaxed);
            if cur.checked_add(size).map_or(true, |end| end > self.capacity) {
                return None;
            }
            if self
                .produce_offset
                .compare_exchange(cur, cur + size, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.granted[idx].0.store(cur, Ordering::Release);
                return Some(cur);
            }
        }
    }

    /// Marks `producer_id`'s slot idle again (the reservation has been
    /// durably written and is ready to be folded into the watermark).
    pub fn produce(&self, producer_id: u64) {
        self.granted[producer_id as usize]
            .0
            .store(INVALID_OFFSET, Ordering::Release);
    }

    /// Computes the lowest still-granted offset across producers and
    /// advances `consume_offset` to that bound. Returns
    /// `(old_consume_offset, bytes_ready)`.
    pub fn consume(&self) -> (u64, u64) {
        loop {
            let produce = self.produce_offset.load(Ordering::Relaxed);
            let mut min_granted = produce;
            for slot in &self.granted {
                let g = slot.0.load(Ordering::Acquire);
                if g != INVALID_OFFSET && g < min_granted {
                    min_granted = g;
                }
            }

            let old_consume = self.consume_offset.load(Ordering::Relaxed);
            let target = min_granted.max(old_consume);
            if target == old_consume {
                return (old_consume, 0);
            }
            if self
                .consume_offset
                .compare_exchange(old_consume, target, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return (old_consume, target - old_consume);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_producer_round_trip() {
        let q = MpmcQueue::new(4, u64::MAX);
        let off = q.acquire(0, 1).unwrap();
        assert_eq!(off, 0);
        q.produce(0);
        let (old, ready) = q.consume();
        assert_eq!((old, ready), (0, 1));
    }

    #[test]
    fn watermark_stalls_on_lowest_pending_producer() {
        let q = MpmcQueue::new(4, u64::MAX);
        let a = q.acquire(0, 1).unwrap();
        let b = q.acquire(1, 1).unwrap();
        assert!(a < b);

        // producer 1 (the later slot) finishes first; watermark must not advance.
        q.produce(1);
        let (_, ready) = q.consume();
        assert_eq!(ready, 0);

        q.produce(0);
        let (old, ready) = q.consume();
        assert_eq!(old, 0);
        assert_eq!(ready, 2);
    }

    #[test]
    fn capacity_exhaustion_returns_none() {
        let q = MpmcQueue::new(2, 1);
        assert!(q.acquire(0, 1).is_some());
        assert!(q.acquire(1, 1).is_none());
    }

    #[test]
    fn reset_reinitializes_watermark() {
        let q = MpmcQueue::new(2, u64::MAX);
        q.acquire(0, 1).unwrap();
        q.produce(0);
        q.consume();
        q.reset(10);
        assert_eq!(q.consumed_offset(), 10);
        let off = q.acquire(0, 1).unwrap();
        assert_eq!(off, 10);
    }
}

/// Model-checked interleavings of `acquire`/`produce`/`consume` across
/// producers, run with `cargo test --features loom`. Only this module
/// touches genuine standalone atomics (everything else threads through the
/// mapping with raw pointers and fences), so it's the one place loom can
/// say something real.
#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn two_producers_watermark_never_skips_a_pending_reservation() {
        loom::model(|| {
            let q = Arc::new(MpmcQueue::new(2, u64::MAX));

            let q0 = q.clone();
            let t0 = thread::spawn(move || {
                let off = q0.acquire(0, 1).unwrap();
                q0.produce(0);
                off
            });
            let q1 = q.clone();
            let t1 = thread::spawn(move || {
                let off = q1.acquire(1, 1).unwrap();
                q1.produce(1);
                off
            });

            t0.join().unwrap();
            t1.join().unwrap();

            let (old, ready) = q.consume();
            assert_eq!(old, 0);
            assert_eq!(ready, 2);
        });
    }

    #[test]
    fn watermark_stalls_until_earlier_producer_completes() {
        loom::model(|| {
            let q = Arc::new(MpmcQueue::new(2, u64::MAX));
            let a = q.acquire(0, 1).unwrap();
            let b = q.acquire(1, 1).unwrap();
            assert!(a < b);

            let q1 = q.clone();
            let t1 = thread::spawn(move || {
                q1.produce(1);
                q1.consume()
            });

            let (_, ready_before) = t1.join().unwrap();
            assert_eq!(ready_before, 0, "watermark must not skip producer 0");

            q.produce(0);
            let (old, ready) = q.consume();
            assert_eq!((old, ready), (0, 2));
        });
    }
}

//! Thread-id service (§4.8): a dense, reusable small integer id per live
//! thread, bounded by `max_concurrency`. A smallest-available-id allocator
//! with compaction, built over a `parking_lot::Mutex` guarding a `next_id`
//! counter and a set of released ids below it — the same "concurrent
//! structure behind a lock used only for bookkeeping" shape as the region
//! runtime map (§4.4).

use std::cell::Cell;
use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LogError, LogResult};

#[derive(Debug)]
struct Inner {
    max_concurrency: u64,
    next_id: u64,
    released: BTreeSet<u64>,
}

impl Inner {
    fn acquire(&mut self) -> LogResult<u64> {
        if let Some(&id) = self.released.iter().next() {
            self.released.remove(&id);
            return Ok(id);
        }
        if self.next_id >= self.max_concurrency {
            return Err(LogError::TooManyThreads(self.max_concurrency));
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    fn release(&mut self, id: u64) {
        if id + 1 == self.next_id {
            // the just-released id was the newest one ever handed out;
            // compact `next_id` downward past any other trailing released ids.
            self.next_id = id;
            while let Some(&top) = self.released.iter().next_back() {
                if top + 1 == self.next_id {
                    self.released.remove(&top);
                    self.next_id = top;
                } else {
                    break;
                }
            }
        } else {
            self.released.insert(id);
        }
    }
}

/// Owns the shared allocator state; thread-locals borrow an `Arc` to it and
/// release their id when the thread exits.
#[derive(Debug, Clone)]
pub struct ThreadIdService {
    inner: Arc<Mutex<Inner>>,
}

impl ThreadIdService {
    pub fn new(max_concurrency: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                max_concurrency,
                next_id: 0,
                released: BTreeSet::new(),
            })),
        }
    }

    /// Returns this thread's id, acquiring and caching one on first use.
    pub fn id_for_current_thread(&self) -> LogResult<u64> {
        thread_local! {
            static CACHED: Cell<Option<(usize, u64)>> = Cell::new(None);
        }

        let service_key = Arc::as_ptr(&self.inner) as usize;
        if let Some((key, id)) = CACHED.with(|c| c.get()) {
            if key == service_key {
                return Ok(id);
            }
        }

        let id = self.inner.lock().acquire()?;
        let guard = ReleaseOnDrop {
            service: self.clone(),
            id,
        };
        CACHED.with(|c| c.set(Some((service_key, id))));
        RELEASE_GUARDS.with(|g| g.borrow_mut().push(guard));
        Ok(id)
    }
}

struct ReleaseOnDrop {
    service: ThreadIdService,
    id: u64,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.service.inner.lock().release(self.id);
    }
}

thread_local! {
    static RELEASE_GUARDS: std::cell::RefCell<Vec<ReleaseOnDrop>> = std::cell::RefCell::new(Vec::new());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_dense_and_reuses_released_ids() {
        let svc = ThreadIdService::new(4);
        let a = svc.inner.lock().acquire().unwrap();
        let b = svc.inner.lock().acquire().unwrap();
        let c = svc.inner.lock().acquire().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        svc.inner.lock().release(b);
        let d = svc.inner.lock().acquire().unwrap();
        assert_eq!(d, 1, "the smallest released id must be reused first");
    }

    #[test]
    fn release_of_newest_id_compacts_next_id() {
        let svc = ThreadIdService::new(8);
        let ids: Vec<_> = (0..4).map(|_| svc.inner.lock().acquire().unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);

        svc.inner.lock().release(2);
        svc.inner.lock().release(3);
        // next_id should compact down to 2 (both 2 and 3 released, contiguous
        // with the old next_id of 4).
        assert_eq!(svc.inner.lock().next_id, 2);

        let reacquired = svc.inner.lock().acquire().unwrap();
        assert_eq!(reacquired, 2);
    }

    #[test]
    fn exhausting_max_concurrency_errors() {
        let svc = ThreadIdService::new(1);
        svc.inner.lock().acquire().unwrap();
        assert!(matches!(
            svc.inner.lock().acquire(),
            Err(LogError::TooManyThreads(1))
        ));
    }

    #[test]
    fn per_thread_id_is_cached_across_calls() {
        let svc = ThreadIdService::new(4);
        let first = svc.id_for_current_thread().unwrap();
        let second = svc.id_for_current_thread().unwrap();
        assert_eq!(first, second);
    }
}

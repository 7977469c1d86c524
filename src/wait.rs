//! Futex-style park/wake used to block `append`/`publish` on the durable
//! watermark (§4.7, §5) instead of busy-spinning.
//!
//! Adapted directly from the transport crate's `wait` module (native target
//! only — this engine has no wasm32 story, so that arm is dropped). The
//! watermark itself (`persisted_timestamp`) is a `u64`; `atomic-wait` parks
//! on 32-bit words, so the stream keeps a companion `AtomicU32` "epoch"
//! counter that's bumped every time the watermark advances, and waiters
//! park on that instead, re-checking the real 64-bit value on each wake.

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, Ordering};

/// Result of attempting to wait on an atomic location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The value no longer matched (or a wake was observed).
    Changed,
    /// The wait timed out before a notify was observed.
    TimedOut,
}

#[cfg(feature = "loom")]
mod imp {
    use super::{AtomicU32, WaitResult};

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
        let _ = (atomic, expected);
        loom::thread::yield_now();
        WaitResult::Changed
    }

    #[inline]
    pub(crate) fn wake_one(atomic: &AtomicU32) {
        let _ = atomic;
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        let _ = atomic;
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    use super::{AtomicU32, WaitResult};

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
        atomic_wait::wait(atomic, expected);
        WaitResult::Changed
    }

    #[inline]
    pub(crate) fn wake_one(atomic: &AtomicU32) {
        atomic_wait::wake_one(atomic as *const AtomicU32);
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        atomic_wait::wake_all(atomic as *const AtomicU32);
    }
}

/// Blocks the current caller until the atomic differs from `expected`.
#[inline]
pub fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
    imp::wait_u32(atomic, expected)
}

/// Wakes at most one waiter parked on `atomic`.
#[inline]
pub fn wake_one(atomic: &AtomicU32) {
    imp::wake_one(atomic)
}

/// Wakes all waiters parked on `atomic`.
#[inline]
pub fn wake_all(atomic: &AtomicU32) {
    imp::wake_all(atomic)
}

/// Captures the current value and waits for a change, matching the
/// load/wait pair callers need to avoid missing a concurrent wake.
#[inline]
pub fn wait_for_change(atomic: &AtomicU32, order: Ordering) -> WaitResult {
    let expected = atomic.load(order);
    wait_u32(atomic, expected)
}

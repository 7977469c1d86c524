//! Backing mapping for the log: a byte-addressable arena plus the small
//! capability record (memcpy/memset/flush/drain/persist) the rest of the
//! engine is built against.
//!
//! Real persistent memory exposes these as CPU intrinsics (`CLWB`/`SFENCE`);
//! on a regular file-backed or anonymous mapping the closest equivalents are
//! `msync`-style flush and a compiler/memory fence. [`Mapping`] wraps either
//! a real file (crash-durable across process restarts) or an anonymous
//! region (heap-like, for tests that don't want a temp file).

use std::fs::OpenOptions;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};

use crate::error::{LogError, LogResult};

#[derive(Debug)]
enum Backing {
    File(memmap2::MmapMut),
    Anonymous(memmap2::MmapMut),
}

impl Backing {
    fn as_ptr(&self) -> *const u8 {
        match self {
            Backing::File(m) | Backing::Anonymous(m) => m.as_ptr(),
        }
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        match self {
            Backing::File(m) | Backing::Anonymous(m) => m.len(),
        }
    }

    fn flush(&self) -> LogResult<()> {
        match self {
            Backing::File(m) => m.flush().map_err(LogError::Io),
            Backing::Anonymous(_) => Ok(()),
        }
    }
}

/// A single memory-mapped arena backing a stream.
///
/// `base()`/`base_mut()` hand out raw pointers; everything above this module
/// works in terms of `u64` byte offsets from that base (the arena+index
/// idiom — no pointers are ever persisted).
#[derive(Debug)]
pub struct Mapping {
    backing: Backing,
}

impl Mapping {
    /// Opens (creating if necessary) a file-backed mapping of exactly `size` bytes.
    pub fn open_file(path: impl AsRef<Path>, size: u64) -> LogResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(size)?;
        // SAFETY: `file` outlives this call; `MmapMut::map_mut` duplicates the fd
        // internally per `memmap2`'s contract.
        let map = unsafe { memmap2::MmapMut::map_mut(&file)? };
        Ok(Self {
            backing: Backing::File(map),
        })
    }

    /// Allocates an anonymous, non-file-backed mapping of `size` bytes.
    ///
    /// Behaves like persistent memory within the process but is discarded on
    /// drop; used by tests that want crash-recovery semantics without a temp
    /// file, and by [`crate::PmemLog::open_anonymous`].
    pub fn anonymous(size: usize) -> LogResult<Self> {
        let map = memmap2::MmapOptions::new().len(size).map_anon()?;
        Ok(Self {
            backing: Backing::Anonymous(map),
        })
    }

    pub fn len(&self) -> u64 {
        self.backing.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.backing.len() == 0
    }

    pub fn base(&self) -> NonNull<u8> {
        NonNull::new(self.backing.as_ptr() as *mut u8).expect("mapping base is never null")
    }

    /// Hands out the same base address as [`Mapping::base`], typed as
    /// mutable. Callers are responsible for the concurrency discipline that
    /// makes a store through it sound (the allocator mutex, a region's CAS
    /// append-offset protocol, or exclusive access during open/format) —
    /// mirroring how real PMEM is written through a shared mapping.
    pub fn base_mut(&self) -> NonNull<u8> {
        NonNull::new(self.backing.as_mut_ptr()).expect("mapping base is never null")
    }

    /// Reads a `T` at `offset` bytes from the arena base.
    ///
    /// # Safety
    /// `offset + size_of::<T>()` must not exceed `self.len()`.
    pub unsafe fn read_at<T: Copy>(&self, offset: u64) -> T {
        let ptr = self.base().as_ptr().add(offset as usize) as *const T;
        ptr.read_unaligned()
    }

    /// Writes `value` at `offset` bytes from the arena base. Does not flush.
    ///
    /// # Safety
    /// `offset + size_of::<T>()` must not exceed `self.len()`.
    pub unsafe fn write_at<T: Copy>(&self, offset: u64, value: T) {
        let ptr = self.base_mut().as_ptr().add(offset as usize) as *mut T;
        ptr.write_unaligned(value);
    }

    /// Zeroes `len` bytes starting at `offset`. On real PMEM this would be a
    /// non-temporal store loop; here it is `write_bytes`, swappable per §9's
    /// capability-record note without touching callers.
    ///
    /// # Safety
    /// `offset + len` must not exceed `self.len()`.
    pub unsafe fn zero_at(&self, offset: u64, len: usize) {
        let ptr = self.base_mut().as_ptr().add(offset as usize);
        ptr.write_bytes(0, len);
    }

    /// Copies `src` into the arena at `offset`. Does not flush.
    ///
    /// # Safety
    /// `offset + src.len()` must not exceed `self.len()`.
    pub unsafe fn copy_at(&self, offset: u64, src: &[u8]) {
        let ptr = self.base_mut().as_ptr().add(offset as usize);
        ptr.copy_from_nonoverlapping(src.as_ptr(), src.len());
    }

    /// Borrows `len` bytes at `offset` directly out of the mapping.
    ///
    /// # Safety
    /// `offset + len` must not exceed `self.len()`.
    pub unsafe fn slice_at(&self, offset: u64, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.base().as_ptr().add(offset as usize), len)
    }

    /// Borrows `len` bytes at `offset` as mutable, directly out of the mapping.
    ///
    /// # Safety
    /// `offset + len` must not exceed `self.len()`, and the caller must hold
    /// exclusive claim on that byte range (e.g. a region's reservation).
    pub unsafe fn slice_at_mut(&self, offset: u64, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.base_mut().as_ptr().add(offset as usize), len)
    }

    /// Flushes all dirty pages to the backing store (a no-op for anonymous
    /// mappings) and issues a store fence so prior writes are ordered
    /// before anything that follows.
    pub fn persist(&self) -> LogResult<()> {
        self.backing.flush()?;
        fence(Ordering::Release);
        Ok(())
    }

    /// Orders preceding stores before subsequent ones without forcing them
    /// to media; used between dependent stores inside a single operation
    /// (PSLL link updates, allocator header fields) where §4.2 calls for a
    /// `drain` without a full `persist`.
    pub fn drain(&self) {
        fence(Ordering::Release);
    }
}

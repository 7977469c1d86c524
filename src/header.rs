//! On-media stream header and allocator header (§3, §6).
//!
//! These are the only structures that live at a fixed offset (0) in the
//! mapping; everything else is addressed relative to the arena that starts
//! right after this header, block-size aligned.

/// Sentinel meaning "no timestamp has been persisted yet".
pub const INVALID_TIMESTAMP: u64 = 0;
/// The first timestamp ever granted by the MPMC queue.
pub const FIRST_TIMESTAMP: u64 = 1;
/// Sentinel meaning "no offset" (list terminator, idle producer slot, ...).
pub const INVALID_OFFSET: u64 = u64::MAX;
/// Top bit of `append_offset`: set while the region's tail has not yet been zeroed.
pub const DIRTY_BIT: u64 = 1 << 63;

pub const SIGNATURE_SIZE: usize = 64;
const SIGNATURE_TAG: &[u8] = b"PMEMLOG1";

fn signature_bytes() -> [u8; SIGNATURE_SIZE] {
    let mut sig = [0u8; SIGNATURE_SIZE];
    sig[..SIGNATURE_TAG.len()].copy_from_slice(SIGNATURE_TAG);
    sig
}

fn is_zero_signature(sig: &[u8; SIGNATURE_SIZE]) -> bool {
    sig.iter().all(|b| *b == 0)
}

/// Head/tail pair for one of the allocator's two PSLL instances.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ListHead {
    pub head: u64,
    pub tail: u64,
}

impl ListHead {
    pub const INVALID: ListHead = ListHead {
        head: INVALID_OFFSET,
        tail: INVALID_OFFSET,
    };
}

/// Embedded allocator state (§3 "Allocator header").
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct AllocatorHeader {
    pub free_list: ListHead,
    pub allocated_list: ListHead,
    /// Watermark of bytes ever assigned to the free list (arena growth point).
    pub free_offset: u64,
    /// Total size of the allocator's arena (bytes available for spans).
    pub total_size: u64,
    /// Redo-log sentinel: offset of a region currently being freed, or INVALID_OFFSET.
    pub offset_to_free: u64,
}

/// The stream header at offset 0 of the mapping (§3, §6).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct StreamHeader {
    pub signature: [u8; SIGNATURE_SIZE],
    pub stream_size: u64,
    pub block_size: u64,
    pub persisted_timestamp: u64,
    pub allocator: AllocatorHeader,
}

impl StreamHeader {
    pub fn is_initialized(&self) -> bool {
        !is_zero_signature(&self.signature)
    }

    /// Builds the header for a freshly formatted stream. The signature field
    /// is left zeroed; callers must write it last, per the crash-consistency
    /// invariant in §3 ("signature is written last during initialization").
    ///
    /// `free_offset` starts at the arena's base (just past this header,
    /// block-size aligned) and `total_size` is the absolute offset one past
    /// the last usable arena byte — i.e. `stream_size` itself, since the
    /// arena runs to the end of the mapping.
    pub fn fresh(stream_size: u64, block_size: u64) -> Self {
        Self {
            signature: [0u8; SIGNATURE_SIZE],
            stream_size,
            block_size,
            persisted_timestamp: INVALID_TIMESTAMP,
            allocator: AllocatorHeader {
                free_list: ListHead::INVALID,
                allocated_list: ListHead::INVALID,
                free_offset: arena_offset(block_size),
                total_size: stream_size,
                offset_to_free: INVALID_OFFSET,
            },
        }
    }

    pub fn signature_for_init() -> [u8; SIGNATURE_SIZE] {
        signature_bytes()
    }
}

/// Byte offset of the stream header; always the start of the mapping.
pub const STREAM_HEADER_OFFSET: u64 = 0;

pub fn arena_offset(block_size: u64) -> u64 {
    crate::span::align_up(std::mem::size_of::<StreamHeader>() as u64, block_size)
}

/// Byte offsets of `StreamHeader`/`AllocatorHeader` fields within the
/// mapping. All fields are `u64` (or a byte array) laid out `repr(C)` with no
/// padding, so these are computed from the preceding fields' sizes rather
/// than via reflection.
pub const PERSISTED_TIMESTAMP_OFFSET: u64 = SIGNATURE_SIZE as u64 + 8 + 8;
pub const ALLOCATOR_HEADER_OFFSET: u64 = PERSISTED_TIMESTAMP_OFFSET + 8;

pub const FREE_LIST_OFFSET: u64 = ALLOCATOR_HEADER_OFFSET;
pub const ALLOCATED_LIST_OFFSET: u64 = FREE_LIST_OFFSET + 16;
pub const FREE_OFFSET_OFFSET: u64 = ALLOCATED_LIST_OFFSET + 16;
pub const TOTAL_SIZE_OFFSET: u64 = FREE_OFFSET_OFFSET + 8;
pub const OFFSET_TO_FREE_OFFSET: u64 = TOTAL_SIZE_OFFSET + 8;

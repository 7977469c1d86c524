//! Span layer (§4.1): typed framing of variable-length records on media.
//!
//! Every span starts with an 8-byte word whose top two bits carry the type
//! and whose low 62 bits carry the payload size. `EMPTY` is also the
//! interpretation of a zero-initialized word, which doubles as the implicit
//! tail marker for a region's entry area.

use crate::error::{LogError, LogResult};
use crate::header::INVALID_TIMESTAMP;
use crate::mem::Mapping;

const TYPE_SHIFT: u32 = 62;
const SIZE_MASK: u64 = (1u64 << TYPE_SHIFT) - 1;

const TYPE_EMPTY: u64 = 0b00;
const TYPE_ENTRY: u64 = 0b10;
const TYPE_REGION: u64 = 0b11;

/// Header size of the base (type/size) word alone.
pub const BASE_HEADER_SIZE: u64 = 8;
/// Header size of an entry span: the base word plus its `timestamp` field.
pub const ENTRY_HEADER_SIZE: u64 = 16;
/// Header size of a region span: cache-line aligned body (base word, two
/// list links, `max_valid_timestamp`, padding to 64 bytes).
pub const REGION_HEADER_SIZE: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanType {
    Empty,
    Entry,
    Region,
}

impl SpanType {
    fn from_bits(bits: u64) -> LogResult<Self> {
        match bits {
            TYPE_EMPTY => Ok(SpanType::Empty),
            TYPE_ENTRY => Ok(SpanType::Entry),
            TYPE_REGION => Ok(SpanType::Region),
            _ => Err(LogError::CorruptRegion(0)),
        }
    }

    fn bits(self) -> u64 {
        match self {
            SpanType::Empty => TYPE_EMPTY,
            SpanType::Entry => TYPE_ENTRY,
            SpanType::Region => TYPE_REGION,
        }
    }

    pub fn header_size(self) -> u64 {
        match self {
            SpanType::Empty => BASE_HEADER_SIZE,
            SpanType::Entry => ENTRY_HEADER_SIZE,
            SpanType::Region => REGION_HEADER_SIZE,
        }
    }
}

/// A decoded span header at some offset in the arena.
#[derive(Debug, Clone, Copy)]
pub struct SpanView {
    pub offset: u64,
    pub span_type: SpanType,
    /// Payload size in bytes (excludes the header).
    pub size: u64,
}

impl SpanView {
    /// `data_offset`: where the payload begins.
    pub fn data_offset(&self) -> u64 {
        self.offset + self.span_type.header_size()
    }

    /// Header size + payload, rounded up to 8 (§4.1).
    pub fn total_size(&self) -> u64 {
        align_up(self.span_type.header_size() + self.size, 8)
    }
}

/// Region span extra fields, stored immediately after the base word.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RegionSpanBody {
    pub next_allocated: u64,
    pub next_free: u64,
    pub max_valid_timestamp: u64,
}

/// Entry span extra fields, stored immediately after the base word.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct EntrySpanBody {
    pub timestamp: u64,
}

pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

/// Reads the type/size word at `offset` and returns a typed view.
///
/// Precondition: `offset` is 8-byte aligned and within the arena.
pub fn span_at(map: &Mapping, offset: u64) -> LogResult<SpanView> {
    if offset % 8 != 0 || offset + BASE_HEADER_SIZE > map.len() {
        return Err(LogError::CorruptRegion(offset));
    }
    // SAFETY: bounds checked above.
    let word: u64 = unsafe { map.read_at(offset) };
    let span_type = SpanType::from_bits(word >> TYPE_SHIFT).map_err(|_| LogError::CorruptRegion(offset))?;
    let size = word & SIZE_MASK;
    let view = SpanView {
        offset,
        span_type,
        size,
    };
    if view.offset + view.total_size() > map.len() {
        return Err(LogError::CorruptRegion(offset));
    }
    Ok(view)
}

fn write_word(map: &Mapping, offset: u64, span_type: SpanType, size: u64) {
    debug_assert!(size <= SIZE_MASK, "span payload size overflows 62 bits");
    let word = (span_type.bits() << TYPE_SHIFT) | (size & SIZE_MASK);
    // SAFETY: callers guarantee `offset` is in-bounds for an 8-byte word.
    unsafe { map.write_at(offset, word) };
}

/// Writes an entry span header (type/size word + timestamp). Caller persists.
pub fn create_entry(map: &Mapping, dest: u64, size: u64, timestamp: u64) {
    write_word(map, dest, SpanType::Entry, size);
    let body = EntrySpanBody { timestamp };
    // SAFETY: entry header reserves ENTRY_HEADER_SIZE bytes starting at `dest`.
    unsafe { map.write_at(dest + BASE_HEADER_SIZE, body) };
}

/// Writes a region span header. `max_valid_timestamp` stays reserved and is
/// always `INVALID_TIMESTAMP` (see the Open Question resolution in
/// DESIGN.md) regardless of the argument's default.
pub fn create_region(
    map: &Mapping,
    dest: u64,
    size: u64,
    next_allocated: u64,
    next_free: u64,
) {
    write_word(map, dest, SpanType::Region, size);
    let body = RegionSpanBody {
        next_allocated,
        next_free,
        max_valid_timestamp: INVALID_TIMESTAMP,
    };
    // SAFETY: region header reserves REGION_HEADER_SIZE bytes starting at `dest`.
    unsafe { map.write_at(dest + BASE_HEADER_SIZE, body) };
}

/// Zeroes `total_size` bytes at `dest`, re-establishing the implicit EMPTY
/// interpretation of a zero word.
pub fn clear_to_empty(map: &Mapping, dest: u64, total_size: u64) {
    // SAFETY: caller guarantees `dest + total_size` is in-bounds.
    unsafe { map.zero_at(dest, total_size as usize) };
}

pub fn read_region_body(map: &Mapping, span_offset: u64) -> RegionSpanBody {
    // SAFETY: caller has already validated `span_offset` is a REGION span.
    unsafe { map.read_at(span_offset + BASE_HEADER_SIZE) }
}

pub fn write_region_body(map: &Mapping, span_offset: u64, body: RegionSpanBody) {
    // SAFETY: caller has already validated `span_offset` is a REGION span.
    unsafe { map.write_at(span_offset + BASE_HEADER_SIZE, body) };
}

pub fn read_entry_body(map: &Mapping, span_offset: u64) -> EntrySpanBody {
    // SAFETY: caller has already validated `span_offset` is an ENTRY span.
    unsafe { map.read_at(span_offset + BASE_HEADER_SIZE) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trip() {
        let mut map = Mapping::anonymous(4096).unwrap();
        create_entry(&mut map, 64, 5, 42);
        let view = span_at(&map, 64).unwrap();
        assert_eq!(view.span_type, SpanType::Entry);
        assert_eq!(view.size, 5);
        assert_eq!(view.data_offset(), 64 + ENTRY_HEADER_SIZE);
        assert_eq!(view.total_size(), align_up(ENTRY_HEADER_SIZE + 5, 8));
        let body = read_entry_body(&map, 64);
        assert_eq!(body.timestamp, 42);
    }

    #[test]
    fn region_round_trip() {
        let mut map = Mapping::anonymous(4096).unwrap();
        create_region(&mut map, 0, 1024, 7, 9);
        let view = span_at(&map, 0).unwrap();
        assert_eq!(view.span_type, SpanType::Region);
        assert_eq!(view.size, 1024);
        let body = read_region_body(&map, 0);
        assert_eq!(body.next_allocated, 7);
        assert_eq!(body.next_free, 9);
        assert_eq!(body.max_valid_timestamp, INVALID_TIMESTAMP);
    }

    #[test]
    fn zeroed_word_reads_as_empty() {
        let map = Mapping::anonymous(4096).unwrap();
        let view = span_at(&map, 0).unwrap();
        assert_eq!(view.span_type, SpanType::Empty);
        assert_eq!(view.size, 0);
    }

    #[test]
    fn corrupt_type_bits_are_rejected() {
        let mut map = Mapping::anonymous(4096).unwrap();
        // bits 10 would be ENTRY; there is no fourth type, only 00/10/11 are valid,
        // so the only way to get an error is a span whose declared size runs past
        // the mapping.
        write_word(&mut map, 0, SpanType::Entry, (map.len() - 8) + 1);
        assert!(span_at(&map, 0).is_err());
    }
}

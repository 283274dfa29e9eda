//! Packed roll pointers naming an undo record.

use std::fmt;

use crate::types::{Result, SombraError};

/// Length of the encoded [`RollPtr`] in bytes.
pub const ROLL_PTR_LEN: usize = 7;
/// Number of undo segments addressable by a roll pointer.
pub const UNDO_SEGMENTS: u8 = 128;

const INSERT_FLAG_POS: u32 = 55;
const SEGMENT_POS: u32 = 48;
const PAGE_POS: u32 = 16;

/// Pointer from a row version to the undo record that rebuilds its predecessor.
///
/// Layout, most significant first: insert flag (1 bit), undo segment (7 bits),
/// undo page (32 bits), byte offset inside the page (16 bits). The insert flag
/// marks a version created by an insert; traversal stops there.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub struct RollPtr(u64);

impl RollPtr {
    /// Pointer that references nothing.
    pub const fn null() -> Self {
        Self(0)
    }

    /// Pointer written by purge when a row's history is reset; it carries the
    /// insert flag and no location.
    pub const fn insert_sentinel() -> Self {
        Self(1 << INSERT_FLAG_POS)
    }

    /// Packs a pointer.
    pub fn new(is_insert: bool, segment: u8, page: u32, offset: u16) -> Result<Self> {
        if segment >= UNDO_SEGMENTS {
            return Err(SombraError::Invalid("undo segment out of range"));
        }
        let flag = if is_insert { 1u64 << INSERT_FLAG_POS } else { 0 };
        Ok(Self(
            flag | (u64::from(segment) << SEGMENT_POS)
                | (u64::from(page) << PAGE_POS)
                | u64::from(offset),
        ))
    }

    /// Returns `true` when the pointer references no entry.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` when the version was created by an insert.
    pub const fn is_insert(self) -> bool {
        (self.0 >> INSERT_FLAG_POS) & 1 == 1
    }

    /// Returns `true` when traversal must stop at this pointer.
    pub const fn ends_chain(self) -> bool {
        self.is_null() || self.is_insert()
    }

    /// Undo segment number.
    pub const fn segment(self) -> u8 {
        ((self.0 >> SEGMENT_POS) & 0x7f) as u8
    }

    /// Undo page number inside the segment.
    pub const fn page(self) -> u32 {
        ((self.0 >> PAGE_POS) & 0xffff_ffff) as u32
    }

    /// Byte offset inside the page.
    pub const fn offset(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Same location with the insert flag cleared; the undo store's key.
    pub const fn location(self) -> u64 {
        self.0 & !(1 << INSERT_FLAG_POS)
    }

    /// Creates a pointer from its raw representation.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw & ((1 << (INSERT_FLAG_POS + 1)) - 1))
    }

    /// Returns the raw representation.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Encodes the pointer into big-endian bytes.
    pub fn to_bytes(self) -> [u8; ROLL_PTR_LEN] {
        let mut out = [0u8; ROLL_PTR_LEN];
        out.copy_from_slice(&self.0.to_be_bytes()[8 - ROLL_PTR_LEN..]);
        out
    }

    /// Decodes a pointer from a big-endian byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let head = bytes
            .get(..ROLL_PTR_LEN)
            .ok_or(SombraError::Corruption("roll pointer truncated"))?;
        let mut buf = [0u8; 8];
        buf[8 - ROLL_PTR_LEN..].copy_from_slice(head);
        Ok(Self(u64::from_be_bytes(buf)))
    }
}

impl fmt::Display for RollPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{}:{}",
            if self.is_insert() { "i" } else { "u" },
            self.segment(),
            self.page(),
            self.offset()
        )
    }
}

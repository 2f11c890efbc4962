// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Segment header layout.
//!
//! ```text
//! offset  size  field
//! 0       4     format_version   (u32 LE)
//! 4       4     header_size      (u32 LE)
//! 8       8     capacity         (u64 LE)
//! 16      8     current_size     (u64 LE)
//! header_size   payload (capacity bytes)
//! ```
//!
//! `header_size` tells a reader where the payload starts. Fields beyond what
//! a reader knows are skipped; fields a shorter (older) header lacks read as
//! zero. A zero `header_size` means nobody initialized the segment yet.

/// Format written by this crate.
pub const FORMAT_VERSION: u32 = 1;

/// Size of the header written by this crate.
pub const HEADER_SIZE: usize = 24;

const VERSION_AT: usize = 0;
const HEADER_SIZE_AT: usize = 4;
const CAPACITY_AT: usize = 8;
const CURRENT_SIZE_AT: usize = 16;

/// Decoded segment header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentHeader {
    pub format_version: u32,
    pub header_size: u32,
    pub capacity: u64,
    pub current_size: u64,
}

impl SegmentHeader {
    /// Fresh header for an empty segment of `capacity` payload bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            header_size: HEADER_SIZE as u32,
            capacity: capacity as u64,
            current_size: 0,
        }
    }

    /// Decode from the start of a mapping. Never reads past `buf` or past
    /// the stored `header_size`.
    pub fn read_from(buf: &[u8]) -> Self {
        let mut header = Self {
            format_version: read_u32(buf, VERSION_AT).unwrap_or(0),
            header_size: read_u32(buf, HEADER_SIZE_AT).unwrap_or(0),
            ..Self::default()
        };
        let known = (header.header_size as usize).min(buf.len());
        if known >= CAPACITY_AT + 8 {
            header.capacity = read_u64(buf, CAPACITY_AT).unwrap_or(0);
        }
        if known >= CURRENT_SIZE_AT + 8 {
            header.current_size = read_u64(buf, CURRENT_SIZE_AT).unwrap_or(0);
        }
        header
    }

    /// Encode into the start of a mapping. Fields that do not fit the
    /// stored `header_size` are not written; payload bytes are never touched.
    pub fn write_to(&self, buf: &mut [u8]) {
        let limit = (self.header_size as usize).min(buf.len());
        write_bytes(buf, limit, VERSION_AT, &self.format_version.to_le_bytes());
        write_bytes(buf, limit, HEADER_SIZE_AT, &self.header_size.to_le_bytes());
        write_bytes(buf, limit, CAPACITY_AT, &self.capacity.to_le_bytes());
        write_bytes(buf, limit, CURRENT_SIZE_AT, &self.current_size.to_le_bytes());
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.header_size != 0
    }

    /// Version 0 headers predate abandonment recovery and are never sanitized.
    #[inline]
    pub fn supports_sanitize(&self) -> bool {
        self.format_version >= 1
    }

    /// Whether `current_size` can be stored at all.
    #[inline]
    pub fn tracks_size(&self) -> bool {
        self.header_size as usize >= CURRENT_SIZE_AT + 8
    }

    #[inline]
    pub fn payload_offset(&self) -> usize {
        self.header_size as usize
    }

    /// Header plus payload, in bytes. `None` when a corrupt header
    /// describes more than the address space.
    #[inline]
    pub fn total_len(&self) -> Option<usize> {
        usize::try_from(self.capacity)
            .ok()
            .and_then(|capacity| self.payload_offset().checked_add(capacity))
    }
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    buf.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
}

fn write_bytes(buf: &mut [u8], limit: usize, at: usize, bytes: &[u8]) {
    if at + bytes.len() <= limit {
        buf[at..at + bytes.len()].copy_from_slice(bytes);
    }
}

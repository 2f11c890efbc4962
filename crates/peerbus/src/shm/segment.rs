// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A named mapped segment guarded by a named cross-process mutex.
//!
//! Header and payload are only touched while a [`SegmentGuard`] is alive.
//! The guard holds two locks: an in-process one that serializes threads
//! sharing this mapping (and protects remapping), and the named mutex that
//! serializes processes. Dropping the guard releases both.

use super::header::{SegmentHeader, HEADER_SIZE};
use super::metrics::global_metrics;
use super::region::SharedMemory;
use crate::error::{Error, Result};
use crate::sync::{self, LockOutcome, NamedMutex};
use parking_lot::{Mutex, MutexGuard};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Lock wait used while initializing or growing a freshly opened segment.
const INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Intent of an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// One mapping of a named segment in this process.
pub struct MappedSegment {
    name: String,
    region: Mutex<SharedMemory>,
    lock: Box<dyn NamedMutex>,
    auto_sanitize: bool,
    remove_on_drop: AtomicBool,
}

impl std::fmt::Debug for MappedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedSegment")
            .field("name", &self.name)
            .field("auto_sanitize", &self.auto_sanitize)
            .finish_non_exhaustive()
    }
}

impl MappedSegment {
    /// Attach to `name`, creating it with `capacity` payload bytes when it
    /// does not exist yet. An existing segment smaller than `capacity` is
    /// grown in place.
    pub fn open_or_create(name: &str, capacity: usize, auto_sanitize: bool) -> Result<Self> {
        let (region, created) = SharedMemory::open_or_create(name, HEADER_SIZE + capacity)?;
        let segment = Self::with_region(name, region, auto_sanitize)?;

        {
            let mut guard = segment.acquire(AccessMode::Write, INIT_TIMEOUT)?;
            let header = guard.header();
            if !header.is_initialized() {
                let mapped = guard.region.len().saturating_sub(HEADER_SIZE);
                guard.store_header(SegmentHeader::new(mapped));
            } else if (header.capacity as usize) < capacity {
                guard.grow(capacity)?;
            }
        }

        if created {
            log::debug!("[shm] Created segment {} ({} bytes)", name, capacity);
        }
        Ok(segment)
    }

    /// Attach to a segment some other party created.
    pub fn open_existing(name: &str, auto_sanitize: bool) -> Result<Self> {
        let region = SharedMemory::open_existing(name)?;
        Self::with_region(name, region, auto_sanitize)
    }

    fn with_region(name: &str, region: SharedMemory, auto_sanitize: bool) -> Result<Self> {
        let lock = sync::open_mutex(&sync::mutex_name(name)).map_err(|e| match e {
            Error::Sync { name, source } => Error::Map { name, source },
            other => other,
        })?;
        Ok(Self {
            name: name.to_string(),
            region: Mutex::new(region),
            lock,
            auto_sanitize,
            remove_on_drop: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the segment's name now refers to a newer object, for example
    /// after its writer was closed and created again.
    pub fn is_replaced(&self) -> bool {
        self.region.lock().is_replaced()
    }

    /// Delete the OS objects when this mapping is dropped.
    pub fn set_remove_on_drop(&self, remove: bool) {
        self.remove_on_drop.store(remove, Ordering::Release);
    }

    /// Lock the segment for at most `timeout`.
    ///
    /// A lock recovered from a crashed holder has its payload size reset to
    /// zero (when sanitizing is enabled and the header format supports it),
    /// so a half-written payload is never handed out.
    pub fn acquire(&self, mode: AccessMode, timeout: Duration) -> Result<SegmentGuard<'_>> {
        let start = Instant::now();
        let Some(region) = self.region.try_lock_for(timeout) else {
            global_metrics().inc_lock_timeouts();
            return Err(Error::LockTimeout(self.name.clone()));
        };

        let remaining = timeout.saturating_sub(start.elapsed());
        let outcome = self.lock.lock(remaining)?;
        if outcome == LockOutcome::TimedOut {
            global_metrics().inc_lock_timeouts();
            log::debug!("[shm] Lock timeout on {}", self.name);
            return Err(Error::LockTimeout(self.name.clone()));
        }

        let mut guard = SegmentGuard {
            segment: self,
            region,
            mode,
            outcome,
        };
        guard.follow_growth()?;
        if outcome == LockOutcome::AcquiredAfterAbandonment {
            guard.sanitize();
        }
        Ok(guard)
    }
}

impl Drop for MappedSegment {
    fn drop(&mut self) {
        if !self.remove_on_drop.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = SharedMemory::unlink(&self.name) {
            log::error!("[shm] Failed to remove segment {}: {}", self.name, e);
        }
        if let Err(e) = sync::remove_mutex(&sync::mutex_name(&self.name)) {
            log::error!("[shm] Failed to remove lock of {}: {}", self.name, e);
        }
    }
}

/// Exclusive access to a segment. Unlocks on drop.
pub struct SegmentGuard<'a> {
    segment: &'a MappedSegment,
    region: MutexGuard<'a, SharedMemory>,
    mode: AccessMode,
    outcome: LockOutcome,
}

impl<'a> SegmentGuard<'a> {
    /// How the lock was obtained.
    #[inline]
    pub fn outcome(&self) -> LockOutcome {
        self.outcome
    }

    pub fn header(&self) -> SegmentHeader {
        // SAFETY: the named mutex is held.
        SegmentHeader::read_from(unsafe { self.region.bytes() })
    }

    fn store_header(&mut self, header: SegmentHeader) {
        // SAFETY: the named mutex is held and no slice into the mapping is
        // alive (readers borrow `self`).
        header.write_to(unsafe { self.region.bytes_mut() });
    }

    /// Usable payload bytes: the header's capacity, clipped to the mapping.
    pub fn capacity(&self) -> usize {
        self.capacity_of(&self.header())
    }

    fn capacity_of(&self, header: &SegmentHeader) -> usize {
        let mapped = self.region.len().saturating_sub(header.payload_offset());
        (header.capacity as usize).min(mapped)
    }

    pub fn current_size(&self) -> usize {
        self.header().current_size as usize
    }

    /// Borrow `len` payload bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let header = self.header();
        let capacity = self.capacity_of(&header);
        let end = checked_end(offset, len, capacity)?;
        let base = header.payload_offset();
        // SAFETY: the named mutex is held.
        let bytes = unsafe { self.region.bytes() };
        Ok(&bytes[base + offset..base + end])
    }

    /// Borrow the committed payload (`current_size` bytes).
    pub fn payload(&self) -> Result<&[u8]> {
        self.read(0, self.current_size())
    }

    /// Copy `bytes` to `offset` and commit `offset + bytes.len()` as the new
    /// payload size in the same critical section.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.require_write()?;
        let mut header = self.header();
        let capacity = self.capacity_of(&header);
        let end = checked_end(offset, bytes.len(), capacity)?;
        let base = header.payload_offset();

        // SAFETY: the named mutex is held; range checked against the mapping.
        let dst = unsafe { self.region.bytes_mut() };
        dst[base + offset..base + end].copy_from_slice(bytes);

        header.current_size = end as u64;
        self.store_header(header);
        Ok(())
    }

    /// Replace the payload with `bytes`.
    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        self.write(0, bytes)
    }

    /// Grow the segment to hold at least `capacity` payload bytes.
    ///
    /// Other mappings pick up the new size on their next acquisition.
    pub fn grow(&mut self, capacity: usize) -> Result<()> {
        self.require_write()?;
        let mut header = self.header();
        if (header.capacity as usize) >= capacity {
            return Ok(());
        }
        let total = header
            .payload_offset()
            .checked_add(capacity)
            .ok_or(Error::CapacityExceeded {
                size: capacity,
                capacity: header.capacity as usize,
            })?;
        self.region.grow(total)?;
        header.capacity = capacity as u64;
        self.store_header(header);
        global_metrics().inc_grows();
        log::debug!("[shm] Grew segment {} to {} bytes", self.segment.name, capacity);
        Ok(())
    }

    /// Explicitly release the lock. Equivalent to dropping the guard.
    pub fn release(self) {}

    fn require_write(&self) -> Result<()> {
        if self.mode != AccessMode::Write {
            return Err(Error::InvalidState("segment acquired for reading"));
        }
        if !self.header().is_initialized() {
            return Err(Error::InvalidState("segment header not initialized"));
        }
        Ok(())
    }

    /// Remap when the header describes more bytes than this mapping covers.
    fn follow_growth(&mut self) -> Result<()> {
        let header = self.header();
        if !header.is_initialized() {
            return Ok(());
        }
        let total = header.total_len().ok_or_else(|| {
            Error::map(
                &self.segment.name,
                io::Error::new(io::ErrorKind::InvalidData, "corrupt segment capacity"),
            )
        })?;
        if total <= self.region.len() {
            return Ok(());
        }
        self.region.refresh()?;
        if total > self.region.len() {
            return Err(Error::map(
                &self.segment.name,
                io::Error::new(io::ErrorKind::UnexpectedEof, "segment shorter than its header"),
            ));
        }
        Ok(())
    }

    fn sanitize(&mut self) {
        global_metrics().inc_sanitized_locks();
        let mut header = self.header();
        if !self.segment.auto_sanitize || !header.is_initialized() {
            return;
        }
        if !header.supports_sanitize() {
            log::warn!(
                "[shm] Abandoned lock on legacy segment {}, payload left untouched",
                self.segment.name
            );
            return;
        }
        if header.tracks_size() {
            log::warn!(
                "[shm] Abandoned lock on {}, discarding {} payload bytes",
                self.segment.name,
                header.current_size
            );
            header.current_size = 0;
            self.store_header(header);
        }
    }
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        self.segment.lock.unlock();
    }
}

fn checked_end(offset: usize, len: usize, capacity: usize) -> Result<usize> {
    offset
        .checked_add(len)
        .filter(|end| *end <= capacity)
        .ok_or(Error::CapacityExceeded {
            size: offset.saturating_add(len),
            capacity,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::test_name;
    use std::thread;

    const WAIT: Duration = Duration::from_millis(200);

    fn fresh(capacity: usize, sanitize: bool) -> MappedSegment {
        let segment = MappedSegment::open_or_create(&test_name("seg"), capacity, sanitize).unwrap();
        segment.set_remove_on_drop(true);
        segment
    }

    #[test]
    fn test_new_segment_is_empty() {
        let segment = fresh(128, true);
        let guard = segment.acquire(AccessMode::Read, WAIT).unwrap();
        assert_eq!(guard.outcome(), LockOutcome::Acquired);
        assert!(guard.capacity() >= 128);
        assert_eq!(guard.current_size(), 0);
        assert!(guard.payload().unwrap().is_empty());
    }

    #[test]
    fn test_write_commits_size_with_payload() {
        let segment = fresh(64, true);
        let mut guard = segment.acquire(AccessMode::Write, WAIT).unwrap();
        guard.write_payload(b"hello").unwrap();
        assert_eq!(guard.current_size(), 5);
        assert_eq!(guard.payload().unwrap(), b"hello");
        assert_eq!(guard.read(1, 3).unwrap(), b"ell");
    }

    #[test]
    fn test_bounds_are_checked() {
        let segment = fresh(16, true);
        let mut guard = segment.acquire(AccessMode::Write, WAIT).unwrap();
        let capacity = guard.capacity();
        let err = guard.write(0, &vec![0u8; capacity + 1]).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));
        assert!(guard.read(capacity, 1).is_err());
        assert!(guard.read(usize::MAX, 2).is_err());
        assert_eq!(guard.current_size(), 0, "failed write must not commit");
    }

    #[test]
    fn test_read_guard_cannot_write() {
        let segment = fresh(16, true);
        let mut guard = segment.acquire(AccessMode::Read, WAIT).unwrap();
        assert!(matches!(
            guard.write_payload(b"x"),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_second_mapping_follows_growth() {
        let segment = fresh(16, true);
        let other = MappedSegment::open_existing(segment.name(), true).unwrap();

        {
            let mut guard = segment.acquire(AccessMode::Write, WAIT).unwrap();
            guard.grow(8192).unwrap();
            guard.write_payload(&[9u8; 8000]).unwrap();
        }

        let guard = other.acquire(AccessMode::Read, WAIT).unwrap();
        assert!(guard.capacity() >= 8192);
        assert_eq!(guard.payload().unwrap().len(), 8000);
    }

    #[test]
    fn test_lock_timeout_across_mappings() {
        let segment = fresh(16, true);
        let other = MappedSegment::open_existing(segment.name(), true).unwrap();
        let _held = segment.acquire(AccessMode::Write, WAIT).unwrap();

        let err = thread::scope(|s| {
            s.spawn(|| {
                other
                    .acquire(AccessMode::Read, Duration::from_millis(20))
                    .map(|_| ())
            })
            .join()
            .unwrap()
        })
        .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_guard_release_unlocks() {
        let segment = fresh(16, true);
        segment.acquire(AccessMode::Write, WAIT).unwrap().release();
        assert!(segment.acquire(AccessMode::Write, WAIT).is_ok());
    }

    /// Lock the segment's named mutex from a thread that exits without
    /// unlocking. The returned mutex keeps that mapping alive.
    fn crash_holding_lock(name: &str) -> Box<dyn NamedMutex> {
        let mutex_name = sync::mutex_name(name);
        thread::spawn(move || {
            let m = sync::open_mutex(&mutex_name).unwrap();
            assert!(m.lock(WAIT).unwrap().is_acquired());
            m
        })
        .join()
        .unwrap()
    }

    #[test]
    fn test_abandoned_lock_discards_payload() {
        let segment = fresh(32, true);
        segment
            .acquire(AccessMode::Write, WAIT)
            .unwrap()
            .write_payload(b"half-written")
            .unwrap();

        let _crashed = crash_holding_lock(segment.name());

        let guard = segment.acquire(AccessMode::Read, WAIT).unwrap();
        assert_eq!(guard.outcome(), LockOutcome::AcquiredAfterAbandonment);
        assert_eq!(guard.current_size(), 0);
    }

    #[test]
    fn test_abandoned_lock_without_sanitize_keeps_payload() {
        let segment = fresh(32, false);
        segment
            .acquire(AccessMode::Write, WAIT)
            .unwrap()
            .write_payload(b"kept")
            .unwrap();

        let _crashed = crash_holding_lock(segment.name());

        let guard = segment.acquire(AccessMode::Read, WAIT).unwrap();
        assert_eq!(guard.outcome(), LockOutcome::AcquiredAfterAbandonment);
        assert_eq!(guard.payload().unwrap(), b"kept");
    }

    #[test]
    fn test_abandoned_lock_on_legacy_header_is_not_sanitized() {
        let segment = fresh(32, true);
        {
            let mut guard = segment.acquire(AccessMode::Write, WAIT).unwrap();
            guard.write_payload(b"legacy").unwrap();
            let mut header = guard.header();
            header.format_version = 0;
            guard.store_header(header);
        }

        let _crashed = crash_holding_lock(segment.name());

        let guard = segment.acquire(AccessMode::Read, WAIT).unwrap();
        assert_eq!(guard.outcome(), LockOutcome::AcquiredAfterAbandonment);
        assert_eq!(guard.payload().unwrap(), b"legacy");
    }

    #[test]
    fn test_corrupt_capacity_is_a_map_error() {
        let segment = fresh(32, true);
        {
            let mut guard = segment.acquire(AccessMode::Write, WAIT).unwrap();
            let mut header = guard.header();
            header.capacity = u64::MAX;
            guard.store_header(header);
        }

        let other = MappedSegment::open_existing(segment.name(), true).unwrap();
        for _ in 0..2 {
            assert!(matches!(
                other.acquire(AccessMode::Read, WAIT),
                Err(Error::Map { .. })
            ));
        }
    }
}

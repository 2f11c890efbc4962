// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reference-counted pool of mapped segments.
//!
//! Every logical user of a physical segment (a writer, each subscription
//! bound to it) holds a [`SegmentHandle`]. Handles to the same name share one
//! mapping and one named lock.
//!
//! The registry mutex only guards the handle table. Opening a segment maps
//! memory and waits on its cross-process lock, so that happens under a
//! per-name slot lock instead: callers for one name queue behind each other,
//! everybody else carries on.

use super::segment::{AccessMode, MappedSegment};
use crate::config::ShmConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

/// Lock wait for capacity changes.
const RESIZE_TIMEOUT: Duration = Duration::from_secs(1);

/// The mapping for one name, filled by the first caller that opens it.
#[derive(Default)]
struct SegmentSlot {
    segment: Mutex<Option<Arc<MappedSegment>>>,
}

struct RegistryEntry {
    slot: Arc<SegmentSlot>,
    /// Handles plus attachments still in progress.
    refs: usize,
    remove_on_release: bool,
}

/// Process-local segment pool. Create one per process (or per test) and
/// share it by `Arc` with writers and reader pools.
pub struct SegmentRegistry {
    segments: Mutex<HashMap<String, RegistryEntry>>,
    auto_sanitize: bool,
}

impl SegmentRegistry {
    pub fn new(config: &ShmConfig) -> Arc<Self> {
        Arc::new(Self {
            segments: Mutex::new(HashMap::new()),
            auto_sanitize: config.auto_sanitize,
        })
    }

    /// Attach to `name`, creating it with `capacity` payload bytes if needed.
    /// An existing segment that is too small is grown.
    pub fn get_or_create(self: &Arc<Self>, name: &str, capacity: usize) -> Result<SegmentHandle> {
        let (segment, opened) = self.attach(name, |auto_sanitize| {
            MappedSegment::open_or_create(name, capacity, auto_sanitize)
        })?;
        let handle = self.handle(segment);

        if !opened {
            let mut guard = handle.acquire(AccessMode::Write, RESIZE_TIMEOUT)?;
            if guard.capacity() < capacity {
                guard.grow(capacity)?;
            }
        }
        Ok(handle)
    }

    /// Attach to a segment that another party created.
    pub fn open_existing(self: &Arc<Self>, name: &str) -> Result<SegmentHandle> {
        let (segment, _) = self.attach(name, |auto_sanitize| {
            MappedSegment::open_existing(name, auto_sanitize)
        })?;
        Ok(self.handle(segment))
    }

    /// Reserve a reference for `name`, then find or open its mapping with
    /// the table unlocked. Returns the mapping and whether this call opened it.
    fn attach<F>(&self, name: &str, open: F) -> Result<(Arc<MappedSegment>, bool)>
    where
        F: FnOnce(bool) -> Result<MappedSegment>,
    {
        let slot = {
            let mut segments = self.segments.lock();
            let entry = segments
                .entry(name.to_string())
                .or_insert_with(|| RegistryEntry {
                    slot: Arc::default(),
                    refs: 0,
                    remove_on_release: false,
                });
            entry.refs += 1;
            Arc::clone(&entry.slot)
        };

        let mut current = slot.segment.lock();
        if let Some(segment) = current.as_ref() {
            return Ok((Arc::clone(segment), false));
        }
        match open(self.auto_sanitize) {
            Ok(segment) => {
                let segment = Arc::new(segment);
                *current = Some(Arc::clone(&segment));
                Ok((segment, true))
            }
            Err(e) => {
                drop(current);
                self.release_name(name);
                Err(e)
            }
        }
    }

    fn handle(self: &Arc<Self>, segment: Arc<MappedSegment>) -> SegmentHandle {
        SegmentHandle {
            registry: Arc::clone(self),
            segment,
        }
    }

    /// Give a handle back. Same as dropping it.
    pub fn release(&self, handle: SegmentHandle) {
        drop(handle);
    }

    /// Grow `name` to at least `new_capacity` payload bytes.
    ///
    /// The backing object is extended in place, so handles stay valid; other
    /// mappings observe the new capacity on their next acquisition.
    pub fn resize(&self, name: &str, new_capacity: usize) -> Result<()> {
        let slot = self
            .segments
            .lock()
            .get(name)
            .map(|entry| Arc::clone(&entry.slot))
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let segment = slot
            .segment
            .lock()
            .clone()
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let mut guard = segment.acquire(AccessMode::Write, RESIZE_TIMEOUT)?;
        guard.grow(new_capacity)
    }

    /// Number of live handles for `name`, attachments in progress included.
    pub fn use_count(&self, name: &str) -> usize {
        self.segments.lock().get(name).map_or(0, |entry| entry.refs)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.segments.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.segments.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mark_for_removal(&self, name: &str, remove: bool) {
        if let Some(entry) = self.segments.lock().get_mut(name) {
            entry.remove_on_release = remove;
        }
    }

    fn release_name(&self, name: &str) {
        let closed = {
            let mut segments = self.segments.lock();
            match segments.get_mut(name) {
                Some(entry) if entry.refs > 1 => {
                    entry.refs -= 1;
                    None
                }
                Some(_) => segments.remove(name),
                None => None,
            }
        };

        if let Some(entry) = closed {
            let segment = entry.slot.segment.lock().take();
            if let Some(segment) = segment {
                if entry.remove_on_release {
                    segment.set_remove_on_drop(true);
                }
                log::debug!(
                    "[shm] Closed segment {} (remove={})",
                    name,
                    entry.remove_on_release
                );
            }
        }
    }
}

/// Shared access to a registry-owned segment. Releases its reference on drop.
pub struct SegmentHandle {
    registry: Arc<SegmentRegistry>,
    segment: Arc<MappedSegment>,
}

impl SegmentHandle {
    pub fn segment(&self) -> &Arc<MappedSegment> {
        &self.segment
    }

    /// Delete the OS objects once the last handle to this name is released.
    pub fn set_remove_on_release(&self, remove: bool) {
        self.registry.mark_for_removal(self.segment.name(), remove);
    }
}

impl Deref for SegmentHandle {
    type Target = MappedSegment;

    fn deref(&self) -> &MappedSegment {
        &self.segment
    }
}

impl Drop for SegmentHandle {
    fn drop(&mut self) {
        self.registry.release_name(self.segment.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{test_name, SharedMemory};

    const WAIT: Duration = Duration::from_millis(200);

    fn registry() -> Arc<SegmentRegistry> {
        SegmentRegistry::new(&ShmConfig::default())
    }

    #[test]
    fn test_handles_share_one_mapping() {
        let registry = registry();
        let name = test_name("reg");

        let a = registry.get_or_create(&name, 64).unwrap();
        a.set_remove_on_release(true);
        let b = registry.get_or_create(&name, 64).unwrap();
        let c = registry.open_existing(&name).unwrap();

        assert!(Arc::ptr_eq(a.segment(), b.segment()));
        assert!(Arc::ptr_eq(a.segment(), c.segment()));
        assert_eq!(registry.use_count(&name), 3);
        assert_eq!(registry.len(), 1);

        drop(b);
        registry.release(c);
        assert_eq!(registry.use_count(&name), 1);

        drop(a);
        assert_eq!(registry.use_count(&name), 0);
        assert!(!registry.contains(&name));
        assert!(!SharedMemory::exists(&name));
    }

    #[test]
    fn test_release_without_removal_keeps_os_object() {
        let registry = registry();
        let name = test_name("keep");

        drop(registry.get_or_create(&name, 16).unwrap());
        assert!(SharedMemory::exists(&name));

        let again = registry.open_existing(&name).unwrap();
        again.set_remove_on_release(true);
    }

    #[test]
    fn test_open_existing_missing_segment() {
        let registry = registry();
        assert!(matches!(
            registry.open_existing(&test_name("none")),
            Err(Error::NotFound(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resize_is_seen_by_other_registry() {
        let writer_side = registry();
        let reader_side = registry();
        let name = test_name("resize");

        let writer = writer_side.get_or_create(&name, 16).unwrap();
        writer.set_remove_on_release(true);
        let reader = reader_side.open_existing(&name).unwrap();

        writer_side.resize(&name, 10_000).unwrap();
        {
            let mut guard = writer.acquire(AccessMode::Write, WAIT).unwrap();
            guard.write_payload(&vec![1u8; 10_000]).unwrap();
        }

        let guard = reader.acquire(AccessMode::Read, WAIT).unwrap();
        assert!(guard.capacity() >= 10_000);
        assert_eq!(guard.payload().unwrap().len(), 10_000);
    }

    #[test]
    fn test_get_or_create_grows_small_segment() {
        let registry = registry();
        let name = test_name("regrow");

        let small = registry.get_or_create(&name, 16).unwrap();
        small.set_remove_on_release(true);
        let big = registry.get_or_create(&name, 4096).unwrap();

        let guard = big.acquire(AccessMode::Read, WAIT).unwrap();
        assert!(guard.capacity() >= 4096);
        drop(guard);
        drop(small);
    }

    #[test]
    fn test_resize_unknown_name() {
        assert!(matches!(
            registry().resize("/peerbus_unknown", 10),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_slow_open_does_not_block_other_names() {
        let other_process = registry();
        let busy = test_name("busy");
        let held = other_process.get_or_create(&busy, 16).unwrap();
        held.set_remove_on_release(true);

        let registry = registry();
        let idle = test_name("idle");
        let idle_handle = registry.get_or_create(&idle, 16).unwrap();
        idle_handle.set_remove_on_release(true);

        let guard = held.acquire(AccessMode::Write, WAIT).unwrap();
        std::thread::scope(|scope| {
            let attaching = scope.spawn(|| registry.get_or_create(&busy, 16).map(|_| ()));
            std::thread::sleep(Duration::from_millis(100));

            let started = std::time::Instant::now();
            assert_eq!(registry.use_count(&idle), 1);
            assert!(registry.contains(&busy));
            assert!(
                started.elapsed() < Duration::from_millis(100),
                "table lock held for {:?}",
                started.elapsed()
            );

            std::thread::sleep(Duration::from_millis(200));
            drop(guard);
            attaching.join().unwrap().unwrap();
        });
        assert_eq!(registry.use_count(&busy), 0);
    }

    #[test]
    fn test_failed_attach_leaves_no_entry() {
        let registry = registry();
        let name = test_name("failed");
        assert!(registry.open_existing(&name).is_err());
        assert!(!registry.contains(&name));
        assert_eq!(registry.use_count(&name), 0);
    }
}

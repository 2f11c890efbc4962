// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reader side of the data plane: one polling thread per segment name.
//!
//! Subscriptions live in a [`SubscriptionTable`] (id -> consumer). Binding a
//! subscription to a segment name routes every payload read from that
//! segment to it. The first binding to a name starts its thread; removing
//! the last one stops it cooperatively and releases the segment.
//!
//! Each binding holds its own registry handle, so the registry use-count of
//! a segment equals the number of subscriptions bound to it.

use super::metrics::global_metrics;
use super::registry::{SegmentHandle, SegmentRegistry};
use super::segment::{AccessMode, MappedSegment, SegmentGuard};
use crate::config::ShmConfig;
use crate::error::{Error, Result};
use crate::sync::{self, NamedEvent, SignalRole};
use crossbeam::channel::{self, Receiver};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub type SubscriptionId = u64;

/// Receives every payload routed to a subscription.
pub type Consumer = Arc<dyn Fn(SubscriptionId, &[u8]) + Send + Sync>;

/// Consumer that forwards payloads into a channel.
pub fn channel_consumer() -> (Consumer, Receiver<(SubscriptionId, Vec<u8>)>) {
    let (tx, rx) = channel::unbounded();
    let consumer: Consumer = Arc::new(move |id, payload: &[u8]| {
        let _ = tx.send((id, payload.to_vec()));
    });
    (consumer, rx)
}

/// Subscription id -> consumer.
pub struct SubscriptionTable {
    consumers: RwLock<HashMap<SubscriptionId, Consumer>>,
    next_id: AtomicU64,
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self {
            consumers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, consumer: Consumer) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.consumers.write().insert(id, consumer);
        id
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        self.consumers.write().remove(&id).is_some()
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.consumers.read().contains_key(&id)
    }

    /// Hand `payload` to the consumer of `id`.
    ///
    /// The table lock is not held while the consumer runs, and a panicking
    /// consumer is contained. Returns `false` if nothing consumed the payload.
    pub fn dispatch(&self, id: SubscriptionId, payload: &[u8]) -> bool {
        let Some(consumer) = self.consumers.read().get(&id).cloned() else {
            return false;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| consumer(id, payload))) {
            Ok(()) => true,
            Err(_) => {
                global_metrics().inc_dispatch_panics();
                log::warn!("[reader] Consumer of subscription {} panicked", id);
                false
            }
        }
    }
}

struct ReaderThreadEntry {
    routes: Arc<RwLock<BTreeSet<SubscriptionId>>>,
    handles: BTreeMap<SubscriptionId, SegmentHandle>,
    stop: Arc<AtomicBool>,
    wake: Arc<dyn NamedEvent>,
    thread: Option<JoinHandle<()>>,
}

impl ReaderThreadEntry {
    fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        self.wake.signal();
        if let Some(handle) = self.thread.take() {
            // A consumer may unsubscribe from inside its own reader thread.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("[reader] Reader thread panicked");
            }
        }
    }
}

/// Everything a polling thread needs.
struct PollContext {
    segment: Arc<MappedSegment>,
    routes: Arc<RwLock<BTreeSet<SubscriptionId>>>,
    table: Arc<SubscriptionTable>,
    stop: Arc<AtomicBool>,
    data_ready: Arc<dyn NamedEvent>,
    process_id: u32,
    config: ShmConfig,
}

impl PollContext {
    fn run(self) {
        let name = self.segment.name().to_string();
        let ack_name = sync::signal_name(&name, self.process_id, SignalRole::Ack);
        let mut ack: Option<Box<dyn NamedEvent>> = None;
        log::debug!("[reader] Polling {}", name);

        while !self.stop.load(Ordering::Acquire) {
            if !self.data_ready.wait(self.config.poll_interval()) {
                continue;
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let delivered = if self.config.zero_copy {
                self.dispatch_in_place()
            } else {
                self.read_payload().map(|payload| self.dispatch(&payload))
            };
            if delivered.is_none() {
                continue;
            }
            global_metrics().inc_reads();

            // Our ack event appears once the writer has connected this process.
            if ack.is_none() {
                ack = sync::open_existing_event(&ack_name).ok();
            }
            if let Some(ack) = &ack {
                ack.signal();
            }
        }
        log::debug!("[reader] Stopped polling {}", name);
    }

    fn dispatch(&self, payload: &[u8]) {
        let ids: Vec<SubscriptionId> = self.routes.read().iter().copied().collect();
        for id in ids {
            self.table.dispatch(id, payload);
        }
    }

    fn acquire(&self) -> Option<SegmentGuard<'_>> {
        match self
            .segment
            .acquire(AccessMode::Read, self.config.open_timeout())
        {
            Ok(guard) => Some(guard),
            Err(e) if e.is_transient() => {
                log::debug!("[reader] Skipping cycle: {}", e);
                None
            }
            Err(e) => {
                log::warn!("[reader] Cannot read {}: {}", self.segment.name(), e);
                None
            }
        }
    }

    fn read_payload(&self) -> Option<Vec<u8>> {
        let guard = self.acquire()?;
        match guard.payload() {
            Ok(payload) => Some(payload.to_vec()),
            Err(e) => {
                log::warn!("[reader] Corrupt header on {}: {}", self.segment.name(), e);
                None
            }
        }
    }

    /// Hand consumers the mapped payload itself. The writer stays blocked
    /// until every consumer returns.
    fn dispatch_in_place(&self) -> Option<()> {
        let guard = self.acquire()?;
        match guard.payload() {
            Ok(payload) => {
                self.dispatch(payload);
                Some(())
            }
            Err(e) => {
                log::warn!("[reader] Corrupt header on {}: {}", self.segment.name(), e);
                None
            }
        }
    }
}

/// Multiplexes subscriptions onto one polling thread per segment name.
pub struct SegmentReaderPool {
    registry: Arc<SegmentRegistry>,
    table: Arc<SubscriptionTable>,
    entries: Mutex<HashMap<String, ReaderThreadEntry>>,
    process_id: u32,
    config: ShmConfig,
}

impl SegmentReaderPool {
    pub fn new(registry: Arc<SegmentRegistry>, config: ShmConfig) -> Self {
        Self::with_process_id(registry, config, std::process::id())
    }

    /// Pool that identifies itself to writers as `process_id`.
    pub fn with_process_id(registry: Arc<SegmentRegistry>, config: ShmConfig, process_id: u32) -> Self {
        Self {
            registry,
            table: Arc::new(SubscriptionTable::new()),
            entries: Mutex::new(HashMap::new()),
            process_id,
            config,
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn table(&self) -> &Arc<SubscriptionTable> {
        &self.table
    }

    /// Add a consumer without binding it to any segment yet.
    pub fn register(&self, consumer: Consumer) -> SubscriptionId {
        self.table.insert(consumer)
    }

    /// Route payloads of `segment_name` to subscription `id`.
    ///
    /// Starts the segment's polling thread if this is its first
    /// subscription. Binding the same pair twice is a no-op.
    pub fn subscribe(&self, id: SubscriptionId, segment_name: &str) -> Result<()> {
        if !self.table.contains(id) {
            return Err(Error::NotFound(format!("subscription {id}")));
        }

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(segment_name) {
            if entry.handles.contains_key(&id) {
                return Ok(());
            }
            let handle = self.registry.open_existing(segment_name)?;
            entry.handles.insert(id, handle);
            entry.routes.write().insert(id);
            return Ok(());
        }

        let handle = self.registry.open_existing(segment_name)?;
        let data_ready: Arc<dyn NamedEvent> = Arc::from(sync::open_event(&sync::signal_name(
            segment_name,
            self.process_id,
            SignalRole::DataReady,
        ))?);
        let routes = Arc::new(RwLock::new(BTreeSet::from([id])));
        let stop = Arc::new(AtomicBool::new(false));

        let context = PollContext {
            segment: Arc::clone(handle.segment()),
            routes: Arc::clone(&routes),
            table: Arc::clone(&self.table),
            stop: Arc::clone(&stop),
            data_ready: Arc::clone(&data_ready),
            process_id: self.process_id,
            config: self.config.clone(),
        };
        let thread = thread::Builder::new()
            .name("peerbus-reader".into())
            .spawn(move || context.run())?;

        entries.insert(
            segment_name.to_string(),
            ReaderThreadEntry {
                routes,
                handles: BTreeMap::from([(id, handle)]),
                stop,
                wake: data_ready,
                thread: Some(thread),
            },
        );
        Ok(())
    }

    /// Register `consumer` and bind it to `segment_name` in one step.
    pub fn subscribe_with(&self, segment_name: &str, consumer: Consumer) -> Result<SubscriptionId> {
        let id = self.register(consumer);
        if let Err(e) = self.subscribe(id, segment_name) {
            self.table.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Remove one binding. Returns `false` if it did not exist.
    pub fn unbind(&self, id: SubscriptionId, segment_name: &str) -> bool {
        self.detach(id, Some(segment_name)) > 0
    }

    /// Reopen `segment_name` when the name now refers to a newer object than
    /// the one mapped here, moving every subscription bound to it over.
    /// Returns `false` when the mapping is still current.
    pub fn rebind_if_replaced(&self, segment_name: &str) -> Result<bool> {
        let mapped = self
            .entries
            .lock()
            .get(segment_name)
            .and_then(|entry| entry.handles.values().next())
            .map(|handle| Arc::clone(handle.segment()));
        if !mapped.is_some_and(|segment| segment.is_replaced()) {
            return Ok(false);
        }

        let Some(entry) = self.entries.lock().remove(segment_name) else {
            return Ok(false);
        };
        let ids: Vec<SubscriptionId> = entry.handles.keys().copied().collect();
        entry.shutdown();
        log::debug!("[reader] {} was recreated, rebinding {} subscriptions", segment_name, ids.len());

        for id in ids {
            self.subscribe(id, segment_name)?;
        }
        Ok(true)
    }

    /// Remove the subscription and all of its bindings.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.detach(id, None);
        self.table.remove(id);
    }

    fn detach(&self, id: SubscriptionId, only: Option<&str>) -> usize {
        let mut released = Vec::new();
        let mut stopped = Vec::new();
        {
            let mut entries = self.entries.lock();
            for (name, entry) in entries.iter_mut() {
                if only.is_some_and(|n| n != name.as_str()) {
                    continue;
                }
                if let Some(handle) = entry.handles.remove(&id) {
                    entry.routes.write().remove(&id);
                    released.push(handle);
                }
            }
            let idle: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.handles.is_empty())
                .map(|(name, _)| name.clone())
                .collect();
            for name in idle {
                if let Some(entry) = entries.remove(&name) {
                    stopped.push(entry);
                }
            }
        }

        // Join outside the table lock: consumers may call back into the pool.
        for entry in stopped {
            entry.shutdown();
        }
        released.len()
    }

    /// Number of running polling threads.
    pub fn thread_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Subscriptions currently bound to `segment_name`.
    pub fn subscriptions_on(&self, segment_name: &str) -> usize {
        self.entries
            .lock()
            .get(segment_name)
            .map_or(0, |entry| entry.handles.len())
    }

    pub fn is_bound(&self, id: SubscriptionId, segment_name: &str) -> bool {
        self.entries
            .lock()
            .get(segment_name)
            .is_some_and(|entry| entry.handles.contains_key(&id))
    }
}

impl Drop for SegmentReaderPool {
    fn drop(&mut self) {
        let entries: Vec<ReaderThreadEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::test_name;
    use std::sync::atomic::AtomicUsize;

    fn config() -> ShmConfig {
        ShmConfig {
            poll_interval_ms: 10,
            open_timeout_ms: 50,
            ..ShmConfig::default()
        }
    }

    /// A segment created by a separate registry, as a writer process would.
    fn external_segment() -> (Arc<SegmentRegistry>, SegmentHandle) {
        let registry = SegmentRegistry::new(&config());
        let handle = registry.get_or_create(&test_name("pool"), 64).unwrap();
        handle.set_remove_on_release(true);
        (registry, handle)
    }

    #[test]
    fn test_dispatch_routes_by_id() {
        let table = SubscriptionTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = table.insert(Arc::new(move |_, payload: &[u8]| {
            counter.fetch_add(payload.len(), Ordering::SeqCst);
        }));

        assert!(table.dispatch(id, b"abc"));
        assert!(!table.dispatch(id + 100, b"abc"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        assert!(table.remove(id));
        assert!(!table.dispatch(id, b"abc"));
    }

    #[test]
    fn test_dispatch_contains_panics() {
        let table = SubscriptionTable::new();
        let id = table.insert(Arc::new(|_, _: &[u8]| panic!("consumer bug")));
        assert!(!table.dispatch(id, b"x"));
        assert!(table.contains(id));
    }

    #[test]
    fn test_subscribe_unknown_id() {
        let (_writer_registry, segment) = external_segment();
        let pool = SegmentReaderPool::new(SegmentRegistry::new(&config()), config());
        assert!(matches!(
            pool.subscribe(999, segment.name()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_subscribe_missing_segment_starts_nothing() {
        let pool = SegmentReaderPool::new(SegmentRegistry::new(&config()), config());
        let (consumer, _rx) = channel_consumer();
        assert!(pool.subscribe_with(&test_name("absent"), consumer).is_err());
        assert_eq!(pool.thread_count(), 0);
    }

    #[test]
    fn test_three_subscriptions_share_one_thread() {
        let (_writer_registry, segment) = external_segment();
        let registry = SegmentRegistry::new(&config());
        let pool = SegmentReaderPool::with_process_id(Arc::clone(&registry), config(), 51_001);
        let name = segment.name().to_string();

        let ids: Vec<_> = (0..3)
            .map(|_| pool.subscribe_with(&name, channel_consumer().0).unwrap())
            .collect();
        assert_eq!(pool.thread_count(), 1);
        assert_eq!(pool.subscriptions_on(&name), 3);
        assert_eq!(registry.use_count(&name), 3);

        pool.subscribe(ids[0], &name).unwrap();
        assert_eq!(registry.use_count(&name), 3, "rebinding is a no-op");

        pool.unsubscribe(ids[0]);
        pool.unsubscribe(ids[1]);
        assert_eq!(pool.thread_count(), 1);
        assert_eq!(registry.use_count(&name), 1);

        pool.unsubscribe(ids[2]);
        assert_eq!(pool.thread_count(), 0);
        assert_eq!(registry.use_count(&name), 0);
        assert!(!registry.contains(&name));
    }

    #[test]
    fn test_unbind_keeps_other_bindings() {
        let (_wa, first) = external_segment();
        let (_wb, second) = external_segment();
        let pool = SegmentReaderPool::with_process_id(SegmentRegistry::new(&config()), config(), 51_002);

        let id = pool.register(channel_consumer().0);
        pool.subscribe(id, first.name()).unwrap();
        pool.subscribe(id, second.name()).unwrap();
        assert_eq!(pool.thread_count(), 2);

        assert!(pool.unbind(id, first.name()));
        assert!(!pool.unbind(id, first.name()));
        assert!(pool.is_bound(id, second.name()));
        assert_eq!(pool.thread_count(), 1);
    }

    #[test]
    fn test_signal_dispatches_to_every_route() {
        let (_writer_registry, segment) = external_segment();
        let pid = 51_003;
        let pool = SegmentReaderPool::with_process_id(SegmentRegistry::new(&config()), config(), pid);

        let (consumer, rx) = channel_consumer();
        let a = pool.subscribe_with(segment.name(), Arc::clone(&consumer)).unwrap();
        let b = pool.subscribe_with(segment.name(), consumer).unwrap();

        segment
            .acquire(AccessMode::Write, std::time::Duration::from_millis(100))
            .unwrap()
            .write_payload(b"fan-out")
            .unwrap();
        let evt = sync::open_event(&sync::signal_name(segment.name(), pid, SignalRole::DataReady))
            .unwrap();
        evt.signal();

        let timeout = std::time::Duration::from_secs(2);
        let mut seen: Vec<_> = (0..2).map(|_| rx.recv_timeout(timeout).unwrap()).collect();
        seen.sort();
        assert_eq!(seen, vec![(a, b"fan-out".to_vec()), (b, b"fan-out".to_vec())]);

        drop(pool);
        let _ = sync::remove_event(evt.name());
    }

    #[test]
    fn test_locked_segment_skips_the_cycle() {
        let (_writer_registry, segment) = external_segment();
        let pid = 51_004;
        let pool = SegmentReaderPool::with_process_id(SegmentRegistry::new(&config()), config(), pid);
        let (consumer, rx) = channel_consumer();
        pool.subscribe_with(segment.name(), consumer).unwrap();

        let ack = sync::open_event(&sync::signal_name(segment.name(), pid, SignalRole::Ack)).unwrap();
        let evt = sync::open_event(&sync::signal_name(segment.name(), pid, SignalRole::DataReady))
            .unwrap();
        let before = global_metrics().snapshot().lock_timeouts;

        let mut guard = segment
            .acquire(AccessMode::Write, std::time::Duration::from_millis(100))
            .unwrap();
        guard.write_payload(b"late").unwrap();
        evt.signal();
        assert!(rx.recv_timeout(std::time::Duration::from_millis(250)).is_err());
        assert!(!ack.wait(std::time::Duration::from_millis(20)));
        assert!(global_metrics().snapshot().lock_timeouts > before);

        drop(guard);
        evt.signal();
        let (_, payload) = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(payload, b"late");
        assert!(ack.wait(std::time::Duration::from_secs(2)));

        drop(pool);
        let _ = sync::remove_event(evt.name());
        let _ = sync::remove_event(ack.name());
    }

    #[test]
    fn test_zero_copy_dispatches_from_the_mapping() {
        let (_writer_registry, segment) = external_segment();
        let pid = 51_005;
        let cfg = ShmConfig {
            zero_copy: true,
            ..config()
        };
        let pool = SegmentReaderPool::with_process_id(SegmentRegistry::new(&cfg), cfg, pid);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let (tx, rx) = channel::unbounded();
        let consumer: Consumer = Arc::new(move |_: SubscriptionId, payload: &[u8]| {
            counter.fetch_add(payload.len(), Ordering::SeqCst);
            let _ = tx.send(payload == b"mapped");
        });
        pool.subscribe_with(segment.name(), consumer).unwrap();

        segment
            .acquire(AccessMode::Write, std::time::Duration::from_millis(100))
            .unwrap()
            .write_payload(b"mapped")
            .unwrap();
        let evt = sync::open_event(&sync::signal_name(segment.name(), pid, SignalRole::DataReady))
            .unwrap();
        evt.signal();

        assert!(rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap());
        assert_eq!(seen.load(Ordering::SeqCst), 6);
        assert!(!pool.rebind_if_replaced(segment.name()).unwrap());

        drop(pool);
        let _ = sync::remove_event(evt.name());
    }
}


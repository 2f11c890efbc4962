// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-writer publisher over one mapped segment.
//!
//! # Publish sequence
//!
//! 1. Lock the segment (bounded by `open_timeout`), copy the payload and
//!    commit its size, unlock. A payload that does not fit grows the segment
//!    once and is retried.
//! 2. Raise the data-ready event of every connected peer, in process id order.
//! 3. With a non-zero `ack_timeout`, wait for each peer's ack against one
//!    shared deadline. A peer that stays silent costs at most `ack_timeout`
//!    and never delays the notification of the others.

use super::metrics::global_metrics;
use super::registry::{SegmentHandle, SegmentRegistry};
use super::segment::{AccessMode, MappedSegment};
use crate::config::ShmConfig;
use crate::error::{Error, Result};
use crate::sync::{self, NamedEvent, SignalRole};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle of a writer. `Ready` right after creation, `Closed` after
/// [`SynchronizedWriter::close`] or drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Ready,
    Closed,
}

/// Events shared with one reader process.
pub struct PeerConnection {
    process_id: u32,
    data_ready: Box<dyn NamedEvent>,
    ack: Box<dyn NamedEvent>,
}

impl PeerConnection {
    fn open(segment: &str, process_id: u32) -> Result<Self> {
        let data_ready = sync::open_event(&sync::signal_name(
            segment,
            process_id,
            SignalRole::DataReady,
        ))?;
        let ack = sync::open_event(&sync::signal_name(segment, process_id, SignalRole::Ack))?;
        Ok(Self {
            process_id,
            data_ready,
            ack,
        })
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Bytes committed to the segment
    pub written: usize,
    /// Peers whose data-ready event was raised
    pub signaled: usize,
    /// Peers that did not ack in time
    pub ack_timeouts: Vec<u32>,
    /// The segment had to grow for this payload
    pub grew: bool,
}

struct WriterInner {
    state: WriterState,
    segment: Option<SegmentHandle>,
    peers: BTreeMap<u32, Arc<PeerConnection>>,
    /// Every peer ever connected, for event cleanup on close.
    known_peers: BTreeSet<u32>,
}

pub struct SynchronizedWriter {
    registry: Arc<SegmentRegistry>,
    name: String,
    config: ShmConfig,
    inner: Mutex<WriterInner>,
}

impl SynchronizedWriter {
    /// Create the writer for `base_name`, owned by this process.
    pub fn create(registry: Arc<SegmentRegistry>, base_name: &str, config: ShmConfig) -> Result<Self> {
        let name = super::segment_name(base_name, std::process::id(), None);
        Self::with_segment_name(registry, &name, config)
    }

    /// Create the writer for an explicit segment name.
    pub fn with_segment_name(
        registry: Arc<SegmentRegistry>,
        segment_name: &str,
        config: ShmConfig,
    ) -> Result<Self> {
        let handle = registry.get_or_create(segment_name, config.initial_capacity)?;
        log::debug!("[writer] Ready on {}", segment_name);
        Ok(Self {
            registry,
            name: segment_name.to_string(),
            config,
            inner: Mutex::new(WriterInner {
                state: WriterState::Ready,
                segment: Some(handle),
                peers: BTreeMap::new(),
                known_peers: BTreeSet::new(),
            }),
        })
    }

    pub fn segment_name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WriterState {
        self.inner.lock().state
    }

    pub fn connected_peers(&self) -> Vec<u32> {
        self.inner.lock().peers.keys().copied().collect()
    }

    pub fn is_connected(&self, process_id: u32) -> bool {
        self.inner.lock().peers.contains_key(&process_id)
    }

    /// Start notifying `process_id` on every publish.
    ///
    /// Returns `Ok(false)` if the peer was already connected. When the
    /// peer's events cannot be opened the peer is left out; the caller
    /// retries on the next registration heartbeat.
    pub fn connect(&self, process_id: u32) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.state == WriterState::Closed {
            return Err(Error::InvalidState("writer closed"));
        }
        if inner.peers.contains_key(&process_id) {
            return Ok(false);
        }
        let peer = PeerConnection::open(&self.name, process_id).map_err(|e| {
            log::debug!(
                "[writer] Cannot connect {} to process {}: {}",
                self.name,
                process_id,
                e
            );
            e
        })?;
        inner.peers.insert(process_id, Arc::new(peer));
        inner.known_peers.insert(process_id);
        log::debug!("[writer] {} connected to process {}", self.name, process_id);
        Ok(true)
    }

    /// Stop notifying `process_id`. Never waits for an outstanding ack;
    /// a publish already in flight finishes with its own copy of the peer.
    pub fn disconnect(&self, process_id: u32) -> bool {
        let removed = self.inner.lock().peers.remove(&process_id).is_some();
        if removed {
            log::debug!("[writer] {} disconnected process {}", self.name, process_id);
        }
        removed
    }

    /// Publish `bytes` to every connected peer.
    ///
    /// Fails only when the payload could not be committed to the segment
    /// (`LockTimeout`, `MapError`, closed writer). Missing acks are reported
    /// in the returned [`PublishReport`].
    pub fn publish(&self, bytes: &[u8]) -> Result<PublishReport> {
        self.publish_parts(&[bytes])
    }

    /// Publish the concatenation of `parts`, copied one after the other into
    /// the segment under a single lock so readers only see the whole.
    pub fn publish_parts(&self, parts: &[&[u8]]) -> Result<PublishReport> {
        let (segment, peers) = {
            let inner = self.inner.lock();
            let segment = match (&inner.state, &inner.segment) {
                (WriterState::Ready, Some(handle)) => Arc::clone(handle.segment()),
                _ => return Err(Error::InvalidState("writer closed")),
            };
            let peers: Vec<_> = inner.peers.values().cloned().collect();
            (segment, peers)
        };

        let written = parts.iter().map(|part| part.len()).sum();
        let grew = self.commit(&segment, parts, written)?;
        global_metrics().record_write(written);

        let ack_timeouts = self.notify(&peers);
        Ok(PublishReport {
            written,
            signaled: peers.len(),
            ack_timeouts,
            grew,
        })
    }

    fn commit(&self, segment: &MappedSegment, parts: &[&[u8]], total: usize) -> Result<bool> {
        match self.try_commit(segment, parts, total) {
            Err(Error::CapacityExceeded { size, capacity }) => {
                let grown = self.config.grown_capacity(size);
                log::debug!(
                    "[writer] {} payload {} exceeds capacity {}, growing to {}",
                    self.name,
                    size,
                    capacity,
                    grown
                );
                self.registry.resize(&self.name, grown)?;
                self.try_commit(segment, parts, total).map_err(|e| match e {
                    Error::CapacityExceeded { size, capacity } => Error::map(
                        &self.name,
                        io::Error::new(
                            io::ErrorKind::OutOfMemory,
                            format!("{size} bytes still exceed capacity {capacity} after growth"),
                        ),
                    ),
                    other => other,
                })?;
                Ok(true)
            }
            other => other.map(|()| false),
        }
    }

    fn try_commit(&self, segment: &MappedSegment, parts: &[&[u8]], total: usize) -> Result<()> {
        let mut guard = segment.acquire(AccessMode::Write, self.config.open_timeout())?;
        let capacity = guard.capacity();
        if total > capacity {
            return Err(Error::CapacityExceeded {
                size: total,
                capacity,
            });
        }
        if total == 0 {
            return guard.write_payload(&[]);
        }
        let mut offset = 0;
        for part in parts.iter().filter(|part| !part.is_empty()) {
            guard.write(offset, part)?;
            offset += part.len();
        }
        Ok(())
    }

    fn notify(&self, peers: &[Arc<PeerConnection>]) -> Vec<u32> {
        let ack_timeout = self.config.ack_timeout();
        let wait_acks = !ack_timeout.is_zero();

        for peer in peers {
            if wait_acks {
                peer.ack.reset();
            }
            peer.data_ready.signal();
        }
        if !wait_acks {
            return Vec::new();
        }

        let deadline = Instant::now() + ack_timeout;
        let mut missed = Vec::new();
        for peer in peers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !peer.ack.wait(remaining) {
                global_metrics().inc_ack_timeouts();
                log::trace!("[writer] {}", Error::AckTimeout(peer.process_id));
                missed.push(peer.process_id);
            }
        }
        missed
    }

    /// Disconnect everybody and release the segment. With `remove_on_close`
    /// the segment, its lock and the events of every peer ever connected are
    /// deleted once no local handle uses them anymore.
    pub fn close(&self) {
        let (segment, known) = {
            let mut inner = self.inner.lock();
            if inner.state == WriterState::Closed {
                return;
            }
            inner.state = WriterState::Closed;
            inner.peers.clear();
            (inner.segment.take(), std::mem::take(&mut inner.known_peers))
        };

        if let Some(handle) = segment {
            if self.config.remove_on_close {
                handle.set_remove_on_release(true);
                for pid in known {
                    for role in [SignalRole::DataReady, SignalRole::Ack] {
                        let event = sync::signal_name(&self.name, pid, role);
                        if let Err(e) = sync::remove_event(&event) {
                            log::error!("[writer] Failed to remove {}: {}", event, e);
                        }
                    }
                }
            }
            drop(handle);
        }
        log::debug!("[writer] Closed {}", self.name);
    }
}

impl Drop for SynchronizedWriter {
    fn drop(&mut self) {
        self.close();
    }
}

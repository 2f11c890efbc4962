// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data plane counters.
//!
//! All counters use `Relaxed` ordering; values are eventually consistent
//! across threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

#[derive(Debug, Default)]
pub struct ShmMetrics {
    /// Payloads committed to a segment
    pub writes: AtomicU64,
    /// Payload bytes committed
    pub bytes_written: AtomicU64,
    /// Payloads copied out by reader threads
    pub reads: AtomicU64,
    /// Acquisitions that gave up waiting for the segment lock
    pub lock_timeouts: AtomicU64,
    /// Peers that missed their ack window
    pub ack_timeouts: AtomicU64,
    /// Segment growth operations
    pub grows: AtomicU64,
    /// Locks recovered from a crashed holder
    pub sanitized_locks: AtomicU64,
    /// Consumers that panicked during dispatch
    pub dispatch_panics: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        #[inline]
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl ShmMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            writes: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),
            ack_timeouts: AtomicU64::new(0),
            grows: AtomicU64::new(0),
            sanitized_locks: AtomicU64::new(0),
            dispatch_panics: AtomicU64::new(0),
        }
    }

    /// Record a committed write of `bytes` bytes.
    #[inline]
    pub fn record_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    counter!(inc_reads, reads);
    counter!(inc_lock_timeouts, lock_timeouts);
    counter!(inc_ack_timeouts, ack_timeouts);
    counter!(inc_grows, grows);
    counter!(inc_sanitized_locks, sanitized_locks);
    counter!(inc_dispatch_panics, dispatch_panics);

    #[must_use]
    pub fn snapshot(&self) -> ShmMetricsSnapshot {
        ShmMetricsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
            grows: self.grows.load(Ordering::Relaxed),
            sanitized_locks: self.sanitized_locks.load(Ordering::Relaxed),
            dispatch_panics: self.dispatch_panics.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ShmMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShmMetricsSnapshot {
    pub writes: u64,
    pub bytes_written: u64,
    pub reads: u64,
    pub lock_timeouts: u64,
    pub ack_timeouts: u64,
    pub grows: u64,
    pub sanitized_locks: u64,
    pub dispatch_panics: u64,
}

/// Process-wide counters.
pub fn global_metrics() -> &'static ShmMetrics {
    static METRICS: OnceLock<ShmMetrics> = OnceLock::new();
    METRICS.get_or_init(ShmMetrics::new)
}

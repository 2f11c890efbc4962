// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared-memory data plane.
//!
//! ```text
//! +--------------------+                        +---------------------+
//! |  Process A         |   /peerbus_<topic>_A   |  Process B          |
//! |                    |   +----------------+   |                     |
//! |  SynchronizedWriter|-->| header|payload |-->| SegmentReaderPool   |
//! |        |           |   +----------------+   |   (1 thread/name)   |
//! |        |  signal   |       <name>_mtx       |        |            |
//! |        +-----------+--> <name>_<B>_evt -----+--> wait            |
//! |        <-----------+--- <name>_<B>_ack <----+--- signal          |
//! +--------------------+                        +---------------------+
//! ```
//!
//! A writer copies each payload into its segment under the segment's named
//! mutex, then raises one data-ready event per connected reader process and
//! optionally waits (bounded) for their acks. Reader processes run one
//! polling thread per segment name and fan each payload out to every
//! subscription bound to that name.

mod header;
mod layer;
mod metrics;
mod reader_pool;
mod region;
mod registry;
mod segment;
mod writer;

pub use header::{SegmentHeader, FORMAT_VERSION, HEADER_SIZE};
pub use layer::{
    decode_sample, decode_sample_view, encode_envelope, encode_sample, ConnectionParameter, Sample,
    SampleView, ShmTopicReader, ShmTopicWriter, WriterData, ENVELOPE_SIZE,
};
pub use metrics::{global_metrics, ShmMetrics, ShmMetricsSnapshot};
pub use reader_pool::{
    channel_consumer, Consumer, SegmentReaderPool, SubscriptionId, SubscriptionTable,
};
pub use region::SharedMemory;
pub use registry::{SegmentHandle, SegmentRegistry};
pub use segment::{AccessMode, MappedSegment, SegmentGuard};
pub use writer::{PeerConnection, PublishReport, SynchronizedWriter, WriterState};

/// Longest object name accepted by the OS (`NAME_MAX`).
pub const MAX_NAME_LEN: usize = 255;

/// Prefix shared by every object this crate creates.
pub const NAME_PREFIX: &str = "/peerbus_";

/// Room left after a segment name for the longest lock/event suffix
/// (`_<u32 pid>_evt`).
const SUFFIX_RESERVE: usize = 16;

/// Deterministic segment name for a topic owned by `process_id`.
///
/// Format: `/peerbus_<base>_<pid>[_<suffix>]`, where characters that are not
/// ASCII alphanumeric are replaced by `_`. Readers derive the same name from
/// discovery metadata. Names that would not leave room for lock and event
/// suffixes are shortened and tagged with a hash of the full name.
#[must_use]
pub fn segment_name(base: &str, process_id: u32, suffix: Option<&str>) -> String {
    let mut name = format!("{NAME_PREFIX}{}_{process_id}", sanitize(base));
    if let Some(suffix) = suffix {
        name.push('_');
        name.push_str(&sanitize(suffix));
    }

    let limit = MAX_NAME_LEN - SUFFIX_RESERVE;
    if name.len() > limit {
        let hash = format!("_{:08x}", hash_string(&name));
        name.truncate(limit - hash.len());
        name.push_str(&hash);
    }
    name
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// FNV-1a
fn hash_string(s: &str) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for byte in s.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Unique object name for tests running in parallel.
#[cfg(test)]
pub(crate) fn test_name(prefix: &str) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("/peerbus_t{}_{prefix}_{n}", std::process::id())
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic-level shared-memory transport.
//!
//! A publisher announces the segments it writes to in the SHM layer of its
//! topic registration (a [`ConnectionParameter`]). Subscribers on the same
//! host group bind to those segments; publishers connect every subscriber
//! they see so its data-ready event gets raised.
//!
//! With `buffer_count > 1` a publisher owns one segment per buffer (named
//! with the buffer index as suffix) and rotates over them, so a slow reader
//! still copying one sample does not hold back the next write. Samples of
//! different buffers are delivered by different reader threads; consumers
//! order them by `clock` when they care.
//!
//! With `zero_copy` the envelope and payload are written straight into the
//! segment, and [`ShmTopicReader::with_view`] consumers see the mapped bytes
//! while the reader holds the segment lock.
//!
//! Each payload is framed with a small envelope:
//!
//! ```text
//! 0   8  publisher clock     (u64 LE)
//! 8   8  send timestamp, us  (i64 LE)
//! 16  8  payload length      (u64 LE)
//! 24  .. payload
//! ```

use super::reader_pool::{Consumer, SegmentReaderPool, SubscriptionId};
use super::registry::SegmentRegistry;
use super::writer::SynchronizedWriter;
use crate::config::ShmConfig;
use crate::error::{Error, Result};
use crate::registration::{
    Command, DirectoryApplier, DiscoveryRecord, LayerInfo, LayerKind, TopicDirection, TopicInfo,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Envelope bytes in front of every payload.
pub const ENVELOPE_SIZE: usize = 24;

/// Version of the SHM layer announced in registrations.
const LAYER_VERSION: u32 = 1;

/// Segments a publisher writes to, as announced in its SHM layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParameter {
    pub segment_names: Vec<String>,
}

impl ConnectionParameter {
    pub fn to_blob(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        serde_json::from_slice(blob)
            .map_err(|e| Error::MalformedRecord(format!("connection parameter: {e}")))
    }
}

/// What the pub/sub API hands to a publisher.
#[derive(Debug, Clone, Copy)]
pub struct WriterData<'a> {
    pub payload: &'a [u8],
    pub send_timestamp_us: i64,
    pub clock: u64,
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub clock: u64,
    pub send_timestamp_us: i64,
    pub payload: Vec<u8>,
}

/// Envelope bytes for `data`, without the payload.
pub fn encode_envelope(data: &WriterData<'_>) -> [u8; ENVELOPE_SIZE] {
    let mut envelope = [0u8; ENVELOPE_SIZE];
    envelope[0..8].copy_from_slice(&data.clock.to_le_bytes());
    envelope[8..16].copy_from_slice(&data.send_timestamp_us.to_le_bytes());
    envelope[16..24].copy_from_slice(&(data.payload.len() as u64).to_le_bytes());
    envelope
}

pub fn encode_sample(data: &WriterData<'_>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ENVELOPE_SIZE + data.payload.len());
    buf.extend_from_slice(&encode_envelope(data));
    buf.extend_from_slice(data.payload);
    buf
}

/// A sample borrowed from the buffer it was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleView<'a> {
    pub clock: u64,
    pub send_timestamp_us: i64,
    pub payload: &'a [u8],
}

impl SampleView<'_> {
    pub fn to_sample(&self) -> Sample {
        Sample {
            clock: self.clock,
            send_timestamp_us: self.send_timestamp_us,
            payload: self.payload.to_vec(),
        }
    }
}

pub fn decode_sample_view(buf: &[u8]) -> Result<SampleView<'_>> {
    if buf.len() < ENVELOPE_SIZE {
        return Err(Error::MalformedRecord(format!(
            "sample of {} bytes has no envelope",
            buf.len()
        )));
    }
    let field = |at: usize| -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[at..at + 8]);
        bytes
    };
    let clock = u64::from_le_bytes(field(0));
    let send_timestamp_us = i64::from_le_bytes(field(8));
    let len = u64::from_le_bytes(field(16)) as usize;

    let payload = buf
        .get(ENVELOPE_SIZE..)
        .and_then(|rest| rest.get(..len))
        .ok_or_else(|| {
            Error::MalformedRecord(format!(
                "sample announces {len} bytes, {} present",
                buf.len() - ENVELOPE_SIZE
            ))
        })?;
    Ok(SampleView {
        clock,
        send_timestamp_us,
        payload,
    })
}

pub fn decode_sample(buf: &[u8]) -> Result<Sample> {
    decode_sample_view(buf).map(|view| view.to_sample())
}

/// Publisher side of one topic.
pub struct ShmTopicWriter {
    topic_name: String,
    host_group: String,
    /// Never empty.
    buffers: Vec<SynchronizedWriter>,
    next: AtomicUsize,
    zero_copy: bool,
}

impl ShmTopicWriter {
    /// Create the writer and its `config.buffer_count` segments, named after
    /// `topic_name` and this process.
    pub fn new(
        registry: Arc<SegmentRegistry>,
        topic_name: &str,
        host_group: &str,
        config: ShmConfig,
    ) -> Result<Self> {
        let count = config.buffer_count.max(1);
        let process_id = std::process::id();
        let buffers = (0..count)
            .map(|index| {
                let suffix = (count > 1).then(|| index.to_string());
                let name = super::segment_name(topic_name, process_id, suffix.as_deref());
                SynchronizedWriter::with_segment_name(Arc::clone(&registry), &name, config.clone())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            topic_name: topic_name.to_string(),
            host_group: host_group.to_string(),
            buffers,
            next: AtomicUsize::new(0),
            zero_copy: config.zero_copy,
        })
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn buffers(&self) -> &[SynchronizedWriter] {
        &self.buffers
    }

    pub fn segment_names(&self) -> Vec<String> {
        self.buffers
            .iter()
            .map(|writer| writer.segment_name().to_string())
            .collect()
    }

    pub fn connection_parameter(&self) -> ConnectionParameter {
        ConnectionParameter {
            segment_names: self.segment_names(),
        }
    }

    /// SHM layer entry for this publisher's topic registration.
    pub fn layer_info(&self) -> LayerInfo {
        LayerInfo {
            kind: LayerKind::Shm,
            version: LAYER_VERSION,
            enabled: true,
            parameter: self.connection_parameter().to_blob(),
        }
    }

    /// Notify `process_id` on every buffer. Returns `true` if any buffer
    /// was newly connected.
    pub fn connect(&self, process_id: u32) -> Result<bool> {
        let mut changed = false;
        for writer in &self.buffers {
            changed |= writer.connect(process_id)?;
        }
        Ok(changed)
    }

    pub fn disconnect(&self, process_id: u32) -> bool {
        self.buffers
            .iter()
            .fold(false, |changed, writer| writer.disconnect(process_id) | changed)
    }

    pub fn is_connected(&self, process_id: u32) -> bool {
        self.buffers.iter().any(|writer| writer.is_connected(process_id))
    }

    pub fn connected_peers(&self) -> Vec<u32> {
        let peers: BTreeSet<u32> = self
            .buffers
            .iter()
            .flat_map(SynchronizedWriter::connected_peers)
            .collect();
        peers.into_iter().collect()
    }

    /// Publish one sample on the next buffer. `false` means it was dropped
    /// (already logged).
    pub fn write(&self, data: &WriterData<'_>) -> bool {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.buffers.len();
        let writer = &self.buffers[index];
        let result = if self.zero_copy {
            writer.publish_parts(&[&encode_envelope(data), data.payload])
        } else {
            writer.publish(&encode_sample(data))
        };

        match result {
            Ok(_) => true,
            Err(e) if e.is_transient() => {
                log::debug!("[writer] {} dropped sample {}: {}", self.topic_name, data.clock, e);
                false
            }
            Err(e) => {
                log::warn!("[writer] {} dropped sample {}: {}", self.topic_name, data.clock, e);
                false
            }
        }
    }

    /// Close every buffer.
    pub fn close(&self) {
        for writer in &self.buffers {
            writer.close();
        }
    }

    fn is_local_subscriber(&self, host_group: &str, topic: &TopicInfo) -> bool {
        topic.direction == TopicDirection::Subscriber
            && topic.topic_name == self.topic_name
            && host_group == self.host_group
            && topic.layers.iter().any(|l| l.kind == LayerKind::Shm && l.enabled)
    }

    /// React to a subscriber registration. Returns `true` if the peer set changed.
    pub fn apply_subscription(&self, record: &DiscoveryRecord) -> bool {
        let Some(topic) = record.as_topic() else {
            return false;
        };
        if !self.is_local_subscriber(record.host_group(), topic) {
            return false;
        }
        let pid = record.identifier.process_id;
        match record.command {
            Command::Register => match self.connect(pid) {
                Ok(changed) => changed,
                Err(e) => {
                    log::debug!("[writer] {} will retry process {}: {}", self.topic_name, pid, e);
                    false
                }
            },
            Command::Unregister => self.disconnect(pid),
        }
    }

    /// Disconnect peers that expired from the directory.
    pub fn retain_live_subscribers(&self, applier: &DirectoryApplier) -> usize {
        let live: BTreeSet<u32> = applier
            .snapshot_topics()
            .into_iter()
            .filter(|(id, topic)| {
                let group = if topic.host_group.is_empty() {
                    id.host_name.as_str()
                } else {
                    topic.host_group.as_str()
                };
                self.is_local_subscriber(group, topic)
            })
            .map(|(id, _)| id.process_id)
            .collect();

        self.connected_peers()
            .into_iter()
            .filter(|pid| !live.contains(pid))
            .filter(|pid| self.disconnect(*pid))
            .count()
    }
}

/// Subscriber side of one topic.
pub struct ShmTopicReader {
    topic_name: String,
    pool: Arc<SegmentReaderPool>,
    id: SubscriptionId,
    bound: Mutex<BTreeSet<String>>,
}

impl ShmTopicReader {
    /// Subscribe with a consumer that receives owned samples.
    pub fn new<F>(pool: Arc<SegmentReaderPool>, topic_name: &str, on_sample: F) -> Self
    where
        F: Fn(&Sample) + Send + Sync + 'static,
    {
        Self::with_view(pool, topic_name, move |view: &SampleView<'_>| {
            on_sample(&view.to_sample());
        })
    }

    /// Subscribe with a consumer that borrows each sample from the reader's
    /// buffer, or from the mapping itself when the pool runs `zero_copy`.
    pub fn with_view<F>(pool: Arc<SegmentReaderPool>, topic_name: &str, on_view: F) -> Self
    where
        F: Fn(&SampleView<'_>) + Send + Sync + 'static,
    {
        let topic = topic_name.to_string();
        let consumer: Consumer = Arc::new(move |_: SubscriptionId, buf: &[u8]| {
            match decode_sample_view(buf) {
                Ok(view) => on_view(&view),
                Err(e) => log::debug!("[reader] {} skipped payload: {}", topic, e),
            }
        });
        let id = pool.register(consumer);
        Self {
            topic_name: topic_name.to_string(),
            pool,
            id,
            bound: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.id
    }

    pub fn bound_segments(&self) -> Vec<String> {
        self.bound.lock().iter().cloned().collect()
    }

    /// Bind every announced segment not bound yet, and rebind those whose
    /// name now refers to a recreated segment. Segments that cannot be
    /// opened are skipped and retried with the next announcement. Returns
    /// the number of segments (re)bound.
    pub fn apply_parameter(&self, blob: &[u8]) -> Result<usize> {
        let parameter = ConnectionParameter::from_blob(blob)?;
        let mut added = 0;
        for name in parameter.segment_names {
            let known = self.bound.lock().contains(&name);
            if known && self.pool.is_bound(self.id, &name) {
                match self.pool.rebind_if_replaced(&name) {
                    Ok(true) => added += 1,
                    Ok(false) => {}
                    Err(e) => {
                        log::debug!("[reader] {} lost {}: {}", self.topic_name, name, e);
                        self.bound.lock().remove(&name);
                    }
                }
                continue;
            }

            match self.pool.subscribe(self.id, &name) {
                Ok(()) => {
                    self.bound.lock().insert(name);
                    added += 1;
                }
                Err(e) => {
                    log::debug!("[reader] {} cannot bind {}: {}", self.topic_name, name, e);
                    self.bound.lock().remove(&name);
                }
            }
        }
        Ok(added)
    }

    /// React to a publisher registration of this topic.
    pub fn apply_publication(&self, record: &DiscoveryRecord) -> usize {
        let Some(topic) = record.as_topic() else {
            return 0;
        };
        if topic.direction != TopicDirection::Publisher || topic.topic_name != self.topic_name {
            return 0;
        }
        let Some(blob) = topic.layer_parameter(LayerKind::Shm) else {
            return 0;
        };

        match record.command {
            Command::Register => self.apply_parameter(blob).unwrap_or_else(|e| {
                log::debug!("[reader] {}: {}", self.topic_name, e);
                0
            }),
            Command::Unregister => match ConnectionParameter::from_blob(blob) {
                Ok(parameter) => self.unbind_all(parameter.segment_names),
                Err(_) => 0,
            },
        }
    }

    /// Unbind segments whose publisher expired from the directory.
    pub fn retain_live_publishers(&self, applier: &DirectoryApplier) -> usize {
        let live: BTreeSet<String> = applier
            .snapshot_topics()
            .into_iter()
            .filter(|(_, topic)| {
                topic.direction == TopicDirection::Publisher && topic.topic_name == self.topic_name
            })
            .filter_map(|(_, topic)| {
                topic
                    .layer_parameter(LayerKind::Shm)
                    .and_then(|blob| ConnectionParameter::from_blob(blob).ok())
            })
            .flat_map(|parameter| parameter.segment_names)
            .collect();

        let expired: Vec<String> = self
            .bound
            .lock()
            .iter()
            .filter(|name| !live.contains(*name))
            .cloned()
            .collect();
        self.unbind_all(expired)
    }

    /// The bound set is not locked while the pool stops reader threads, so
    /// consumers may query this reader meanwhile.
    fn unbind_all(&self, names: Vec<String>) -> usize {
        names
            .into_iter()
            .filter(|name| self.bound.lock().remove(name))
            .filter(|name| {
                let unbound = self.pool.unbind(self.id, name);
                if unbound {
                    log::debug!("[reader] {} unbound {}", self.topic_name, name);
                }
                unbound
            })
            .count()
    }
}

impl Drop for ShmTopicReader {
    fn drop(&mut self) {
        self.pool.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::AccessMode;
    use std::time::Duration;

    #[test]
    fn test_envelope_layout() {
        let buf = encode_sample(&WriterData {
            payload: b"abc",
            send_timestamp_us: -5,
            clock: 9,
        });
        assert_eq!(buf.len(), ENVELOPE_SIZE + 3);
        assert_eq!(buf[0], 9);
        assert_eq!(&buf[16..24], &3u64.to_le_bytes());

        let sample = decode_sample(&buf).unwrap();
        assert_eq!(sample.clock, 9);
        assert_eq!(sample.send_timestamp_us, -5);
        assert_eq!(sample.payload, b"abc");
    }

    #[test]
    fn test_decode_rejects_truncated_samples() {
        assert!(decode_sample(&[0u8; 10]).is_err());

        let mut buf = encode_sample(&WriterData {
            payload: b"abcdef",
            send_timestamp_us: 0,
            clock: 1,
        });
        buf.truncate(ENVELOPE_SIZE + 2);
        assert!(matches!(decode_sample(&buf), Err(Error::MalformedRecord(_))));
    }

    #[test]
    fn test_connection_parameter_blob() {
        let param = ConnectionParameter {
            segment_names: vec!["/peerbus_a_1".into(), "/peerbus_a_1_b".into()],
        };
        assert_eq!(ConnectionParameter::from_blob(&param.to_blob()).unwrap(), param);
        assert!(ConnectionParameter::from_blob(b"[1,2").is_err());
    }

    fn shm_config(buffer_count: usize, zero_copy: bool) -> ShmConfig {
        ShmConfig {
            initial_capacity: 128,
            buffer_count,
            zero_copy,
            ..ShmConfig::default()
        }
    }

    fn last_sample(registry: &Arc<SegmentRegistry>, name: &str) -> Sample {
        let handle = registry.open_existing(name).unwrap();
        let guard = handle
            .acquire(AccessMode::Read, Duration::from_millis(100))
            .unwrap();
        decode_sample(guard.payload().unwrap()).unwrap()
    }

    #[test]
    fn test_buffers_are_announced_and_rotated() {
        let registry = SegmentRegistry::new(&ShmConfig::default());
        let topic = format!("rot{}", std::process::id());
        let writer = ShmTopicWriter::new(Arc::clone(&registry), &topic, "h", shm_config(3, false))
            .unwrap();

        let names = writer.segment_names();
        assert_eq!(names.len(), 3);
        assert!(names[0].ends_with("_0"));
        assert!(names[2].ends_with("_2"));
        assert_eq!(writer.connection_parameter().segment_names, names);

        for clock in 0..4u64 {
            assert!(writer.write(&WriterData {
                payload: b"x",
                send_timestamp_us: 0,
                clock,
            }));
        }
        let clocks: Vec<u64> = names
            .iter()
            .map(|name| last_sample(&registry, name).clock)
            .collect();
        assert_eq!(clocks, vec![3, 1, 2]);
    }

    #[test]
    fn test_single_buffer_keeps_plain_name() {
        let registry = SegmentRegistry::new(&ShmConfig::default());
        let topic = format!("one{}", std::process::id());
        let writer = ShmTopicWriter::new(registry, &topic, "h", shm_config(1, false)).unwrap();
        assert_eq!(
            writer.segment_names(),
            vec![crate::shm::segment_name(&topic, std::process::id(), None)]
        );
    }

    #[test]
    fn test_zero_copy_write_stores_an_envelope() {
        let registry = SegmentRegistry::new(&ShmConfig::default());
        let topic = format!("zc{}", std::process::id());
        let writer = ShmTopicWriter::new(Arc::clone(&registry), &topic, "h", shm_config(1, true))
            .unwrap();
        assert!(writer.write(&WriterData {
            payload: b"in place",
            send_timestamp_us: 77,
            clock: 5,
        }));

        let sample = last_sample(&registry, &writer.segment_names()[0]);
        assert_eq!(sample.clock, 5);
        assert_eq!(sample.send_timestamp_us, 77);
        assert_eq!(sample.payload, b"in place");
    }
}

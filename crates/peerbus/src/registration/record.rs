// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery records.
//!
//! Every process periodically announces itself and each of its publishers,
//! subscribers, services and clients. Records are idempotent heartbeats:
//! the same record may arrive many times, out of order, or not at all.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Who emitted a record. Unique per entity across the system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Identifier {
    pub host_name: String,
    pub process_id: u32,
    /// Entity within the process (topic/service/client id; empty for the process itself)
    #[serde(default)]
    pub entity_id: String,
}

impl Identifier {
    pub fn new(host_name: impl Into<String>, process_id: u32, entity_id: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            process_id,
            entity_id: entity_id.into(),
        }
    }
}

/// Register refreshes an entry; unregister is a best-effort early removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    #[default]
    Register,
    Unregister,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Unknown,
    Healthy,
    Warning,
    Critical,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessState {
    pub severity: Severity,
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessInfo {
    pub host_group: String,
    pub process_name: String,
    pub unit_name: String,
    pub parameters: String,
    pub state: ProcessState,
    pub runtime_version: String,
    /// Sender-side heartbeat counter
    pub registration_clock: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicDirection {
    #[default]
    Publisher,
    Subscriber,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataTypeInfo {
    pub name: String,
    pub encoding: String,
    pub descriptor: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    #[default]
    Shm,
    Udp,
    Tcp,
}

/// A transport a topic endpoint offers, with its opaque connection parameter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerInfo {
    pub kind: LayerKind,
    pub version: u32,
    pub enabled: bool,
    pub parameter: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicInfo {
    pub topic_name: String,
    pub direction: TopicDirection,
    /// Host group of the emitter; empty means "its host name"
    pub host_group: String,
    pub process_name: String,
    pub unit_name: String,
    pub datatype: DataTypeInfo,
    pub layers: Vec<LayerInfo>,
    pub topic_size: u64,
    pub connections_local: u32,
    pub connections_external: u32,
    pub message_drops: u64,
    pub data_clock: u64,
    /// Data frequency in mHz
    pub data_frequency: u32,
    pub registration_clock: u64,
}

impl TopicInfo {
    /// Parameter of the first enabled layer of `kind`.
    pub fn layer_parameter(&self, kind: LayerKind) -> Option<&[u8]> {
        self.layers
            .iter()
            .find(|layer| layer.kind == kind && layer.enabled)
            .map(|layer| layer.parameter.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodInfo {
    pub name: String,
    pub request_type: String,
    pub response_type: String,
    pub call_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInfo {
    pub service_name: String,
    pub process_name: String,
    pub unit_name: String,
    pub methods: Vec<MethodInfo>,
    pub tcp_port: u16,
    pub version: u32,
    pub registration_clock: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientInfo {
    pub service_name: String,
    pub process_name: String,
    pub unit_name: String,
    pub methods: Vec<MethodInfo>,
    pub version: u32,
    pub registration_clock: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordPayload {
    Process(ProcessInfo),
    Topic(TopicInfo),
    Service(ServiceInfo),
    Client(ClientInfo),
}

/// One decoded discovery heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub identifier: Identifier,
    #[serde(default)]
    pub command: Command,
    pub payload: RecordPayload,
}

impl DiscoveryRecord {
    pub fn register(identifier: Identifier, payload: RecordPayload) -> Self {
        Self {
            identifier,
            command: Command::Register,
            payload,
        }
    }

    pub fn unregister(identifier: Identifier, payload: RecordPayload) -> Self {
        Self {
            identifier,
            command: Command::Unregister,
            payload,
        }
    }

    /// Decode a JSON-encoded record.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::MalformedRecord(e.to_string()))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::MalformedRecord(e.to_string()))
    }

    /// Host group used for filtering: a topic's own group when it names one,
    /// else the emitter's host name. Other record kinds carry no group.
    pub fn host_group(&self) -> &str {
        match &self.payload {
            RecordPayload::Topic(topic) if !topic.host_group.is_empty() => &topic.host_group,
            _ => &self.identifier.host_name,
        }
    }

    pub fn as_topic(&self) -> Option<&TopicInfo> {
        match &self.payload {
            RecordPayload::Topic(topic) => Some(topic),
            _ => None,
        }
    }
}

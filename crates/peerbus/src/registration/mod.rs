// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Soft-state discovery.
//!
//! Processes announce themselves and their endpoints with periodic
//! [`DiscoveryRecord`]s. The [`DirectoryApplier`] filters them and keeps one
//! [`ExpiringDirectory`] per record kind; liveness is purely a matter of
//! records arriving before the timeout.

mod applier;
mod directory;
mod monitoring;
mod record;
mod sweeper;

pub use applier::{
    ApplierSettings, ApplierStats, ApplyOutcome, Customer, DirectoryApplier, RejectReason,
};
pub use directory::{DirectoryEntry, ExpiringDirectory};
pub use monitoring::{Monitoring, MonitoringSnapshot, TopicFilter};
pub use record::{
    ClientInfo, Command, DataTypeInfo, DiscoveryRecord, Identifier, LayerInfo, LayerKind,
    MethodInfo, ProcessInfo, ProcessState, RecordPayload, ServiceInfo, Severity, TopicDirection,
    TopicInfo,
};
pub use sweeper::DirectorySweeper;

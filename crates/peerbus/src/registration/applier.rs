// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Filters incoming discovery records and fans them out.
//!
//! # Acceptance rules
//!
//! - A record from this process's host group is accepted unless it was
//!   emitted by this very process and loopback is disabled.
//! - A record from any other host group is accepted only in network mode.
//!
//! Accepted records refresh (or, for unregister, drop) their directory
//! entry, then go to every customer in registration order. Customers run
//! after all directory locks are released.

use super::directory::ExpiringDirectory;
use super::record::{
    ClientInfo, Command, DiscoveryRecord, Identifier, ProcessInfo, RecordPayload, ServiceInfo,
    TopicDirection, TopicInfo,
};
use crate::config::Config;
use crate::error::Result;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identity and filtering switches of the local process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplierSettings {
    pub host_name: String,
    pub host_group_name: String,
    pub process_id: u32,
    pub network_enabled: bool,
    pub loopback: bool,
    pub timeout: Duration,
}

impl ApplierSettings {
    /// Settings for the current process.
    pub fn from_config(config: &Config) -> Self {
        Self {
            host_name: crate::host_name(),
            host_group_name: config.host_group_name(),
            process_id: std::process::id(),
            network_enabled: config.registration.network_enabled,
            loopback: config.registration.loopback,
            timeout: config.registration.timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// From another host group while network mode is off
    ForeignHostGroup,
    /// From this process while loopback is off
    OwnProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Accepted,
    Rejected(RejectReason),
}

impl ApplyOutcome {
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

/// External collaborator fed with every accepted record.
pub type Customer = Arc<dyn Fn(&DiscoveryRecord) + Send + Sync>;

#[derive(Debug, Default)]
pub struct ApplierStats {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub malformed: AtomicU64,
}

pub struct DirectoryApplier {
    settings: RwLock<ApplierSettings>,
    processes: ExpiringDirectory<Identifier, ProcessInfo>,
    topics: ExpiringDirectory<Identifier, TopicInfo>,
    services: ExpiringDirectory<Identifier, ServiceInfo>,
    clients: ExpiringDirectory<Identifier, ClientInfo>,
    customers: RwLock<Vec<(String, Customer)>>,
    stats: ApplierStats,
}

impl DirectoryApplier {
    pub fn new(settings: ApplierSettings) -> Self {
        let timeout = settings.timeout;
        Self {
            settings: RwLock::new(settings),
            processes: ExpiringDirectory::new(timeout),
            topics: ExpiringDirectory::new(timeout),
            services: ExpiringDirectory::new(timeout),
            clients: ExpiringDirectory::new(timeout),
            customers: RwLock::new(Vec::new()),
            stats: ApplierStats::default(),
        }
    }

    pub fn settings(&self) -> ApplierSettings {
        self.settings.read().clone()
    }

    pub fn set_loopback(&self, enabled: bool) {
        self.settings.write().loopback = enabled;
    }

    pub fn stats(&self) -> &ApplierStats {
        &self.stats
    }

    /// Register or replace the customer `name`. A replaced customer keeps
    /// its position in the call order.
    pub fn add_customer(&self, name: &str, customer: Customer) {
        let mut customers = self.customers.write();
        if let Some(slot) = customers.iter_mut().find(|(n, _)| n == name) {
            slot.1 = customer;
        } else {
            customers.push((name.to_string(), customer));
        }
    }

    pub fn remove_customer(&self, name: &str) -> bool {
        let mut customers = self.customers.write();
        let before = customers.len();
        customers.retain(|(n, _)| n != name);
        customers.len() != before
    }

    fn filter(&self, record: &DiscoveryRecord) -> ApplyOutcome {
        let settings = self.settings.read();
        let group = record.host_group();
        let member = !group.is_empty()
            && !settings.host_group_name.is_empty()
            && group == settings.host_group_name;

        if member {
            let own = record.identifier.process_id == settings.process_id
                && record.identifier.host_name == settings.host_name;
            if own && !settings.loopback {
                return ApplyOutcome::Rejected(RejectReason::OwnProcess);
            }
            ApplyOutcome::Accepted
        } else if settings.network_enabled {
            ApplyOutcome::Accepted
        } else {
            ApplyOutcome::Rejected(RejectReason::ForeignHostGroup)
        }
    }

    /// Filter `record`, update the directories and notify customers.
    pub fn apply(&self, record: &DiscoveryRecord) -> ApplyOutcome {
        self.apply_at(record, Instant::now())
    }

    pub fn apply_at(&self, record: &DiscoveryRecord, now: Instant) -> ApplyOutcome {
        let outcome = self.filter(record);
        if let ApplyOutcome::Rejected(reason) = outcome {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "[registration] Discarded record from {}:{} ({:?})",
                record.identifier.host_name,
                record.identifier.process_id,
                reason
            );
            return outcome;
        }
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);

        let key = record.identifier.clone();
        match (&record.command, &record.payload) {
            (Command::Register, RecordPayload::Process(p)) => {
                self.processes.refresh_at(key, p.clone(), now);
            }
            (Command::Register, RecordPayload::Topic(t)) => {
                self.topics.refresh_at(key, t.clone(), now);
            }
            (Command::Register, RecordPayload::Service(s)) => {
                self.services.refresh_at(key, s.clone(), now);
            }
            (Command::Register, RecordPayload::Client(c)) => {
                self.clients.refresh_at(key, c.clone(), now);
            }
            (Command::Unregister, RecordPayload::Process(_)) => {
                self.processes.remove(&key);
            }
            (Command::Unregister, RecordPayload::Topic(_)) => {
                self.topics.remove(&key);
            }
            (Command::Unregister, RecordPayload::Service(_)) => {
                self.services.remove(&key);
            }
            (Command::Unregister, RecordPayload::Client(_)) => {
                self.clients.remove(&key);
            }
        }

        let customers: Vec<Customer> = self
            .customers
            .read()
            .iter()
            .map(|(_, customer)| Arc::clone(customer))
            .collect();
        for customer in customers {
            customer(record);
        }
        outcome
    }

    /// Decode a JSON record and apply it. Undecodable input is counted and
    /// dropped without touching any directory.
    pub fn apply_bytes(&self, bytes: &[u8]) -> Result<ApplyOutcome> {
        match DiscoveryRecord::from_slice(bytes) {
            Ok(record) => Ok(self.apply(&record)),
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                log::debug!("[registration] Dropped record: {}", e);
                Err(e)
            }
        }
    }

    /// Prune every directory with its timeout. Returns the removed count.
    pub fn prune_expired(&self, now: Instant) -> usize {
        let timeout = self.settings.read().timeout;
        self.processes.prune(now, timeout)
            + self.topics.prune(now, timeout)
            + self.services.prune(now, timeout)
            + self.clients.prune(now, timeout)
    }

    pub fn snapshot_processes(&self) -> Vec<(Identifier, ProcessInfo)> {
        self.processes.snapshot()
    }

    pub fn snapshot_topics(&self) -> Vec<(Identifier, TopicInfo)> {
        self.topics.snapshot()
    }

    pub fn snapshot_services(&self) -> Vec<(Identifier, ServiceInfo)> {
        self.services.snapshot()
    }

    pub fn snapshot_clients(&self) -> Vec<(Identifier, ClientInfo)> {
        self.clients.snapshot()
    }

    /// Live publishers of `topic_name`.
    pub fn publisher_ids(&self, topic_name: &str) -> Vec<Identifier> {
        self.topic_ids(topic_name, TopicDirection::Publisher)
    }

    /// Live subscribers of `topic_name`.
    pub fn subscriber_ids(&self, topic_name: &str) -> Vec<Identifier> {
        self.topic_ids(topic_name, TopicDirection::Subscriber)
    }

    fn topic_ids(&self, topic_name: &str, direction: TopicDirection) -> Vec<Identifier> {
        let mut ids = self
            .topics
            .filter_keys(|t| t.topic_name == topic_name && t.direction == direction);
        ids.sort();
        ids
    }

    pub fn processes(&self) -> &ExpiringDirectory<Identifier, ProcessInfo> {
        &self.processes
    }

    pub fn topics(&self) -> &ExpiringDirectory<Identifier, TopicInfo> {
        &self.topics
    }

    pub fn services(&self) -> &ExpiringDirectory<Identifier, ServiceInfo> {
        &self.services
    }

    pub fn clients(&self) -> &ExpiringDirectory<Identifier, ClientInfo> {
        &self.clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    const ME: u32 = 100;

    fn settings() -> ApplierSettings {
        ApplierSettings {
            host_name: "alpha".into(),
            host_group_name: "alpha".into(),
            process_id: ME,
            network_enabled: false,
            loopback: false,
            timeout: Duration::from_millis(1000),
        }
    }

    fn topic(host: &str, pid: u32, name: &str, direction: TopicDirection) -> DiscoveryRecord {
        DiscoveryRecord::register(
            Identifier::new(host, pid, format!("{name}-{pid}")),
            RecordPayload::Topic(TopicInfo {
                topic_name: name.into(),
                direction,
                ..TopicInfo::default()
            }),
        )
    }

    fn process(host: &str, pid: u32) -> DiscoveryRecord {
        DiscoveryRecord::register(
            Identifier::new(host, pid, ""),
            RecordPayload::Process(ProcessInfo::default()),
        )
    }

    #[test]
    fn test_accepts_local_peer() {
        let applier = DirectoryApplier::new(settings());
        assert_eq!(applier.apply(&process("alpha", 7)), ApplyOutcome::Accepted);
        assert_eq!(applier.snapshot_processes().len(), 1);
    }

    #[test]
    fn test_rejects_own_process_without_loopback() {
        let applier = DirectoryApplier::new(settings());
        assert_eq!(
            applier.apply(&process("alpha", ME)),
            ApplyOutcome::Rejected(RejectReason::OwnProcess)
        );
        assert!(applier.snapshot_processes().is_empty());

        applier.set_loopback(true);
        assert!(applier.apply(&process("alpha", ME)).is_accepted());
    }

    #[test]
    fn test_foreign_group_needs_network_mode() {
        let applier = DirectoryApplier::new(settings());
        assert_eq!(
            applier.apply(&process("beta", 7)),
            ApplyOutcome::Rejected(RejectReason::ForeignHostGroup)
        );
        // Same pid on another host is not "own process".
        let networked = DirectoryApplier::new(ApplierSettings {
            network_enabled: true,
            ..settings()
        });
        assert!(networked.apply(&process("beta", ME)).is_accepted());
    }

    #[test]
    fn test_topic_host_group_overrides_host_name() {
        let applier = DirectoryApplier::new(settings());
        let mut record = topic("container-7", 9, "imu", TopicDirection::Publisher);
        if let RecordPayload::Topic(t) = &mut record.payload {
            t.host_group = "alpha".into();
        }
        assert!(applier.apply(&record).is_accepted());
    }

    #[test]
    fn test_empty_local_group_is_never_member() {
        let applier = DirectoryApplier::new(ApplierSettings {
            host_group_name: String::new(),
            ..settings()
        });
        assert_eq!(
            applier.apply(&process("alpha", 7)),
            ApplyOutcome::Rejected(RejectReason::ForeignHostGroup)
        );
    }

    #[test]
    fn test_unregister_removes_entry() {
        let applier = DirectoryApplier::new(settings());
        let record = topic("alpha", 5, "cam", TopicDirection::Subscriber);
        applier.apply(&record);
        assert_eq!(applier.subscriber_ids("cam").len(), 1);

        let bye = DiscoveryRecord::unregister(record.identifier.clone(), record.payload.clone());
        assert!(applier.apply(&bye).is_accepted());
        assert!(applier.subscriber_ids("cam").is_empty());
    }

    #[test]
    fn test_publisher_and_subscriber_ids() {
        let applier = DirectoryApplier::new(settings());
        applier.apply(&topic("alpha", 1, "imu", TopicDirection::Publisher));
        applier.apply(&topic("alpha", 2, "imu", TopicDirection::Publisher));
        applier.apply(&topic("alpha", 3, "imu", TopicDirection::Subscriber));
        applier.apply(&topic("alpha", 4, "gps", TopicDirection::Publisher));

        let pubs: Vec<u32> = applier
            .publisher_ids("imu")
            .iter()
            .map(|id| id.process_id)
            .collect();
        assert_eq!(pubs, vec![1, 2]);
        assert_eq!(applier.subscriber_ids("imu").len(), 1);
        assert!(applier.subscriber_ids("gps").is_empty());
    }

    #[test]
    fn test_customers_called_in_order_outside_locks() {
        let applier = Arc::new(DirectoryApplier::new(settings()));
        let calls = Arc::new(Mutex::new(Vec::new()));

        let log_a = Arc::clone(&calls);
        let inner = Arc::clone(&applier);
        applier.add_customer(
            "monitoring",
            Arc::new(move |_| {
                // Re-entrant query must not deadlock.
                let seen = inner.snapshot_processes().len();
                log_a.lock().push(("monitoring", seen));
            }),
        );
        let log_b = Arc::clone(&calls);
        applier.add_customer("gate", Arc::new(move |_| log_b.lock().push(("gate", 0))));

        applier.apply(&process("alpha", 7));
        assert_eq!(*calls.lock(), vec![("monitoring", 1), ("gate", 0)]);

        // Rejected records reach nobody.
        applier.apply(&process("beta", 7));
        assert_eq!(calls.lock().len(), 2);

        assert!(applier.remove_customer("monitoring"));
        applier.apply(&process("alpha", 8));
        assert_eq!(calls.lock().last(), Some(&("gate", 0)));
        assert_eq!(calls.lock().len(), 3);
    }

    #[test]
    fn test_replacing_customer_keeps_position() {
        let applier = DirectoryApplier::new(settings());
        let calls = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b"] {
            let log = Arc::clone(&calls);
            applier.add_customer(name, Arc::new(move |_| log.lock().push(name)));
        }
        let log = Arc::clone(&calls);
        applier.add_customer("a", Arc::new(move |_| log.lock().push("a2")));

        applier.apply(&process("alpha", 7));
        assert_eq!(*calls.lock(), vec!["a2", "b"]);
    }

    #[test]
    fn test_apply_bytes_drops_malformed() {
        let applier = DirectoryApplier::new(settings());
        assert!(applier.apply_bytes(b"\x00\x01garbage").is_err());
        assert_eq!(applier.stats().malformed.load(Ordering::Relaxed), 1);

        let good = process("alpha", 7).to_vec().unwrap();
        assert!(applier.apply_bytes(&good).unwrap().is_accepted());
        assert_eq!(applier.snapshot_processes().len(), 1);
    }

    #[test]
    fn test_prune_expired_covers_all_directories() {
        let applier = DirectoryApplier::new(settings());
        let t0 = Instant::now();
        applier.apply_at(&process("alpha", 1), t0);
        applier.apply_at(&topic("alpha", 1, "t", TopicDirection::Publisher), t0);
        applier.apply_at(
            &DiscoveryRecord::register(
                Identifier::new("alpha", 1, "svc"),
                RecordPayload::Service(ServiceInfo::default()),
            ),
            t0,
        );
        applier.apply_at(
            &DiscoveryRecord::register(
                Identifier::new("alpha", 1, "cli"),
                RecordPayload::Client(ClientInfo::default()),
            ),
            t0,
        );

        assert_eq!(applier.prune_expired(t0 + Duration::from_millis(500)), 0);
        assert_eq!(applier.prune_expired(t0 + Duration::from_millis(1500)), 4);
        assert!(applier.snapshot_topics().is_empty());
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monitoring view over the discovery directories.
//!
//! Topic filters are comma/semicolon separated regular expressions matched
//! case-insensitively against the whole topic name. A topic is shown when it
//! matches no exclude pattern and either matches an include pattern or no
//! include pattern is configured.

use super::applier::DirectoryApplier;
use super::record::{ClientInfo, Identifier, ProcessInfo, ServiceInfo, TopicDirection, TopicInfo};
use crate::config::MonitoringConfig;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct TopicFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TopicFilter {
    /// Filter that shows every topic.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Build from pattern lists such as `"^rt_.*;debug.*"`.
    pub fn new(include: &str, exclude: &str) -> Result<Self> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    pub fn accepts(&self, topic_name: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(topic_name)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(topic_name))
    }
}

fn compile(list: &str) -> Result<Vec<Regex>> {
    list.split([',', ';'])
        .map(str::trim)
        .filter(|pattern| !pattern.is_empty())
        .map(|pattern| {
            RegexBuilder::new(&format!("^(?:{pattern})$"))
                .case_insensitive(true)
                .build()
                .map_err(|e| Error::Config(format!("topic filter {pattern:?}: {e}")))
        })
        .collect()
}

/// Copy of the directories at one instant, topics filtered and split by
/// direction, every list ordered by identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitoringSnapshot {
    pub processes: Vec<(Identifier, ProcessInfo)>,
    pub publishers: Vec<(Identifier, TopicInfo)>,
    pub subscribers: Vec<(Identifier, TopicInfo)>,
    pub services: Vec<(Identifier, ServiceInfo)>,
    pub clients: Vec<(Identifier, ClientInfo)>,
}

pub struct Monitoring {
    applier: Arc<DirectoryApplier>,
    filter: RwLock<TopicFilter>,
}

impl Monitoring {
    pub fn new(applier: Arc<DirectoryApplier>, filter: TopicFilter) -> Self {
        Self {
            applier,
            filter: RwLock::new(filter),
        }
    }

    pub fn from_config(applier: Arc<DirectoryApplier>, config: &MonitoringConfig) -> Result<Self> {
        let filter = if config.filter_enabled {
            TopicFilter::new(&config.filter_include, &config.filter_exclude)?
        } else {
            TopicFilter::allow_all()
        };
        Ok(Self::new(applier, filter))
    }

    pub fn set_filter(&self, filter: TopicFilter) {
        *self.filter.write() = filter;
    }

    pub fn snapshot(&self) -> MonitoringSnapshot {
        let filter = self.filter.read().clone();

        let (mut publishers, mut subscribers): (Vec<_>, Vec<_>) = self
            .applier
            .snapshot_topics()
            .into_iter()
            .filter(|(_, topic)| filter.accepts(&topic.topic_name))
            .partition(|(_, topic)| topic.direction == TopicDirection::Publisher);
        publishers.sort_by(|a, b| a.0.cmp(&b.0));
        subscribers.sort_by(|a, b| a.0.cmp(&b.0));

        let mut processes = self.applier.snapshot_processes();
        processes.sort_by(|a, b| a.0.cmp(&b.0));
        let mut services = self.applier.snapshot_services();
        services.sort_by(|a, b| a.0.cmp(&b.0));
        let mut clients = self.applier.snapshot_clients();
        clients.sort_by(|a, b| a.0.cmp(&b.0));

        MonitoringSnapshot {
            processes,
            publishers,
            subscribers,
            services,
            clients,
        }
    }
}

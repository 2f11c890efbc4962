// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime configuration.
//!
//! Supports both programmatic and file-based configuration. Files are TOML;
//! JSON is accepted for embedding the configuration in another document.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registration: RegistrationConfig,

    #[serde(default)]
    pub shm: ShmConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Discovery directory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Entries not refreshed within this window are expired (milliseconds)
    #[serde(default = "default_registration_timeout")]
    pub timeout_ms: u64,

    /// Background prune period (milliseconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Host group this process belongs to (defaults to the host name)
    #[serde(default)]
    pub host_group_name: Option<String>,

    /// Accept records from outside the local host group
    #[serde(default)]
    pub network_enabled: bool,

    /// Accept records emitted by this very process
    #[serde(default)]
    pub loopback: bool,
}

fn default_registration_timeout() -> u64 {
    60_000
}

fn default_sweep_interval() -> u64 {
    1_000
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_registration_timeout(),
            sweep_interval_ms: default_sweep_interval(),
            host_group_name: None,
            network_enabled: false,
            loopback: false,
        }
    }
}

impl RegistrationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Shared-memory data plane settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmConfig {
    /// Payload capacity of a freshly created segment (bytes)
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,

    /// Extra headroom added when a segment grows (percent of requested size)
    #[serde(default = "default_reserve_percent")]
    pub reserve_percent: u32,

    /// Bounded wait for the segment lock (milliseconds)
    #[serde(default = "default_open_timeout")]
    pub open_timeout_ms: u64,

    /// Per-publish ack window; 0 disables ack waiting (milliseconds)
    #[serde(default)]
    pub ack_timeout_ms: u64,

    /// Reader wake-up period used to observe stop requests (milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Reset the payload size after recovering a lock from a crashed holder
    #[serde(default = "default_true")]
    pub auto_sanitize: bool,

    /// Delete OS objects when the last local handle closes
    #[serde(default = "default_true")]
    pub remove_on_close: bool,

    /// Segments a topic writer rotates over
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,

    /// Write samples straight into the segment and dispatch them to
    /// consumers from the mapping, under the segment lock
    #[serde(default)]
    pub zero_copy: bool,
}

fn default_initial_capacity() -> usize {
    4096
}

fn default_reserve_percent() -> u32 {
    50
}

fn default_open_timeout() -> u64 {
    5
}

fn default_buffer_count() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            initial_capacity: default_initial_capacity(),
            reserve_percent: default_reserve_percent(),
            open_timeout_ms: default_open_timeout(),
            ack_timeout_ms: 0,
            poll_interval_ms: default_poll_interval(),
            auto_sanitize: true,
            remove_on_close: true,
            buffer_count: default_buffer_count(),
            zero_copy: false,
        }
    }
}

impl ShmConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Capacity to allocate for a payload of `size` bytes, headroom included.
    pub fn grown_capacity(&self, size: usize) -> usize {
        let reserve = size.saturating_mul(self.reserve_percent as usize) / 100;
        size.saturating_add(reserve).max(self.initial_capacity)
    }
}

/// Monitoring topic filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub filter_enabled: bool,

    /// Patterns of topics to show (`,`/`;` separated, empty shows all)
    #[serde(default)]
    pub filter_include: String,

    /// Patterns of topics to hide
    #[serde(default = "default_filter_exclude")]
    pub filter_exclude: String,
}

fn default_filter_exclude() -> String {
    "__.*".to_string()
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            filter_enabled: true,
            filter_include: String::new(),
            filter_exclude: default_filter_exclude(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.registration.timeout_ms == 0 {
            return Err(Error::Config("registration.timeout_ms must be > 0".into()));
        }
        if self.registration.sweep_interval_ms >= self.registration.timeout_ms {
            return Err(Error::Config(
                "registration.sweep_interval_ms must be smaller than registration.timeout_ms"
                    .into(),
            ));
        }
        if self.registration.sweep_interval_ms == 0 {
            return Err(Error::Config(
                "registration.sweep_interval_ms must be > 0".into(),
            ));
        }
        if self.shm.initial_capacity == 0 {
            return Err(Error::Config("shm.initial_capacity must be > 0".into()));
        }
        if self.shm.buffer_count == 0 {
            return Err(Error::Config("shm.buffer_count must be > 0".into()));
        }
        if self.shm.poll_interval_ms == 0 {
            return Err(Error::Config("shm.poll_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Host group in effect: the configured one, else the host name.
    pub fn host_group_name(&self) -> String {
        self.registration
            .host_group_name
            .clone()
            .filter(|g| !g.is_empty())
            .unwrap_or_else(crate::host_name)
    }
}

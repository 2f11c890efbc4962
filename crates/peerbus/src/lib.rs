// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # peerbus - soft-state discovery and shared-memory pub/sub
//!
//! Two cooperating layers for processes on one host (or one host group):
//!
//! - a **discovery directory** fed by periodic registration records, where
//!   entries live only as long as their owners keep refreshing them;
//! - a **shared-memory data plane** where one writer publishes payloads into
//!   a named segment and signals every connected reader process.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peerbus::shm::{SegmentReaderPool, SegmentRegistry, ShmTopicReader, ShmTopicWriter, WriterData};
//! use peerbus::Config;
//! use std::sync::Arc;
//!
//! fn main() -> peerbus::Result<()> {
//!     let config = Config::default();
//!     let registry = SegmentRegistry::new(&config.shm);
//!
//!     let writer = ShmTopicWriter::new(registry.clone(), "imu", &config.host_group_name(), config.shm.clone())?;
//!     let pool = Arc::new(SegmentReaderPool::new(registry, config.shm.clone()));
//!     let reader = ShmTopicReader::new(pool.clone(), "imu", |sample| println!("{} bytes", sample.payload.len()));
//!
//!     reader.apply_parameter(&writer.connection_parameter().to_blob())?;
//!     writer.connect(pool.process_id())?;
//!     writer.write(&WriterData { payload: b"hello", send_timestamp_us: 0, clock: 1 });
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------+
//! |  registration   DiscoveryRecord -> DirectoryApplier           |
//! |                 ExpiringDirectory x4, DirectorySweeper,       |
//! |                 Monitoring                                    |
//! +---------------------------------------------------------------+
//! |  shm            ShmTopicWriter / ShmTopicReader               |
//! |                 SynchronizedWriter, SegmentReaderPool         |
//! |                 SegmentRegistry -> MappedSegment              |
//! +---------------------------------------------------------------+
//! |  sync           NamedMutex (robust), NamedEvent (auto-reset)  |
//! +---------------------------------------------------------------+
//! ```

pub mod config;
pub mod error;
pub mod registration;
pub mod shm;
pub mod sync;

pub use config::{Config, MonitoringConfig, RegistrationConfig, ShmConfig};
pub use error::{Error, Result};
pub use registration::{DirectoryApplier, DiscoveryRecord, ExpiringDirectory, Identifier};
pub use shm::{SegmentReaderPool, SegmentRegistry, SynchronizedWriter};

/// Host name of this machine, `"localhost"` when it cannot be determined.
pub fn host_name() -> String {
    platform_host_name()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(unix)]
fn platform_host_name() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is writable for its full length.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}

#[cfg(windows)]
fn platform_host_name() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

/// Process id used in segment names and identifiers.
pub fn process_id() -> u32 {
    std::process::id()
}

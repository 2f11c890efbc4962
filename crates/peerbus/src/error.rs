// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy shared by the data plane and the discovery directory.
//!
//! Every variant is recovered locally by the component that produces it.
//! The visible effect of a failure is at most a dropped sample, a skipped
//! poll cycle or a delayed directory refresh.

use std::io;
use thiserror::Error;

/// Errors produced by peerbus components.
#[derive(Debug, Error)]
pub enum Error {
    /// A segment (or its lock/event backing object) could not be created or mapped.
    #[error("cannot map segment {name}: {source}")]
    Map {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The cross-process lock was not acquired in time. Skip this cycle.
    #[error("lock timeout on {0}")]
    LockTimeout(String),

    /// A peer did not acknowledge within the configured window.
    #[error("ack timeout from process {0}")]
    AckTimeout(u32),

    /// A discovery record or connection parameter could not be decoded.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// A write does not fit the current segment capacity.
    #[error("payload of {size} bytes exceeds capacity {capacity}")]
    CapacityExceeded { size: usize, capacity: usize },

    /// A name cannot be used for an OS-level object.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// The named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A synchronization primitive reported an OS failure.
    #[error("sync primitive {name} failed: {source}")]
    Sync {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The operation is not valid in the component's current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Configuration could not be parsed or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn map(name: &str, source: io::Error) -> Self {
        Self::Map {
            name: name.to_string(),
            source,
        }
    }

    pub(crate) fn sync(name: &str, source: io::Error) -> Self {
        Self::Sync {
            name: name.to_string(),
            source,
        }
    }

    /// Transient failures that callers should treat as "try again later".
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout(_) | Self::AckTimeout(_))
    }
}

/// Result type for peerbus operations.
pub type Result<T> = std::result::Result<T, Error>;

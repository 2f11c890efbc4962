// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Background expiration of directory entries.
//!
//! Queries already prune lazily; the sweeper bounds memory held by entries
//! nobody queries. Stopping is immediate: the stop channel doubles as the
//! sleep, so `stop()` never waits out a full interval.

use super::applier::DirectoryApplier;
use crate::config::RegistrationConfig;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub struct DirectorySweeper {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DirectorySweeper {
    /// Start pruning `applier` every `interval`.
    pub fn start(applier: Arc<DirectoryApplier>, interval: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("peerbus-sweeper".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let removed = applier.prune_expired(Instant::now());
                        if removed > 0 {
                            log::debug!("[registration] Expired {} entries", removed);
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Start pruning at the configured `sweep_interval_ms`.
    pub fn from_config(
        applier: Arc<DirectoryApplier>,
        config: &RegistrationConfig,
    ) -> std::io::Result<Self> {
        Self::start(applier, config.sweep_interval())
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the channel and wakes the thread.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DirectorySweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A peer that never acknowledges must not hold back the others.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use peerbus::shm::{channel_consumer, SegmentReaderPool, SegmentRegistry, SynchronizedWriter};
use peerbus::ShmConfig;
use std::time::{Duration, Instant};

#[test]
fn test_silent_peer_only_costs_one_ack_timeout() {
    let cfg = ShmConfig {
        poll_interval_ms: 10,
        open_timeout_ms: 100,
        ack_timeout_ms: 200,
        ..ShmConfig::default()
    };
    let writer =
        SynchronizedWriter::create(SegmentRegistry::new(&cfg), "it_isolation", cfg.clone())
            .unwrap();

    // Connected, but nothing ever waits on its events.
    let silent = 62_001;
    let responsive = 62_002;
    let pool = SegmentReaderPool::with_process_id(SegmentRegistry::new(&cfg), cfg.clone(), responsive);
    let (consumer, rx) = channel_consumer();
    pool.subscribe_with(writer.segment_name(), consumer).unwrap();

    writer.connect(silent).unwrap();
    writer.connect(responsive).unwrap();

    let started = Instant::now();
    let report = writer.publish(b"isolation").unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.signaled, 2);
    assert_eq!(report.ack_timeouts, vec![silent]);
    assert!(elapsed < Duration::from_secs(2), "publish took {elapsed:?}");

    let (_, payload) = rx.recv_timeout(cfg.ack_timeout()).unwrap();
    assert_eq!(payload, b"isolation");

    assert!(writer.disconnect(silent));
    let report = writer.publish(b"again").unwrap();
    assert!(report.ack_timeouts.is_empty());
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Soft-state map with expiration.
//!
//! Entries are upserted by heartbeats and disappear when no heartbeat was
//! seen within the timeout. An entry older than the timeout is treated as
//! absent by every query even before a prune pass removes it. The lock is
//! only held for map mutation or copying; callers always get owned copies.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// One directory slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry<T> {
    pub payload: T,
    pub last_refresh: Instant,
    /// Accepted refreshes since the entry appeared
    pub refresh_counter: u64,
}

impl<T> DirectoryEntry<T> {
    fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_refresh) > timeout
    }
}

pub struct ExpiringDirectory<K, T> {
    entries: RwLock<HashMap<K, DirectoryEntry<T>>>,
    timeout: Duration,
}

impl<K, T> ExpiringDirectory<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Upsert `key` now. Returns the entry's refresh counter.
    pub fn refresh(&self, key: K, payload: T) -> u64 {
        self.refresh_at(key, payload, Instant::now())
    }

    /// Upsert `key` as seen at `now`. Last writer wins on the payload.
    pub fn refresh_at(&self, key: K, payload: T, now: Instant) -> u64 {
        let mut entries = self.entries.write();
        let entry = entries.entry(key).or_insert_with(|| DirectoryEntry {
            payload: payload.clone(),
            last_refresh: now,
            refresh_counter: 0,
        });
        entry.payload = payload;
        entry.last_refresh = now;
        entry.refresh_counter += 1;
        entry.refresh_counter
    }

    /// Remove every entry not refreshed within `timeout` of `now`.
    /// Returns the number of removed entries.
    pub fn prune(&self, now: Instant, timeout: Duration) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_stale(now, timeout));
        before - entries.len()
    }

    /// Prune with the configured timeout, then copy the live entries.
    pub fn snapshot(&self) -> Vec<(K, T)> {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> Vec<(K, T)> {
        self.prune(now, self.timeout);
        self.entries
            .read()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.payload.clone()))
            .collect()
    }

    /// Copy of `key`'s entry unless it is missing or stale.
    pub fn entry(&self, key: &K) -> Option<DirectoryEntry<T>> {
        self.entry_at(key, Instant::now())
    }

    pub fn entry_at(&self, key: &K, now: Instant) -> Option<DirectoryEntry<T>> {
        self.entries
            .read()
            .get(key)
            .filter(|entry| !entry.is_stale(now, self.timeout))
            .cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entry(key).is_some()
    }

    pub fn remove(&self, key: &K) -> Option<T> {
        self.entries.write().remove(key).map(|entry| entry.payload)
    }

    /// Physically stored entries, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries whose payload matches `predicate`.
    pub fn filter_keys<F>(&self, predicate: F) -> Vec<K>
    where
        F: Fn(&T) -> bool,
    {
        let now = Instant::now();
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| !entry.is_stale(now, self.timeout) && predicate(&entry.payload))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(1000);

    #[test]
    fn test_double_refresh_counts_twice() {
        let dir = ExpiringDirectory::new(TIMEOUT);
        dir.refresh("k", 1);
        let baseline = dir.entry(&"k").unwrap().refresh_counter;

        dir.refresh("k", 2);
        dir.refresh("k", 3);

        assert_eq!(dir.len(), 1);
        let entry = dir.entry(&"k").unwrap();
        assert_eq!(entry.refresh_counter, baseline + 2);
        assert_eq!(entry.payload, 3, "last writer wins");
    }

    #[test]
    fn test_entry_expires_after_timeout() {
        let dir = ExpiringDirectory::new(TIMEOUT);
        let t0 = Instant::now();
        dir.refresh_at("k", "v", t0);

        let t1500 = t0 + Duration::from_millis(1500);
        assert_eq!(dir.prune(t1500, TIMEOUT), 1);
        assert!(dir.snapshot_at(t1500).is_empty());
        assert!(dir.entry_at(&"k", t1500).is_none());
    }

    #[test]
    fn test_entry_within_window_survives() {
        let dir = ExpiringDirectory::new(TIMEOUT);
        let t0 = Instant::now();
        dir.refresh_at("k", "v", t0);

        let t999 = t0 + Duration::from_millis(999);
        assert_eq!(dir.prune(t999, TIMEOUT), 0);
        assert_eq!(dir.snapshot_at(t999), vec![("k", "v")]);
    }

    #[test]
    fn test_stale_entry_is_absent_before_prune() {
        let dir = ExpiringDirectory::new(TIMEOUT);
        let t0 = Instant::now();
        dir.refresh_at("k", "v", t0);

        let later = t0 + Duration::from_secs(2);
        assert!(dir.entry_at(&"k", later).is_none());
        assert_eq!(dir.len(), 1, "still stored until pruned");
    }

    #[test]
    fn test_refresh_revives_entry() {
        let dir = ExpiringDirectory::new(TIMEOUT);
        let t0 = Instant::now();
        dir.refresh_at("k", "v", t0);
        let t2 = t0 + Duration::from_secs(2);
        dir.refresh_at("k", "v", t2);
        assert_eq!(dir.snapshot_at(t2).len(), 1);
    }

    #[test]
    fn test_prune_empty_and_remove_missing() {
        let dir: ExpiringDirectory<&str, u8> = ExpiringDirectory::new(TIMEOUT);
        assert_eq!(dir.prune(Instant::now(), TIMEOUT), 0);
        assert_eq!(dir.remove(&"nope"), None);
        assert!(dir.is_empty());
    }

    #[test]
    fn test_snapshot_is_detached_copy() {
        let dir = ExpiringDirectory::new(TIMEOUT);
        dir.refresh("a", 1);
        let snap = dir.snapshot();
        dir.refresh("a", 2);
        dir.refresh("b", 3);
        assert_eq!(snap, vec![("a", 1)]);
    }

    #[test]
    fn test_filter_keys() {
        let dir = ExpiringDirectory::new(TIMEOUT);
        dir.refresh(1, "pub");
        dir.refresh(2, "sub");
        dir.refresh(3, "pub");
        let mut keys = dir.filter_keys(|p| *p == "pub");
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 3]);
    }
}

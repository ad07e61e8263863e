//! In-process window store.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::StoreError;

use super::backend::WindowStore;
use super::status::Provider;
use super::window::{LimiterConfig, WindowOutcome};

/// A window store that keeps timestamp logs in process memory.
///
/// A single lock guards the whole map and is held for exactly one operation.
/// Records are kept sorted ascending so expiry is a prefix of the log.
#[derive(Debug, Default)]
pub struct LocalStore {
    records: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl LocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of the timestamps recorded for `key`, oldest first.
    ///
    /// Expired entries that have not been pruned yet are included.
    pub fn record(&self, key: &str) -> Vec<u64> {
        let records = self.records.lock();
        records
            .get(key)
            .map(|log| log.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Append a timestamp to the record for `key`.
    pub fn append(&self, key: &str, timestamp_ms: u64) {
        let mut records = self.records.lock();
        insert_sorted(records.entry(key.to_string()).or_default(), timestamp_ms);
    }

    /// Drop entries at or before `cutoff_ms` from the record for `key`.
    pub fn prune(&self, key: &str, cutoff_ms: u64) {
        let mut records = self.records.lock();
        if let Some(log) = records.get_mut(key) {
            let expired = expired_prefix(log, cutoff_ms);
            log.drain(..expired);
            if log.is_empty() {
                records.remove(key);
            }
        }
    }

    /// Get the number of keys currently held.
    pub fn key_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Clear all records.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

/// Number of leading entries at or before the cutoff.
fn expired_prefix(log: &VecDeque<u64>, cutoff_ms: u64) -> usize {
    log.partition_point(|&ts| ts <= cutoff_ms)
}

/// Insert keeping ascending order; a wall clock that stepped back lands mid-log.
fn insert_sorted(log: &mut VecDeque<u64>, timestamp_ms: u64) {
    match log.back() {
        Some(&last) if last > timestamp_ms => {
            let at = log.partition_point(|&ts| ts <= timestamp_ms);
            log.insert(at, timestamp_ms);
        }
        _ => log.push_back(timestamp_ms),
    }
}

#[async_trait]
impl WindowStore for LocalStore {
    async fn hit(
        &self,
        key: &str,
        now_ms: u64,
        config: &LimiterConfig,
    ) -> Result<WindowOutcome, StoreError> {
        let cutoff = config.cutoff(now_ms);
        let mut records = self.records.lock();

        let (count, oldest) = match records.get(key) {
            Some(log) => {
                let expired = expired_prefix(log, cutoff);
                ((log.len() - expired) as u32, log.get(expired).copied())
            }
            None => (0, None),
        };

        let outcome = WindowOutcome::evaluate(count, oldest, now_ms, config.limit());

        // Denials leave the record untouched; expired entries wait for the next write.
        if outcome.admitted {
            let log = records.entry(key.to_string()).or_default();
            let expired = expired_prefix(log, cutoff);
            log.drain(..expired);
            insert_sorted(log, now_ms);
        }

        trace!(key = %key, count = outcome.count, admitted = outcome.admitted, "Local window hit");
        Ok(outcome)
    }

    fn sweep(&self, now_ms: u64, config: &LimiterConfig) -> usize {
        let cutoff = config.cutoff(now_ms);
        let mut records = self.records.lock();
        let before = records.len();

        records.retain(|_, log| log.back().is_some_and(|&newest| newest > cutoff));

        let removed = before - records.len();
        if removed > 0 {
            debug!(removed = removed, remaining = records.len(), "Swept stale window records");
        }
        removed
    }

    fn provider(&self) -> Provider {
        Provider::InMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(limit: u32, window_ms: u64) -> LimiterConfig {
        LimiterConfig::new(limit, Duration::from_millis(window_ms)).unwrap()
    }

    #[test]
    fn test_append_and_record() {
        let store = LocalStore::new();
        store.append("k", 10);
        store.append("k", 20);
        assert_eq!(store.record("k"), vec![10, 20]);
        assert!(store.record("missing").is_empty());
    }

    #[test]
    fn test_append_out_of_order_keeps_sorted() {
        let store = LocalStore::new();
        store.append("k", 30);
        store.append("k", 10);
        store.append("k", 20);
        assert_eq!(store.record("k"), vec![10, 20, 30]);
    }

    #[test]
    fn test_prune_drops_cutoff_boundary() {
        let store = LocalStore::new();
        for ts in [10, 20, 30] {
            store.append("k", ts);
        }

        store.prune("k", 20);
        assert_eq!(store.record("k"), vec![30]);

        store.prune("k", 30);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_hit_admits_until_limit() {
        let store = LocalStore::new();
        let cfg = config(2, 1_000);

        assert!(store.hit("k", 100, &cfg).await.unwrap().admitted);
        assert!(store.hit("k", 200, &cfg).await.unwrap().admitted);

        let denied = store.hit("k", 300, &cfg).await.unwrap();
        assert!(!denied.admitted);
        assert_eq!(denied.count, 2);
        assert_eq!(denied.oldest_ms, Some(100));
    }

    #[tokio::test]
    async fn test_denied_hit_does_not_append() {
        let store = LocalStore::new();
        let cfg = config(1, 1_000);

        store.hit("k", 100, &cfg).await.unwrap();
        store.hit("k", 200, &cfg).await.unwrap();
        store.hit("k", 300, &cfg).await.unwrap();

        assert_eq!(store.record("k"), vec![100]);
    }

    #[tokio::test]
    async fn test_entry_at_cutoff_is_expired() {
        let store = LocalStore::new();
        let cfg = config(1, 1_000);

        store.hit("k", 100, &cfg).await.unwrap();
        assert!(!store.hit("k", 1_099, &cfg).await.unwrap().admitted);

        // 100 == 1_100 - 1_000, so the first entry no longer counts.
        let outcome = store.hit("k", 1_100, &cfg).await.unwrap();
        assert!(outcome.admitted);
        assert_eq!(store.record("k"), vec![1_100]);
    }

    #[test]
    fn test_sweep_removes_only_stale_keys() {
        let store = LocalStore::new();
        let cfg = config(5, 1_000);

        store.append("stale", 100);
        store.append("fresh", 100);
        store.append("fresh", 1_500);

        let removed = store.sweep(2_000, &cfg);
        assert_eq!(removed, 1);
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.record("fresh"), vec![100, 1_500]);
    }

    #[test]
    fn test_clear() {
        let store = LocalStore::new();
        store.append("a", 1);
        store.append("b", 1);
        assert_eq!(store.key_count(), 2);

        store.clear();
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn test_reports_in_memory_provider() {
        assert_eq!(LocalStore::new().provider(), Provider::InMemory);
    }
}

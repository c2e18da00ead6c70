//! In-process state store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{Fields, KeyedStateStore, Snapshot, StoreResult};

/// A stored record with its bookkeeping.
#[derive(Debug, Clone)]
struct MemoryRecord {
    revision: u64,
    fields: Fields,
    expires_at_ms: u64,
    touched_at_ms: u64,
}

impl MemoryRecord {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// State store backed by a concurrent map local to this process.
///
/// Each compare-and-set runs while holding the lock of the map shard that
/// owns the key, so writes to one key are serialized while unrelated keys
/// proceed in parallel. Expired records are dropped when next touched; there
/// is no background sweep.
///
/// Revisions come from one counter for the whole store, so a key that expires
/// and is created again never hands out a revision it used before.
pub struct MemoryStore {
    records: DashMap<String, MemoryRecord>,
    next_revision: AtomicU64,
    /// Soft upper bound on the number of stored keys
    max_keys: Option<usize>,
}

impl MemoryStore {
    /// Create an unbounded memory store.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            next_revision: AtomicU64::new(1),
            max_keys: None,
        }
    }

    /// Create a memory store that keeps roughly at most `max_keys` records.
    ///
    /// When a new key would exceed the cap, expired records are purged first
    /// and then the least recently written records are evicted in a batch.
    pub fn with_max_keys(max_keys: usize) -> Self {
        Self {
            records: DashMap::new(),
            next_revision: AtomicU64::new(1),
            max_keys: Some(max_keys.max(1)),
        }
    }

    /// Number of records currently held, expired or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.records.clear();
    }

    fn allocate_revision(&self) -> u64 {
        self.next_revision.fetch_add(1, Ordering::Relaxed)
    }

    /// Bring the store back under `max_keys` before a new key is inserted.
    ///
    /// Each pass is O(n): expired records are purged, then the least recently
    /// touched tenth of the cap is evicted in one batch. The next pass only
    /// runs once that headroom is used up again.
    fn make_room(&self, now_ms: u64) {
        let Some(max_keys) = self.max_keys else {
            return;
        };
        if self.records.len() < max_keys {
            return;
        }

        self.records.retain(|_, record| !record.is_expired(now_ms));
        let len = self.records.len();
        if len < max_keys {
            return;
        }

        let target = max_keys - (max_keys / 10).max(1);
        let excess = len - target;

        let mut by_age: Vec<(u64, String)> = self
            .records
            .iter()
            .map(|entry| (entry.value().touched_at_ms, entry.key().clone()))
            .collect();
        if excess < by_age.len() {
            by_age.select_nth_unstable(excess - 1);
            by_age.truncate(excess);
        }

        for (_, key) in by_age {
            self.records.remove(&key);
        }
        debug!(evicted = excess, max_keys = max_keys, "Evicted least recently used records");
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyedStateStore for MemoryStore {
    async fn load(&self, key: &str, now_ms: u64) -> StoreResult<Option<Snapshot>> {
        if let Some(record) = self.records.get(key) {
            if !record.is_expired(now_ms) {
                return Ok(Some(Snapshot {
                    revision: record.revision.to_string(),
                    fields: record.fields.clone(),
                }));
            }
        }

        if self
            .records
            .remove_if(key, |_, record| record.is_expired(now_ms))
            .is_some()
        {
            trace!(key = %key, "Dropped expired record");
        }
        Ok(None)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        fields: Fields,
        ttl: Duration,
        now_ms: u64,
    ) -> StoreResult<bool> {
        if self.max_keys.is_some() && !self.records.contains_key(key) {
            self.make_room(now_ms);
        }

        let expires_at_ms = now_ms.saturating_add(ttl.as_millis() as u64);

        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let live_revision = (!current.is_expired(now_ms)).then_some(current.revision);

                let matches = match (live_revision, expected) {
                    (None, None) => true,
                    (Some(revision), Some(expected)) => revision.to_string() == expected,
                    _ => false,
                };
                if !matches {
                    return Ok(false);
                }

                occupied.insert(MemoryRecord {
                    revision: self.allocate_revision(),
                    fields,
                    expires_at_ms,
                    touched_at_ms: now_ms,
                });
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(MemoryRecord {
                    revision: self.allocate_revision(),
                    fields,
                    expires_at_ms,
                    touched_at_ms: now_ms,
                });
                Ok(true)
            }
        }
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.records.remove(key);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_load_missing_key() {
        let store = MemoryStore::new();
        assert!(store.load("missing", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_then_load() {
        let store = MemoryStore::new();

        assert!(store
            .compare_and_set("k", None, fields(&[("a", "1")]), TTL, 1_000)
            .await
            .unwrap());

        let snapshot = store.load("k", 1_000).await.unwrap().unwrap();
        assert_eq!(snapshot.revision, "1");
        assert_eq!(snapshot.fields["a"], "1");
    }

    #[tokio::test]
    async fn test_create_conflicts_when_key_exists() {
        let store = MemoryStore::new();
        store
            .compare_and_set("k", None, fields(&[("a", "1")]), TTL, 0)
            .await
            .unwrap();

        let applied = store
            .compare_and_set("k", None, fields(&[("a", "2")]), TTL, 0)
            .await
            .unwrap();

        assert!(!applied);
        assert_eq!(store.load("k", 0).await.unwrap().unwrap().fields["a"], "1");
    }

    #[tokio::test]
    async fn test_stale_revision_rejected() {
        let store = MemoryStore::new();
        store
            .compare_and_set("k", None, fields(&[("a", "1")]), TTL, 0)
            .await
            .unwrap();
        store
            .compare_and_set("k", Some("1"), fields(&[("a", "2")]), TTL, 0)
            .await
            .unwrap();

        let applied = store
            .compare_and_set("k", Some("1"), fields(&[("a", "3")]), TTL, 0)
            .await
            .unwrap();

        assert!(!applied);
        let snapshot = store.load("k", 0).await.unwrap().unwrap();
        assert_eq!(snapshot.revision, "2");
        assert_eq!(snapshot.fields["a"], "2");
    }

    #[tokio::test]
    async fn test_expired_record_is_absent_and_dropped() {
        let store = MemoryStore::new();
        store
            .compare_and_set("k", None, fields(&[("a", "1")]), TTL, 0)
            .await
            .unwrap();

        assert!(store.load("k", 9_999).await.unwrap().is_some());
        assert!(store.load("k", 10_000).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_record_can_be_recreated() {
        let store = MemoryStore::new();
        store
            .compare_and_set("k", None, fields(&[("a", "1")]), TTL, 0)
            .await
            .unwrap();

        // Expired but not yet dropped: a writer that saw nothing may replace it.
        let applied = store
            .compare_and_set("k", None, fields(&[("a", "2")]), TTL, 20_000)
            .await
            .unwrap();

        assert!(applied);
        assert_eq!(
            store.load("k", 20_000).await.unwrap().unwrap().fields["a"],
            "2"
        );
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryStore::new();
        store
            .compare_and_set("k", None, fields(&[("a", "1")]), TTL, 0)
            .await
            .unwrap();

        store.remove("k").await.unwrap();
        assert!(store.load("k", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_max_keys_evicts_expired_first() {
        let store = MemoryStore::with_max_keys(2);
        store
            .compare_and_set("short", None, Fields::new(), Duration::from_millis(5), 0)
            .await
            .unwrap();
        store
            .compare_and_set("long", None, Fields::new(), TTL, 0)
            .await
            .unwrap();

        store
            .compare_and_set("new", None, Fields::new(), TTL, 100)
            .await
            .unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.load("long", 100).await.unwrap().is_some());
        assert!(store.load("new", 100).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_max_keys_evicts_least_recently_touched() {
        let store = MemoryStore::with_max_keys(2);
        store
            .compare_and_set("a", None, Fields::new(), TTL, 0)
            .await
            .unwrap();
        store
            .compare_and_set("b", None, Fields::new(), TTL, 5)
            .await
            .unwrap();
        store
            .compare_and_set("a", Some("1"), Fields::new(), TTL, 10)
            .await
            .unwrap();

        store
            .compare_and_set("c", None, Fields::new(), TTL, 20)
            .await
            .unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.load("b", 20).await.unwrap().is_none());
        assert!(store.load("a", 20).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_max_keys_evicts_in_batches() {
        let store = MemoryStore::with_max_keys(20);
        for i in 0..20u64 {
            store
                .compare_and_set(&format!("k{}", i), None, Fields::new(), TTL, i)
                .await
                .unwrap();
        }

        store
            .compare_and_set("new", None, Fields::new(), TTL, 100)
            .await
            .unwrap();

        // Two oldest evicted to leave headroom, then the new key inserted.
        assert_eq!(store.len(), 19);
        assert!(store.load("k0", 100).await.unwrap().is_none());
        assert!(store.load("k1", 100).await.unwrap().is_none());
        assert!(store.load("k2", 100).await.unwrap().is_some());

        store
            .compare_and_set("newer", None, Fields::new(), TTL, 101)
            .await
            .unwrap();
        assert_eq!(store.len(), 20);
        assert!(store.load("k2", 101).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recreated_key_never_reuses_revision() {
        let store = MemoryStore::new();
        store
            .compare_and_set("k", None, fields(&[("a", "old")]), Duration::from_secs(1), 0)
            .await
            .unwrap();

        let stale = store.load("k", 999).await.unwrap().unwrap();
        assert!(store.load("k", 1_000).await.unwrap().is_none());

        store
            .compare_and_set("k", None, fields(&[("a", "new")]), Duration::from_secs(1), 1_000)
            .await
            .unwrap();

        // A writer that read the previous lifetime's record loses its race.
        let applied = store
            .compare_and_set(
                "k",
                Some(stale.revision.as_str()),
                fields(&[("a", "from-stale")]),
                Duration::from_secs(1),
                999,
            )
            .await
            .unwrap();

        assert!(!applied);
        let current = store.load("k", 1_000).await.unwrap().unwrap();
        assert_ne!(current.revision, stale.revision);
        assert_eq!(current.fields["a"], "new");
    }
}

//! Process-local cache of completed idempotency records.
//!
//! A bounded LRU keyed by idempotency key. Purely a latency optimization
//! for warm re-invocations within one process: correctness never depends
//! on its contents, and only `COMPLETED` records are admitted. Expiry is
//! checked on lookup and expired entries are removed on access.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::record::{DataRecord, RecordStatus, Timestamp};

/// LRU cache of completed records with expiry checked on lookup.
pub struct LocalCache {
    inner: Mutex<LruCache<String, DataRecord>>,
}

impl LocalCache {
    /// Create a cache holding at most `max_items` records.
    pub fn new(max_items: usize) -> Self {
        let capacity = NonZeroUsize::new(max_items.max(1)).expect("capacity is clamped to >= 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Get a live completed record, if cached.
    ///
    /// Returns `None` for absent or expired entries; expired entries are
    /// evicted on access.
    pub fn get(&self, key: &str, now: Timestamp) -> Option<DataRecord> {
        let mut cache = self.inner.lock().ok()?;
        if let Some(record) = cache.get(key) {
            if !record.is_expired(now) {
                return Some(record.clone());
            }
            cache.pop(key);
        }
        None
    }

    /// Insert a newly completed record. Anything else is ignored.
    pub fn put(&self, record: &DataRecord) {
        if record.status != RecordStatus::Completed {
            return;
        }
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(record.idempotency_key.clone(), record.clone());
        }
    }

    /// Drop a record the handler has found to be stale.
    pub fn evict(&self, key: &str) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.pop(key);
        }
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(key: &str, expiry_ts: u64) -> DataRecord {
        DataRecord::completed(key, expiry_ts, r#"{"ok":true}"#.to_string(), None)
    }

    fn at(seconds: u64) -> Timestamp {
        Timestamp::from_seconds(seconds)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let cache = LocalCache::new(4);
        let record = completed("fn#a", 100);

        assert!(cache.get("fn#a", at(10)).is_none());
        cache.put(&record);
        assert_eq!(cache.get("fn#a", at(10)), Some(record));
    }

    #[test]
    fn test_expired_entry_removed_on_access() {
        let cache = LocalCache::new(4);
        cache.put(&completed("fn#a", 100));

        assert!(cache.get("fn#a", at(100)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_only_completed_records_admitted() {
        let cache = LocalCache::new(4);
        cache.put(&DataRecord::in_progress("fn#a", 100, 100_000, None));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = LocalCache::new(2);
        cache.put(&completed("fn#a", 100));
        cache.put(&completed("fn#b", 100));

        // Touch a so b becomes the eviction candidate.
        cache.get("fn#a", at(10));
        cache.put(&completed("fn#c", 100));

        assert!(cache.get("fn#a", at(10)).is_some());
        assert!(cache.get("fn#b", at(10)).is_none());
        assert!(cache.get("fn#c", at(10)).is_some());
    }

    #[test]
    fn test_evict() {
        let cache = LocalCache::new(2);
        cache.put(&completed("fn#a", 100));
        cache.evict("fn#a");
        assert!(cache.get("fn#a", at(10)).is_none());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let cache = LocalCache::new(0);
        cache.put(&completed("fn#a", 100));
        assert_eq!(cache.len(), 1);
    }
}

//! In-memory persistence store.
//!
//! A process-local map honoring the exact conditional-put semantics of
//! the DynamoDB store. Used by the test suite and usable for
//! single-process deployments where the table round-trip is unwanted.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::record::{DataRecord, Timestamp};
use crate::store::{PersistenceStore, StoreError};

/// Map-backed store with DynamoDB-equivalent conditional writes.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, DataRecord>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live rows (test helper).
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// True when no rows exist (test helper).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of a row without protocol semantics (test helper).
    pub fn peek(&self, key: &str) -> Option<DataRecord> {
        self.records.lock().ok()?.get(key).cloned()
    }

    /// All live keys (test helper).
    pub fn peek_keys(&self) -> Vec<String> {
        self.records
            .lock()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Plants a row verbatim, bypassing the conditional put (test helper
    /// for staging contention and lease-expiry fixtures).
    pub fn plant(&self, record: DataRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(record.idempotency_key.clone(), record);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, DataRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::backend("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn put_record(&self, record: &DataRecord, now: Timestamp) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        if let Some(existing) = records.get(&record.idempotency_key) {
            if !existing.is_logically_absent(now) {
                return Err(StoreError::ItemAlreadyExists {
                    existing: Some(existing.clone()),
                });
            }
        }
        records.insert(record.idempotency_key.clone(), record.clone());
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<DataRecord, StoreError> {
        self.lock()?
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::ItemNotFound {
                key: key.to_string(),
            })
    }

    async fn update_record(&self, record: &DataRecord) -> Result<(), StoreError> {
        self.lock()?
            .insert(record.idempotency_key.clone(), record.clone());
        Ok(())
    }

    async fn delete_record(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }
}

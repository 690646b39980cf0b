//! Persistence store contract for idempotency records.
//!
//! This module defines the [`PersistenceStore`] trait the handler drives
//! and the store-internal [`StoreError`] kinds it consumes. Implementations
//! must honor the conditional-put semantics exactly; everything else in
//! the protocol builds on that single primitive.
//!
//! Two implementations ship with the crate:
//!
//! - [`dynamodb::DynamoDbStore`]: conditional writes against a DynamoDB
//!   table with a TTL attribute
//! - [`in_memory::InMemoryStore`]: the same semantics over a process-local
//!   map, for tests and single-process deployments

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{DataRecord, Timestamp};

pub mod dynamodb;
pub mod in_memory;

/// Shared handle to a persistence store.
pub type SharedStore = Arc<dyn PersistenceStore>;

/// Store-internal error kinds.
///
/// `ItemAlreadyExists` and `ItemNotFound` are protocol signals consumed
/// by the handler and never surfaced to users; only `Backend` crosses
/// over, wrapped as a persistence-layer error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The conditional put lost to a live existing row.
    #[error("Item already exists")]
    ItemAlreadyExists {
        /// The existing row, when the backend returned it with the
        /// conditional failure. `None` forces the caller to read it back.
        existing: Option<DataRecord>,
    },

    /// No row exists for the requested key.
    #[error("Item not found for key '{key}'")]
    ItemNotFound {
        /// The key that was looked up
        key: String,
    },

    /// Unexpected backend failure (network, throttling, malformed row).
    #[error("Store backend error: {message}")]
    Backend {
        /// Description of the failure
        message: String,
    },
}

impl StoreError {
    /// Creates a new Backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Conditional-write persistence for [`DataRecord`]s.
///
/// All inter-process ordering in the protocol is mediated by `put_record`:
/// the backend must evaluate its condition atomically against the current
/// row. `update_record` and `delete_record` are unconditional.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Inserts a new `INPROGRESS` row.
    ///
    /// Must succeed iff no row exists for the key, or the existing row is
    /// logically absent at `now`: its `expiry_ts` has passed, or it is
    /// `INPROGRESS` with a lapsed lease. On contention, fails with
    /// [`StoreError::ItemAlreadyExists`], carrying the existing row when
    /// the backend can return it.
    ///
    /// The caller supplies `now` so the condition is evaluated against
    /// one consistent instant.
    async fn put_record(&self, record: &DataRecord, now: Timestamp) -> Result<(), StoreError>;

    /// Returns the stored row for a key, or
    /// [`StoreError::ItemNotFound`]. Rows are returned as stored; the
    /// caller derives `EXPIRED` via
    /// [`DataRecord::status_at`](crate::DataRecord::status_at).
    async fn get_record(&self, key: &str) -> Result<DataRecord, StoreError>;

    /// Unconditionally writes status, expiry, response data, and payload
    /// hash for the record's key.
    async fn update_record(&self, record: &DataRecord) -> Result<(), StoreError>;

    /// Unconditionally deletes the row for a key. Deleting an absent row
    /// is not an error.
    async fn delete_record(&self, key: &str) -> Result<(), StoreError>;
}

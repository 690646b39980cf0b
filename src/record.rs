//! Persistence data model for the idempotency protocol.
//!
//! A [`DataRecord`] is the single row type exchanged with the store. Its
//! lifecycle is driven by the handler: created as `INPROGRESS`, promoted
//! exactly once to `COMPLETED` on success, or deleted on failure.
//! `EXPIRED` is derived on read and never written.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Status of a stored idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    /// An execution holds the key; its lease bounds how long.
    #[serde(rename = "INPROGRESS")]
    InProgress,
    /// The execution finished and its response is stored.
    #[serde(rename = "COMPLETED")]
    Completed,
    /// Derived on read when `expiry_ts` has passed; never written.
    #[serde(rename = "EXPIRED")]
    Expired,
}

impl RecordStatus {
    /// The wire representation stored in the status column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "INPROGRESS",
            Self::Completed => "COMPLETED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parses a wire representation back into a status.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INPROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instant captured as both unix seconds and unix milliseconds.
///
/// The row TTL column (`expiry_ts`) is compared in seconds while the
/// in-progress lease is compared in milliseconds. Capturing both from a
/// single `SystemTime` read keeps every comparison within one protocol
/// step consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    /// Unix epoch seconds
    pub seconds: u64,
    /// Unix epoch milliseconds
    pub millis: u64,
}

impl Timestamp {
    /// Captures the current wall-clock instant.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: elapsed.as_secs(),
            millis: elapsed.as_millis() as u64,
        }
    }

    /// Builds a timestamp from unix seconds (test fixtures).
    pub fn from_seconds(seconds: u64) -> Self {
        Self {
            seconds,
            millis: seconds * 1000,
        }
    }
}

/// A single idempotency row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRecord {
    /// Primary lookup key: `"{function_name}#{hex_digest}"`
    pub idempotency_key: String,
    /// Stored status (`INPROGRESS` or `COMPLETED`)
    pub status: RecordStatus,
    /// Unix seconds after which the row is meaningless and may be
    /// garbage-collected by the backend TTL sweeper
    pub expiry_ts: u64,
    /// Lease deadline for an in-progress execution, unix milliseconds.
    /// Distinct from `expiry_ts` so a lease can lapse long before the
    /// row itself is collected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_progress_expiry_ms: Option<u64>,
    /// Serialized successful return value; present iff `COMPLETED`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_data: Option<String>,
    /// Hash of the validation subtree, present when payload validation
    /// is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<String>,
}

impl DataRecord {
    /// Creates a fresh in-progress record.
    pub fn in_progress(
        idempotency_key: impl Into<String>,
        expiry_ts: u64,
        in_progress_expiry_ms: u64,
        payload_hash: Option<String>,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            status: RecordStatus::InProgress,
            expiry_ts,
            in_progress_expiry_ms: Some(in_progress_expiry_ms),
            response_data: None,
            payload_hash,
        }
    }

    /// Creates a completed record carrying the serialized response.
    pub fn completed(
        idempotency_key: impl Into<String>,
        expiry_ts: u64,
        response_data: String,
        payload_hash: Option<String>,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            status: RecordStatus::Completed,
            expiry_ts,
            in_progress_expiry_ms: None,
            response_data: Some(response_data),
            payload_hash,
        }
    }

    /// True once the row TTL has passed (`expiry_ts <= now`).
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiry_ts <= now.seconds
    }

    /// True when the record is in progress and its lease has lapsed.
    pub fn lease_expired(&self, now: Timestamp) -> bool {
        self.status == RecordStatus::InProgress
            && self
                .in_progress_expiry_ms
                .map(|deadline| deadline <= now.millis)
                .unwrap_or(false)
    }

    /// True when the record no longer blocks a new execution: either the
    /// row TTL passed or the in-progress lease lapsed.
    pub fn is_logically_absent(&self, now: Timestamp) -> bool {
        self.is_expired(now) || self.lease_expired(now)
    }

    /// The status as observed at `now`: a row past its TTL reads as
    /// `EXPIRED` regardless of what is stored.
    pub fn status_at(&self, now: Timestamp) -> RecordStatus {
        if self.is_expired(now) {
            RecordStatus::Expired
        } else {
            self.status
        }
    }
}

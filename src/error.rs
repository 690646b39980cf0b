//! Error types for the idempotency middleware.
//!
//! This module defines the failure kinds surfaced by the handler. Store
//! implementations have their own internal error type
//! ([`StoreError`](crate::store::StoreError)); only unexpected store
//! failures cross into this taxonomy, as [`IdempotencyError::PersistenceLayer`].

use thiserror::Error;

/// Boxed error type used to carry user-function failures through the
/// middleware without altering them.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The main error type for the idempotency middleware.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// Another invocation holds a live in-progress lease for the same key.
    ///
    /// The middleware does not block-wait for the winner; the calling
    /// runtime is expected to retry after the reported lease deadline.
    #[error("Execution already in progress for idempotency key '{key}'")]
    AlreadyInProgress {
        /// The contested idempotency key
        key: String,
        /// The other execution's lease deadline, unix milliseconds, if known
        lease_expiry_ms: Option<u64>,
    },

    /// The stored payload hash does not match the current event.
    ///
    /// Indicates a key collision or a tampered payload: two events derived
    /// the same idempotency key but differ in the validation subtree.
    #[error("Payload validation failed for idempotency key '{key}'")]
    PayloadValidationFailed {
        /// The idempotency key whose stored hash mismatched
        key: String,
    },

    /// The key selector produced nothing and strict mode is enabled.
    #[error("Failed to extract idempotency key: {message}")]
    KeyExtractionFailed {
        /// What went wrong during selection
        message: String,
    },

    /// Unexpected backend failure (network, throttling, malformed row).
    #[error("Persistence layer error: {message}")]
    PersistenceLayer {
        /// Description of the underlying failure
        message: String,
    },

    /// Invalid configuration detected at construction time.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the invalid knob
        message: String,
    },

    /// Serialization or deserialization of a response payload failed.
    #[error("Serialization error: {message}")]
    SerDes {
        /// Description of the serde failure
        message: String,
    },

    /// Error raised by the wrapped user function, re-surfaced unchanged
    /// after the in-progress row has been released.
    #[error("User function error: {source}")]
    UserFunction {
        /// The original user error
        #[source]
        source: BoxError,
    },
}

impl IdempotencyError {
    /// Creates a new KeyExtractionFailed error.
    pub fn key_extraction(message: impl Into<String>) -> Self {
        Self::KeyExtractionFailed {
            message: message.into(),
        }
    }

    /// Creates a new PersistenceLayer error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::PersistenceLayer {
            message: message.into(),
        }
    }

    /// Creates a new Configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new SerDes error.
    pub fn serdes(message: impl Into<String>) -> Self {
        Self::SerDes {
            message: message.into(),
        }
    }

    /// Wraps a user-function error.
    pub fn user_function(source: impl Into<BoxError>) -> Self {
        Self::UserFunction {
            source: source.into(),
        }
    }

    /// Returns true if this error came from the wrapped user function
    /// rather than from the middleware itself.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::UserFunction { .. })
    }
}

impl From<serde_json::Error> for IdempotencyError {
    fn from(error: serde_json::Error) -> Self {
        Self::SerDes {
            message: error.to_string(),
        }
    }
}

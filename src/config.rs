//! Configuration for the idempotency middleware.
//!
//! All knobs are read once at construction and immutable thereafter.
//! The only ambient inputs are three environment variables, each read a
//! single time when the handler is built:
//!
//! - [`ENV_IDEMPOTENCY_DISABLED`] - global kill switch
//! - [`ENV_TABLE_NAME`] - default table binding for the DynamoDB store
//! - [`ENV_FUNCTION_NAME`] - default key salt on Lambda

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IdempotencyError;

/// Kill switch: `"true"` bypasses the middleware entirely.
pub const ENV_IDEMPOTENCY_DISABLED: &str = "IDEMPOTENCY_DISABLED";

/// Default table binding for the DynamoDB store.
pub const ENV_TABLE_NAME: &str = "TABLE_NAME";

/// Set by the Lambda runtime; used as the default key salt.
pub const ENV_FUNCTION_NAME: &str = "AWS_LAMBDA_FUNCTION_NAME";

/// Returns true when the process-wide kill switch is set.
///
/// Callers may check this before constructing a store at all; the
/// handler also honors it on every invocation.
pub fn disabled_by_env() -> bool {
    std::env::var(ENV_IDEMPOTENCY_DISABLED)
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Digest algorithm used for key derivation and payload validation.
///
/// The digest only has to make accidental key collisions negligible;
/// a 128-bit digest is sufficient and is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// 128-bit digest (default)
    #[default]
    Md5,
    /// 256-bit digest, for deployments standardized on SHA-2
    Sha256,
}

/// Immutable configuration for an [`Idempotency`](crate::Idempotency)
/// handler.
///
/// Construct via [`IdempotencyConfig::builder`]; invalid combinations are
/// rejected with [`IdempotencyError::Configuration`] when the handler is
/// built.
///
/// # Example
///
/// ```
/// use lambda_idempotency::IdempotencyConfig;
/// use std::time::Duration;
///
/// let config = IdempotencyConfig::builder()
///     .event_key_expression("body.orderId")
///     .payload_validation_expression("body.amount")
///     .record_ttl(Duration::from_secs(3600))
///     .use_local_cache(true)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// Selector for the idempotency key subtree (JMESPath). Required.
    pub event_key_expression: String,
    /// Selector for the validation subtree; `None` disables validation.
    pub payload_validation_expression: Option<String>,
    /// Retention of a `COMPLETED` row. Default: 1 hour.
    pub record_ttl: Duration,
    /// In-progress lease length. Default: 30 seconds.
    pub execution_timeout: Duration,
    /// Enable the process-local LRU of completed records. Default: false.
    pub use_local_cache: bool,
    /// LRU bound. Default: 256.
    pub local_cache_max_items: usize,
    /// Digest algorithm. Default: 128-bit.
    pub hash_algorithm: HashAlgorithm,
    /// Fail with `KeyExtractionFailed` when the key selector misses
    /// instead of running the function unprotected. Default: false.
    pub raise_on_no_idempotency_key: bool,
}

impl IdempotencyConfig {
    /// Default retention of a completed row.
    pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(60 * 60);

    /// Default in-progress lease length.
    pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default local cache capacity.
    pub const DEFAULT_CACHE_MAX_ITEMS: usize = 256;

    /// Creates a builder with a required key selector to fill in.
    pub fn builder() -> IdempotencyConfigBuilder {
        IdempotencyConfigBuilder::default()
    }

    /// Checks the configuration for internally inconsistent knobs.
    pub(crate) fn validate(&self) -> Result<(), IdempotencyError> {
        if self.event_key_expression.trim().is_empty() {
            return Err(IdempotencyError::configuration(
                "event_key_expression must not be empty",
            ));
        }
        if let Some(expr) = &self.payload_validation_expression {
            if expr.trim().is_empty() {
                return Err(IdempotencyError::configuration(
                    "payload_validation_expression must not be empty when set",
                ));
            }
        }
        if self.record_ttl.is_zero() {
            return Err(IdempotencyError::configuration(
                "record_ttl must be positive",
            ));
        }
        if self.execution_timeout.is_zero() {
            return Err(IdempotencyError::configuration(
                "execution_timeout must be positive",
            ));
        }
        if self.use_local_cache && self.local_cache_max_items == 0 {
            return Err(IdempotencyError::configuration(
                "local_cache_max_items must be positive when the cache is enabled",
            ));
        }
        Ok(())
    }
}

/// Builder for [`IdempotencyConfig`].
#[derive(Debug, Clone)]
pub struct IdempotencyConfigBuilder {
    event_key_expression: String,
    payload_validation_expression: Option<String>,
    record_ttl: Duration,
    execution_timeout: Duration,
    use_local_cache: bool,
    local_cache_max_items: usize,
    hash_algorithm: HashAlgorithm,
    raise_on_no_idempotency_key: bool,
}

impl Default for IdempotencyConfigBuilder {
    fn default() -> Self {
        Self {
            event_key_expression: String::new(),
            payload_validation_expression: None,
            record_ttl: IdempotencyConfig::DEFAULT_RECORD_TTL,
            execution_timeout: IdempotencyConfig::DEFAULT_EXECUTION_TIMEOUT,
            use_local_cache: false,
            local_cache_max_items: IdempotencyConfig::DEFAULT_CACHE_MAX_ITEMS,
            hash_algorithm: HashAlgorithm::default(),
            raise_on_no_idempotency_key: false,
        }
    }
}

impl IdempotencyConfigBuilder {
    /// Sets the key selector expression (required).
    pub fn event_key_expression(mut self, expression: impl Into<String>) -> Self {
        self.event_key_expression = expression.into();
        self
    }

    /// Sets the validation selector expression.
    pub fn payload_validation_expression(mut self, expression: impl Into<String>) -> Self {
        self.payload_validation_expression = Some(expression.into());
        self
    }

    /// Sets the retention of completed rows.
    pub fn record_ttl(mut self, ttl: Duration) -> Self {
        self.record_ttl = ttl;
        self
    }

    /// Sets the in-progress lease length.
    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Enables or disables the process-local cache.
    pub fn use_local_cache(mut self, enabled: bool) -> Self {
        self.use_local_cache = enabled;
        self
    }

    /// Sets the local cache capacity.
    pub fn local_cache_max_items(mut self, max_items: usize) -> Self {
        self.local_cache_max_items = max_items;
        self
    }

    /// Sets the digest algorithm.
    pub fn hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = algorithm;
        self
    }

    /// Fail instead of bypassing when the key selector misses.
    pub fn raise_on_no_idempotency_key(mut self, raise: bool) -> Self {
        self.raise_on_no_idempotency_key = raise;
        self
    }

    /// Builds the configuration. Validation happens when the handler is
    /// constructed, so an incomplete config is representable but unusable.
    pub fn build(self) -> IdempotencyConfig {
        IdempotencyConfig {
            event_key_expression: self.event_key_expression,
            payload_validation_expression: self.payload_validation_expression,
            record_ttl: self.record_ttl,
            execution_timeout: self.execution_timeout,
            use_local_cache: self.use_local_cache,
            local_cache_max_items: self.local_cache_max_items,
            hash_algorithm: self.hash_algorithm,
            raise_on_no_idempotency_key: self.raise_on_no_idempotency_key,
        }
    }
}

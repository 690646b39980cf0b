//! The idempotency protocol orchestrator.
//!
//! [`Idempotency`] wraps a user handler of shape
//! `(event, context) -> response` and drives the record state machine:
//!
//! ```text
//!           put ok
//!    NEW ─────────────► INPROGRESS ──user ok──► COMPLETED ──ttl──► (gc)
//!     │   put conflict       │  user fails
//!     │                      └──────► (deleted)
//!     │   get(existing)
//!     └──► (observe existing state)
//! ```
//!
//! A successful conditional put makes this invocation the executor; a
//! conflict routes through duplicate resolution, which either returns the
//! stored response, retakes a logically absent row, or reports a live
//! duplicate. The store's conditional write is the only inter-process
//! synchronization point.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::cache::LocalCache;
use crate::config::{disabled_by_env, IdempotencyConfig, ENV_FUNCTION_NAME};
use crate::error::{BoxError, IdempotencyError};
use crate::key::{format_key, hash_subtree};
use crate::record::{DataRecord, RecordStatus, Timestamp};
use crate::selector::Selector;
use crate::store::{SharedStore, StoreError};

/// Extra conditional-put attempts allowed while resolving a duplicate
/// whose row keeps turning out to be logically absent. Bounds the
/// takeover loop so two stale-row observers cannot livelock.
const MAX_TAKEOVER_RETRIES: usize = 2;

/// Boxed future returned by wrapped handlers.
pub type HandlerFuture<R> =
    Pin<Box<dyn Future<Output = Result<R, IdempotencyError>> + Send + 'static>>;

/// The idempotency middleware.
///
/// Holds the store handle, the compiled selectors, and the optional
/// process-local cache. Construct once per process (selectors compile at
/// construction) and reuse across warm invocations, typically behind an
/// [`Arc`].
///
/// # Example
///
/// ```no_run
/// use lambda_idempotency::{Idempotency, IdempotencyConfig, InMemoryStore};
/// use serde_json::{json, Value};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), lambda_idempotency::IdempotencyError> {
/// let config = IdempotencyConfig::builder()
///     .event_key_expression("body.orderId")
///     .build();
///
/// let idempotency = Idempotency::builder()
///     .store(Arc::new(InMemoryStore::new()))
///     .config(config)
///     .function_name("process-order")
///     .build()?;
///
/// let event = json!({"body": {"orderId": "order-123"}});
/// let response: Value = idempotency
///     .handle(event, (), |_event: Value, _ctx: ()| async move {
///         // Side effects run at most once per order id.
///         Ok::<_, std::io::Error>(json!({"charged": true}))
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Idempotency {
    store: SharedStore,
    config: IdempotencyConfig,
    function_name: String,
    key_selector: Selector,
    validation_selector: Option<Selector>,
    cache: Option<LocalCache>,
    disabled: bool,
}

impl std::fmt::Debug for Idempotency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Idempotency")
            .field("function_name", &self.function_name)
            .field("key_selector", &self.key_selector.source())
            .field("cache_enabled", &self.cache.is_some())
            .field("disabled", &self.disabled)
            .finish()
    }
}

/// Outcome of duplicate resolution for one conditional-put round.
enum PutOutcome {
    /// This invocation won the row and must execute.
    Acquired,
    /// A completed record exists; return its stored response.
    Completed(DataRecord),
    /// The observed row is logically absent; retry the put.
    Stale,
}

impl Idempotency {
    /// Creates a builder.
    pub fn builder() -> IdempotencyBuilder {
        IdempotencyBuilder::default()
    }

    /// Runs `handler(event, context)` under the idempotency protocol.
    ///
    /// Returns the handler's response, either freshly computed (this
    /// invocation won the key) or deserialized from the stored record of
    /// an earlier winner. User-function failures release the in-progress
    /// row before propagating.
    pub async fn handle<C, F, Fut, R, E>(
        &self,
        event: Value,
        context: C,
        handler: F,
    ) -> Result<R, IdempotencyError>
    where
        F: FnOnce(Value, C) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: Serialize + DeserializeOwned,
        E: Into<BoxError>,
    {
        if self.disabled {
            tracing::debug!(function = %self.function_name, "idempotency disabled, bypassing");
            return handler(event, context)
                .await
                .map_err(|e| IdempotencyError::user_function(e));
        }

        let key = match self.derive_key(&event)? {
            Some(key) => key,
            None => {
                // Documented bypass: no key subtree, no guarantee.
                tracing::warn!(
                    function = %self.function_name,
                    selector = %self.key_selector.source(),
                    "no idempotency key in event, executing without idempotency guarantee"
                );
                return handler(event, context)
                    .await
                    .map_err(|e| IdempotencyError::user_function(e));
            }
        };
        let payload_hash = self.validation_hash(&event)?;

        // Fast path: a warm process may already hold the completed record.
        if let Some(cache) = &self.cache {
            if let Some(record) = cache.get(&key, Timestamp::now()) {
                tracing::debug!(key = %key, "local cache hit");
                self.check_payload(&record, payload_hash.as_deref())?;
                return self.stored_response(&record);
            }
        }

        match self.acquire(&key, payload_hash.clone()).await? {
            Some(record) => {
                self.check_payload(&record, payload_hash.as_deref())?;
                if let Some(cache) = &self.cache {
                    cache.put(&record);
                }
                self.stored_response(&record)
            }
            None => {
                self.execute(event, context, handler, &key, payload_hash)
                    .await
            }
        }
    }

    /// Wraps a user handler into a callable of identical signature that
    /// applies the protocol on every call.
    pub fn wrap<C, F, Fut, R, E>(
        self: &Arc<Self>,
        handler: F,
    ) -> impl Fn(Value, C) -> HandlerFuture<R>
    where
        C: Send + 'static,
        F: Fn(Value, C) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let this = Arc::clone(self);
        move |event, context| {
            let this = Arc::clone(&this);
            let handler = handler.clone();
            Box::pin(async move { this.handle(event, context, handler).await })
        }
    }

    /// Evaluates the key selector and derives the stored key, or `None`
    /// when the selector misses and bypass is allowed.
    fn derive_key(&self, event: &Value) -> Result<Option<String>, IdempotencyError> {
        let subtree = match self.key_selector.select(event)? {
            Some(subtree) => subtree,
            None => {
                if self.config.raise_on_no_idempotency_key {
                    return Err(IdempotencyError::key_extraction(format!(
                        "selector '{}' matched nothing in the event",
                        self.key_selector.source()
                    )));
                }
                return Ok(None);
            }
        };
        let digest = hash_subtree(&subtree, self.config.hash_algorithm);
        Ok(Some(format_key(&self.function_name, &digest)))
    }

    /// Hash of the validation subtree, when validation is configured.
    fn validation_hash(&self, event: &Value) -> Result<Option<String>, IdempotencyError> {
        let Some(selector) = &self.validation_selector else {
            return Ok(None);
        };
        let subtree = selector.select(event)?.unwrap_or(Value::Null);
        Ok(Some(hash_subtree(&subtree, self.config.hash_algorithm)))
    }

    /// Rejects a stored record whose payload hash mismatches the current
    /// event. A stored row without a hash never fails.
    fn check_payload(
        &self,
        record: &DataRecord,
        current_hash: Option<&str>,
    ) -> Result<(), IdempotencyError> {
        let (Some(stored), Some(current)) = (record.payload_hash.as_deref(), current_hash) else {
            return Ok(());
        };
        if stored != current {
            tracing::warn!(key = %record.idempotency_key, "stored payload hash mismatch");
            return Err(IdempotencyError::PayloadValidationFailed {
                key: record.idempotency_key.clone(),
            });
        }
        Ok(())
    }

    /// Attempts to take the key, resolving duplicates. Loops on logically
    /// absent rows with fresh timestamps, up to the takeover bound.
    ///
    /// Returns `None` when this invocation acquired the row and must
    /// execute, or the existing completed record otherwise.
    async fn acquire(
        &self,
        key: &str,
        payload_hash: Option<String>,
    ) -> Result<Option<DataRecord>, IdempotencyError> {
        for attempt in 0..=MAX_TAKEOVER_RETRIES {
            match self.try_put(key, payload_hash.clone()).await? {
                PutOutcome::Acquired => return Ok(None),
                PutOutcome::Completed(record) => return Ok(Some(record)),
                PutOutcome::Stale => {
                    tracing::debug!(key = %key, attempt, "existing row logically absent, retrying put");
                    if let Some(cache) = &self.cache {
                        cache.evict(key);
                    }
                }
            }
        }
        Err(IdempotencyError::persistence(format!(
            "gave up acquiring key '{key}' after {MAX_TAKEOVER_RETRIES} takeover retries"
        )))
    }

    /// One conditional-put round against a fresh instant.
    async fn try_put(
        &self,
        key: &str,
        payload_hash: Option<String>,
    ) -> Result<PutOutcome, IdempotencyError> {
        let now = Timestamp::now();
        let record = DataRecord::in_progress(
            key,
            now.seconds + self.config.record_ttl.as_secs(),
            now.millis + self.config.execution_timeout.as_millis() as u64,
            payload_hash,
        );

        let conflict = match self.store.put_record(&record, now).await {
            Ok(()) => return Ok(PutOutcome::Acquired),
            Err(StoreError::ItemAlreadyExists { existing }) => existing,
            Err(e) => return Err(IdempotencyError::persistence(e.to_string())),
        };

        // Prefer the row returned with the conditional failure; read it
        // back otherwise. A row that vanished in between counts as stale.
        let existing = match conflict {
            Some(existing) => existing,
            None => match self.store.get_record(key).await {
                Ok(existing) => existing,
                Err(StoreError::ItemNotFound { .. }) => return Ok(PutOutcome::Stale),
                Err(e) => return Err(IdempotencyError::persistence(e.to_string())),
            },
        };

        if existing.is_logically_absent(now) {
            return Ok(PutOutcome::Stale);
        }
        match existing.status_at(now) {
            RecordStatus::Completed => Ok(PutOutcome::Completed(existing)),
            RecordStatus::InProgress => Err(IdempotencyError::AlreadyInProgress {
                key: key.to_string(),
                lease_expiry_ms: existing.in_progress_expiry_ms,
            }),
            // status_at only derives Expired for rows past TTL, which
            // is_logically_absent already classified as stale.
            RecordStatus::Expired => Ok(PutOutcome::Stale),
        }
    }

    /// Runs the user function as the winning executor and persists the
    /// terminal state.
    async fn execute<C, F, Fut, R, E>(
        &self,
        event: Value,
        context: C,
        handler: F,
        key: &str,
        payload_hash: Option<String>,
    ) -> Result<R, IdempotencyError>
    where
        F: FnOnce(Value, C) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: Serialize + DeserializeOwned,
        E: Into<BoxError>,
    {
        let response = match handler(event, context).await {
            Ok(response) => response,
            Err(user_error) => {
                // Release the row so an identical retry can re-execute.
                // A failed delete only costs waiting out the lease.
                if let Err(delete_error) = self.store.delete_record(key).await {
                    tracing::warn!(
                        key = %key,
                        error = %delete_error,
                        "failed to delete in-progress record after user error"
                    );
                }
                return Err(IdempotencyError::user_function(user_error));
            }
        };

        let response_data = serde_json::to_string(&response)?;
        let now = Timestamp::now();
        let record = DataRecord::completed(
            key,
            now.seconds + self.config.record_ttl.as_secs(),
            response_data,
            payload_hash,
        );
        self.store
            .update_record(&record)
            .await
            .map_err(|e| IdempotencyError::persistence(e.to_string()))?;
        tracing::debug!(key = %key, "stored completed record");

        if let Some(cache) = &self.cache {
            cache.put(&record);
        }
        Ok(response)
    }

    /// Deserializes the response stored on a completed record.
    fn stored_response<R: DeserializeOwned>(
        &self,
        record: &DataRecord,
    ) -> Result<R, IdempotencyError> {
        let data = record.response_data.as_deref().ok_or_else(|| {
            IdempotencyError::persistence(format!(
                "completed record '{}' has no response data",
                record.idempotency_key
            ))
        })?;
        Ok(serde_json::from_str(data)?)
    }
}

/// Builder for [`Idempotency`].
#[derive(Default)]
pub struct IdempotencyBuilder {
    store: Option<SharedStore>,
    config: Option<IdempotencyConfig>,
    function_name: Option<String>,
    disabled: Option<bool>,
}

impl IdempotencyBuilder {
    /// Sets the persistence store (required).
    pub fn store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the configuration (required).
    pub fn config(mut self, config: IdempotencyConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the key salt. Defaults to `AWS_LAMBDA_FUNCTION_NAME`, or an
    /// empty salt outside Lambda.
    pub fn function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = Some(name.into());
        self
    }

    /// Overrides the environment kill switch (mainly for tests).
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = Some(disabled);
        self
    }

    /// Validates the configuration, compiles the selectors, and builds
    /// the handler.
    pub fn build(self) -> Result<Idempotency, IdempotencyError> {
        let store = self
            .store
            .ok_or_else(|| IdempotencyError::configuration("a persistence store is required"))?;
        let config = self
            .config
            .ok_or_else(|| IdempotencyError::configuration("an IdempotencyConfig is required"))?;
        config.validate()?;

        let key_selector = Selector::compile(&config.event_key_expression)?;
        let validation_selector = config
            .payload_validation_expression
            .as_deref()
            .map(Selector::compile)
            .transpose()?;
        let cache = config
            .use_local_cache
            .then(|| LocalCache::new(config.local_cache_max_items));
        let function_name = self
            .function_name
            .or_else(|| std::env::var(ENV_FUNCTION_NAME).ok())
            .unwrap_or_default();
        let disabled = self.disabled.unwrap_or_else(disabled_by_env);

        Ok(Idempotency {
            store,
            config,
            function_name,
            key_selector,
            validation_selector,
            cache,
            disabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::in_memory::InMemoryStore;
    use serde_json::json;

    fn handler_with(store: Arc<InMemoryStore>, config: IdempotencyConfig) -> Idempotency {
        Idempotency::builder()
            .store(store)
            .config(config)
            .function_name("orders")
            .disabled(false)
            .build()
            .unwrap()
    }

    fn base_config() -> IdempotencyConfig {
        IdempotencyConfig::builder()
            .event_key_expression("orderId")
            .build()
    }

    #[test]
    fn test_build_requires_store_and_config() {
        let err = Idempotency::builder().build().unwrap_err();
        assert!(matches!(err, IdempotencyError::Configuration { .. }));

        let err = Idempotency::builder()
            .store(Arc::new(InMemoryStore::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::Configuration { .. }));
    }

    #[test]
    fn test_build_rejects_bad_selector() {
        let config = IdempotencyConfig::builder()
            .event_key_expression("orderId.[")
            .build();
        let err = Idempotency::builder()
            .store(Arc::new(InMemoryStore::new()))
            .config(config)
            .disabled(false)
            .build()
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_key_is_salted_with_function_name() {
        let store = Arc::new(InMemoryStore::new());
        let handler = handler_with(store.clone(), base_config());

        let _: Value = handler
            .handle(json!({"orderId": "o-1"}), (), |_, _: ()| async {
                Ok::<_, std::io::Error>(json!({"ok": true}))
            })
            .await
            .unwrap();

        let key = store
            .peek_keys()
            .into_iter()
            .next()
            .expect("one record written");
        assert!(key.starts_with("orders#"));
        let digest = key.strip_prefix("orders#").unwrap();
        assert_eq!(digest.len(), 32);
    }

    #[tokio::test]
    async fn test_strict_mode_fails_on_missing_key() {
        let config = IdempotencyConfig::builder()
            .event_key_expression("orderId")
            .raise_on_no_idempotency_key(true)
            .build();
        let handler = handler_with(Arc::new(InMemoryStore::new()), config);

        let err = handler
            .handle(json!({"other": 1}), (), |_, _: ()| async {
                Ok::<_, std::io::Error>(json!(null))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::KeyExtractionFailed { .. }));
    }

    #[tokio::test]
    async fn test_missing_key_bypasses_by_default() {
        let store = Arc::new(InMemoryStore::new());
        let handler = handler_with(store.clone(), base_config());

        let response: Value = handler
            .handle(json!({"other": 1}), (), |_, _: ()| async {
                Ok::<_, std::io::Error>(json!({"ran": true}))
            })
            .await
            .unwrap();
        assert_eq!(response, json!({"ran": true}));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_takeover_retries_are_bounded() {
        // A store whose rows always look stale would otherwise livelock
        // the takeover loop: every put conflicts, every read-back is
        // logically absent.
        struct AlwaysStaleStore;

        #[async_trait::async_trait]
        impl crate::store::PersistenceStore for AlwaysStaleStore {
            async fn put_record(
                &self,
                _record: &DataRecord,
                _now: Timestamp,
            ) -> Result<(), StoreError> {
                Err(StoreError::ItemAlreadyExists {
                    existing: Some(DataRecord::in_progress("orders#stale", 0, 0, None)),
                })
            }
            async fn get_record(&self, key: &str) -> Result<DataRecord, StoreError> {
                Err(StoreError::ItemNotFound {
                    key: key.to_string(),
                })
            }
            async fn update_record(&self, _record: &DataRecord) -> Result<(), StoreError> {
                Ok(())
            }
            async fn delete_record(&self, _key: &str) -> Result<(), StoreError> {
                Ok(())
            }
        }

        let handler = Idempotency::builder()
            .store(Arc::new(AlwaysStaleStore))
            .config(base_config())
            .function_name("orders")
            .disabled(false)
            .build()
            .unwrap();

        let err = handler
            .handle(json!({"orderId": "o-1"}), (), |_, _: ()| async {
                Ok::<_, std::io::Error>(json!(null))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::PersistenceLayer { .. }));
    }

    #[tokio::test]
    async fn test_wrap_preserves_signature() {
        let store = Arc::new(InMemoryStore::new());
        let handler = Arc::new(handler_with(store, base_config()));

        let wrapped = handler.wrap(|event: Value, _ctx: ()| async move {
            Ok::<_, std::io::Error>(json!({"echo": event["orderId"]}))
        });

        let first = wrapped(json!({"orderId": "o-1"}), ()).await.unwrap();
        let second = wrapped(json!({"orderId": "o-1"}), ()).await.unwrap();
        assert_eq!(first, json!({"echo": "o-1"}));
        assert_eq!(first, second);
    }
}

//! # Idempotency middleware for AWS Lambda handlers
//!
//! This crate makes a Lambda-style handler safe to invoke more than once:
//! repeated invocations with the same logical payload within a configured
//! window return the stored result of the first execution instead of
//! re-running side effects. Concurrent duplicates are coordinated so at
//! most one execution runs per logical key; the others either observe the
//! completed result or are told an execution is already in progress.
//!
//! Coordination happens entirely through a conditional-write persistence
//! store (DynamoDB in production, an in-memory twin for tests): a single
//! atomic `put` decides the winner, an in-progress lease bounds how long
//! a crashed winner can block the key, and a TTL bounds how long a
//! completed result is replayed.
//!
//! ## Getting started
//!
//! Add the crate to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! lambda-idempotency = "0.1"
//! tokio = { version = "1.0", features = ["full"] }
//! serde_json = "1.0"
//! ```
//!
//! Wrap your handler once at cold start and reuse the middleware across
//! warm invocations:
//!
//! ```rust,ignore
//! use lambda_idempotency::{DynamoDbStore, Idempotency, IdempotencyConfig};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
//! let store = DynamoDbStore::builder()
//!     .table_name("idempotency")
//!     .build(&sdk_config)?;
//!
//! let idempotency = Arc::new(
//!     Idempotency::builder()
//!         .store(Arc::new(store))
//!         .config(
//!             IdempotencyConfig::builder()
//!                 .event_key_expression("body.orderId")
//!                 .use_local_cache(true)
//!                 .build(),
//!         )
//!         .build()?,
//! );
//!
//! let handler = idempotency.wrap(|event: Value, _ctx: ()| async move {
//!     // Side effects here run at most once per order id.
//!     Ok::<_, std::io::Error>(json!({"charged": true}))
//! });
//! ```
//!
//! ## Core concepts
//!
//! - **Idempotency key** - derived by evaluating a JMESPath selector over
//!   the event and hashing the selected subtree's canonical form, salted
//!   with the function name. Two events with the same key are duplicates.
//! - **Lease** - an in-progress record carries a millisecond deadline.
//!   If the executor dies without writing a terminal state, the next
//!   invocation takes the key over once the lease lapses.
//! - **Payload validation** - an optional second selector hashes a
//!   different subtree; a duplicate whose validation hash differs from
//!   the stored one is rejected rather than answered from the store.
//! - **Local cache** - an optional bounded LRU of completed records that
//!   skips the store round-trip on warm duplicates. Purely an
//!   optimization; correctness never depends on it.
//!
//! ## Behavior under failure
//!
//! - The middleware never retries backend errors itself; the invoking
//!   runtime owns retries.
//! - User-function errors release the in-progress row (best effort) and
//!   then propagate, so an identical retry re-executes.
//! - A live duplicate fails fast with
//!   [`IdempotencyError::AlreadyInProgress`] carrying the winner's lease
//!   deadline; the middleware never block-waits on another execution.
//!
//! Setting the `IDEMPOTENCY_DISABLED` environment variable to `"true"`
//! bypasses the middleware entirely.
//!
//! ## Module organization
//!
//! - [`cache`]: process-local LRU of completed records
//! - [`config`]: configuration and environment knobs
//! - [`error`]: error taxonomy
//! - [`handler`]: the protocol orchestrator and handler wrapping
//! - [`key`]: canonical serialization and key hashing
//! - [`record`]: the persisted record model
//! - [`selector`]: compiled JMESPath selectors
//! - [`store`]: the persistence contract and its DynamoDB / in-memory
//!   implementations

pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod key;
pub mod record;
pub mod selector;
pub mod store;

// Re-export main types at crate root
pub use config::{
    disabled_by_env, HashAlgorithm, IdempotencyConfig, IdempotencyConfigBuilder,
    ENV_FUNCTION_NAME, ENV_IDEMPOTENCY_DISABLED, ENV_TABLE_NAME,
};
pub use error::{BoxError, IdempotencyError};
pub use handler::{HandlerFuture, Idempotency, IdempotencyBuilder};
pub use record::{DataRecord, RecordStatus, Timestamp};
pub use selector::Selector;
pub use store::dynamodb::{DynamoDbStore, DynamoDbStoreBuilder, TableLayout};
pub use store::in_memory::InMemoryStore;
pub use store::{PersistenceStore, SharedStore, StoreError};

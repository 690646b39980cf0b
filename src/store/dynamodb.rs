//! DynamoDB persistence store.
//!
//! One idempotency record maps to one item. The first-writer-wins race is
//! settled entirely by a single conditional `PutItem`; everything else is
//! plain reads and unconditional writes.
//!
//! ## Table layout (defaults)
//!
//! ```text
//! Partition key:
//!   - id (String): "{function_name}#{hex_digest}"
//!
//! Attributes:
//!   - status: String ("INPROGRESS" | "COMPLETED")
//!   - expiration: Number (unix seconds) - also the TTL attribute
//!   - in_progress_expiration: Number (unix milliseconds, lease deadline)
//!   - data: String - serialized response
//!   - validation: String - payload hash
//! ```
//!
//! Every attribute name is overridable, and the table may instead use a
//! composite key where `id` holds a static literal and a sort key holds
//! the idempotency key. Semantics are identical in both layouts.
//!
//! Note: `status` and `data` are DynamoDB reserved words, so every
//! expression goes through `ExpressionAttributeNames`.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValuesOnConditionCheckFailure};
use aws_sdk_dynamodb::Client;

use crate::config::ENV_TABLE_NAME;
use crate::error::IdempotencyError;
use crate::record::{DataRecord, RecordStatus, Timestamp};
use crate::store::{PersistenceStore, StoreError};

/// Default partition key attribute.
pub const DEFAULT_KEY_ATTR: &str = "id";
/// Default sort key attribute (composite-key mode only).
pub const DEFAULT_SORT_KEY_ATTR: &str = "sort_key";
/// Default status attribute.
pub const DEFAULT_STATUS_ATTR: &str = "status";
/// Default expiry attribute (unix seconds); configure this as the
/// table's TTL attribute.
pub const DEFAULT_EXPIRY_ATTR: &str = "expiration";
/// Default lease-deadline attribute (unix milliseconds).
pub const DEFAULT_IN_PROGRESS_EXPIRY_ATTR: &str = "in_progress_expiration";
/// Default response-data attribute.
pub const DEFAULT_DATA_ATTR: &str = "data";
/// Default payload-hash attribute.
pub const DEFAULT_VALIDATION_ATTR: &str = "validation";

/// Physical column mapping for the idempotency table.
///
/// `static_partition_key` switches the layout to composite-key mode:
/// the partition key holds that literal and `sort_key_attr` holds the
/// idempotency key.
#[derive(Debug, Clone)]
pub struct TableLayout {
    /// Partition key attribute name
    pub key_attr: String,
    /// Static partition key value (composite-key mode)
    pub static_partition_key: Option<String>,
    /// Sort key attribute name (composite-key mode)
    pub sort_key_attr: String,
    /// Status attribute name
    pub status_attr: String,
    /// Expiry attribute name (unix seconds)
    pub expiry_attr: String,
    /// Lease-deadline attribute name (unix milliseconds)
    pub in_progress_expiry_attr: String,
    /// Response-data attribute name
    pub data_attr: String,
    /// Payload-hash attribute name
    pub validation_attr: String,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            key_attr: DEFAULT_KEY_ATTR.to_string(),
            static_partition_key: None,
            sort_key_attr: DEFAULT_SORT_KEY_ATTR.to_string(),
            status_attr: DEFAULT_STATUS_ATTR.to_string(),
            expiry_attr: DEFAULT_EXPIRY_ATTR.to_string(),
            in_progress_expiry_attr: DEFAULT_IN_PROGRESS_EXPIRY_ATTR.to_string(),
            data_attr: DEFAULT_DATA_ATTR.to_string(),
            validation_attr: DEFAULT_VALIDATION_ATTR.to_string(),
        }
    }
}

impl TableLayout {
    /// The attribute that physically stores the idempotency key: the
    /// sort key in composite mode, the partition key otherwise.
    fn record_key_attr(&self) -> &str {
        if self.static_partition_key.is_some() {
            &self.sort_key_attr
        } else {
            &self.key_attr
        }
    }

    /// Key attributes addressing one record.
    fn key_item(&self, idempotency_key: &str) -> HashMap<String, AttributeValue> {
        let mut key = HashMap::new();
        match &self.static_partition_key {
            Some(partition) => {
                key.insert(self.key_attr.clone(), AttributeValue::S(partition.clone()));
                key.insert(
                    self.sort_key_attr.clone(),
                    AttributeValue::S(idempotency_key.to_string()),
                );
            }
            None => {
                key.insert(
                    self.key_attr.clone(),
                    AttributeValue::S(idempotency_key.to_string()),
                );
            }
        }
        key
    }

    /// Full item for a record.
    fn record_to_item(&self, record: &DataRecord) -> HashMap<String, AttributeValue> {
        let mut item = self.key_item(&record.idempotency_key);
        item.insert(
            self.status_attr.clone(),
            AttributeValue::S(record.status.as_str().to_string()),
        );
        item.insert(
            self.expiry_attr.clone(),
            AttributeValue::N(record.expiry_ts.to_string()),
        );
        if let Some(deadline) = record.in_progress_expiry_ms {
            item.insert(
                self.in_progress_expiry_attr.clone(),
                AttributeValue::N(deadline.to_string()),
            );
        }
        if let Some(data) = &record.response_data {
            item.insert(self.data_attr.clone(), AttributeValue::S(data.clone()));
        }
        if let Some(hash) = &record.payload_hash {
            item.insert(self.validation_attr.clone(), AttributeValue::S(hash.clone()));
        }
        item
    }

    /// Parses an item back into a record, failing on rows this layout
    /// cannot explain.
    fn item_to_record(&self, item: &HashMap<String, AttributeValue>) -> Result<DataRecord, StoreError> {
        let key = item
            .get(self.record_key_attr())
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| StoreError::backend("row is missing its idempotency key attribute"))?
            .clone();

        let status = item
            .get(&self.status_attr)
            .and_then(|v| v.as_s().ok())
            .and_then(|s| RecordStatus::parse(s))
            .ok_or_else(|| {
                StoreError::backend(format!("row '{key}' has a missing or unknown status"))
            })?;

        let expiry_ts = item
            .get(&self.expiry_attr)
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| {
                StoreError::backend(format!("row '{key}' has a malformed expiry attribute"))
            })?;

        let in_progress_expiry_ms = item
            .get(&self.in_progress_expiry_attr)
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse::<u64>().ok());

        let response_data = item
            .get(&self.data_attr)
            .and_then(|v| v.as_s().ok())
            .cloned();

        let payload_hash = item
            .get(&self.validation_attr)
            .and_then(|v| v.as_s().ok())
            .cloned();

        Ok(DataRecord {
            idempotency_key: key,
            status,
            expiry_ts,
            in_progress_expiry_ms,
            response_data,
            payload_hash,
        })
    }

    /// The conditional-put expression. A row blocks the put only while it
    /// is live: present, within TTL, and (if in progress) within lease.
    fn put_condition(&self) -> &'static str {
        "attribute_not_exists(#key) OR #expiry <= :now \
         OR (#status = :inprogress AND #lease <= :now_ms)"
    }
}

/// DynamoDB-backed [`PersistenceStore`].
#[derive(Clone)]
pub struct DynamoDbStore {
    client: Client,
    table_name: String,
    layout: TableLayout,
}

impl std::fmt::Debug for DynamoDbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoDbStore")
            .field("table_name", &self.table_name)
            .finish()
    }
}

impl DynamoDbStore {
    /// Creates a builder with the default table layout.
    pub fn builder() -> DynamoDbStoreBuilder {
        DynamoDbStoreBuilder::default()
    }

    fn backend_err(operation: &str, error: impl std::fmt::Display) -> StoreError {
        StoreError::backend(format!("DynamoDB {operation} failed: {error}"))
    }
}

#[async_trait]
impl PersistenceStore for DynamoDbStore {
    async fn put_record(&self, record: &DataRecord, now: Timestamp) -> Result<(), StoreError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(self.layout.record_to_item(record)))
            .condition_expression(self.layout.put_condition())
            .expression_attribute_names("#key", self.layout.record_key_attr())
            .expression_attribute_names("#expiry", &self.layout.expiry_attr)
            .expression_attribute_names("#status", &self.layout.status_attr)
            .expression_attribute_names("#lease", &self.layout.in_progress_expiry_attr)
            .expression_attribute_values(":now", AttributeValue::N(now.seconds.to_string()))
            .expression_attribute_values(":now_ms", AttributeValue::N(now.millis.to_string()))
            .expression_attribute_values(
                ":inprogress",
                AttributeValue::S(RecordStatus::InProgress.as_str().to_string()),
            )
            .return_values_on_condition_check_failure(ReturnValuesOnConditionCheckFailure::AllOld)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(service_err)) => match service_err.err() {
                PutItemError::ConditionalCheckFailedException(conflict) => {
                    // The backend returns the blocking row with the failure;
                    // surface it so the caller can skip a read-back.
                    let existing = conflict
                        .item()
                        .map(|item| self.layout.item_to_record(item))
                        .transpose()?;
                    tracing::debug!(
                        key = %record.idempotency_key,
                        existing_returned = existing.is_some(),
                        "conditional put lost to existing row"
                    );
                    Err(StoreError::ItemAlreadyExists { existing })
                }
                other => Err(Self::backend_err("PutItem", other)),
            },
            Err(e) => Err(Self::backend_err("PutItem", e)),
        }
    }

    async fn get_record(&self, key: &str) -> Result<DataRecord, StoreError> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .set_key(Some(self.layout.key_item(key)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| Self::backend_err("GetItem", e))?;

        match response.item() {
            Some(item) => self.layout.item_to_record(item),
            None => Err(StoreError::ItemNotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn update_record(&self, record: &DataRecord) -> Result<(), StoreError> {
        let mut update_expression =
            "SET #status = :status, #expiry = :expiry, #data = :data".to_string();
        let mut request = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .set_key(Some(self.layout.key_item(&record.idempotency_key)))
            .expression_attribute_names("#status", &self.layout.status_attr)
            .expression_attribute_names("#expiry", &self.layout.expiry_attr)
            .expression_attribute_names("#data", &self.layout.data_attr)
            .expression_attribute_names("#lease", &self.layout.in_progress_expiry_attr)
            .expression_attribute_values(
                ":status",
                AttributeValue::S(record.status.as_str().to_string()),
            )
            .expression_attribute_values(
                ":expiry",
                AttributeValue::N(record.expiry_ts.to_string()),
            )
            .expression_attribute_values(
                ":data",
                AttributeValue::S(record.response_data.clone().unwrap_or_default()),
            );

        if let Some(hash) = &record.payload_hash {
            update_expression.push_str(", #validation = :validation");
            request = request
                .expression_attribute_names("#validation", &self.layout.validation_attr)
                .expression_attribute_values(":validation", AttributeValue::S(hash.clone()));
        }

        // Drop the lease written by the acquiring put; only in-progress
        // rows carry one.
        update_expression.push_str(" REMOVE #lease");

        request
            .update_expression(update_expression)
            .send()
            .await
            .map_err(|e| Self::backend_err("UpdateItem", e))?;
        Ok(())
    }

    async fn delete_record(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .set_key(Some(self.layout.key_item(key)))
            .send()
            .await
            .map_err(|e| Self::backend_err("DeleteItem", e))?;
        Ok(())
    }
}

/// Builder for [`DynamoDbStore`].
///
/// The table name falls back to the `TABLE_NAME` environment variable
/// when not set explicitly.
#[derive(Debug, Clone, Default)]
pub struct DynamoDbStoreBuilder {
    table_name: Option<String>,
    layout: TableLayout,
}

impl DynamoDbStoreBuilder {
    /// Sets the table name.
    pub fn table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    /// Overrides the partition key attribute name.
    pub fn key_attr(mut self, name: impl Into<String>) -> Self {
        self.layout.key_attr = name.into();
        self
    }

    /// Switches to composite-key mode: the partition key holds this
    /// literal and the sort key holds the idempotency key.
    pub fn static_partition_key(mut self, value: impl Into<String>) -> Self {
        self.layout.static_partition_key = Some(value.into());
        self
    }

    /// Overrides the sort key attribute name (composite-key mode).
    pub fn sort_key_attr(mut self, name: impl Into<String>) -> Self {
        self.layout.sort_key_attr = name.into();
        self
    }

    /// Overrides the status attribute name.
    pub fn status_attr(mut self, name: impl Into<String>) -> Self {
        self.layout.status_attr = name.into();
        self
    }

    /// Overrides the expiry attribute name.
    pub fn expiry_attr(mut self, name: impl Into<String>) -> Self {
        self.layout.expiry_attr = name.into();
        self
    }

    /// Overrides the lease-deadline attribute name.
    pub fn in_progress_expiry_attr(mut self, name: impl Into<String>) -> Self {
        self.layout.in_progress_expiry_attr = name.into();
        self
    }

    /// Overrides the response-data attribute name.
    pub fn data_attr(mut self, name: impl Into<String>) -> Self {
        self.layout.data_attr = name.into();
        self
    }

    /// Overrides the payload-hash attribute name.
    pub fn validation_attr(mut self, name: impl Into<String>) -> Self {
        self.layout.validation_attr = name.into();
        self
    }

    /// Builds the store from shared AWS SDK configuration.
    pub fn build(self, sdk_config: &aws_config::SdkConfig) -> Result<DynamoDbStore, IdempotencyError> {
        let client = Client::new(sdk_config);
        self.build_with_client(client)
    }

    /// Builds the store from a pre-built client (tests, custom endpoints).
    pub fn build_with_client(self, client: Client) -> Result<DynamoDbStore, IdempotencyError> {
        let table_name = match self.table_name {
            Some(name) => name,
            None => std::env::var(ENV_TABLE_NAME).map_err(|_| {
                IdempotencyError::configuration(format!(
                    "table name not set and {ENV_TABLE_NAME} is not defined"
                ))
            })?,
        };
        if table_name.is_empty() {
            return Err(IdempotencyError::configuration("table name must not be empty"));
        }
        Ok(DynamoDbStore {
            client,
            table_name,
            layout: self.layout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DataRecord {
        DataRecord {
            idempotency_key: "orders#abc123".to_string(),
            status: RecordStatus::InProgress,
            expiry_ts: 1_700_000_000,
            in_progress_expiry_ms: Some(1_700_000_030_000),
            response_data: None,
            payload_hash: Some("deadbeef".to_string()),
        }
    }

    #[test]
    fn test_simple_layout_roundtrip() {
        let layout = TableLayout::default();
        let record = record();
        let item = layout.record_to_item(&record);

        assert_eq!(item["id"], AttributeValue::S("orders#abc123".to_string()));
        assert_eq!(item["status"], AttributeValue::S("INPROGRESS".to_string()));
        assert_eq!(
            item["expiration"],
            AttributeValue::N("1700000000".to_string())
        );
        assert_eq!(
            item["in_progress_expiration"],
            AttributeValue::N("1700000030000".to_string())
        );
        assert!(!item.contains_key("data"));
        assert_eq!(item["validation"], AttributeValue::S("deadbeef".to_string()));

        assert_eq!(layout.item_to_record(&item).unwrap(), record);
    }

    #[test]
    fn test_composite_layout_roundtrip() {
        let layout = TableLayout {
            static_partition_key: Some("idempotency".to_string()),
            ..TableLayout::default()
        };
        let record = DataRecord::completed(
            "orders#abc123",
            1_700_000_000,
            r#"{"ok":true}"#.to_string(),
            None,
        );
        let item = layout.record_to_item(&record);

        assert_eq!(item["id"], AttributeValue::S("idempotency".to_string()));
        assert_eq!(
            item["sort_key"],
            AttributeValue::S("orders#abc123".to_string())
        );
        assert_eq!(item["data"], AttributeValue::S(r#"{"ok":true}"#.to_string()));

        assert_eq!(layout.item_to_record(&item).unwrap(), record);
    }

    #[test]
    fn test_renamed_attributes() {
        let mut layout = TableLayout::default();
        layout.key_attr = "pk".to_string();
        layout.status_attr = "state".to_string();
        layout.expiry_attr = "ttl".to_string();

        let item = layout.record_to_item(&record());
        assert!(item.contains_key("pk"));
        assert!(item.contains_key("state"));
        assert!(item.contains_key("ttl"));
        assert!(!item.contains_key("id"));
    }

    #[test]
    fn test_item_to_record_rejects_unknown_status() {
        let layout = TableLayout::default();
        let mut item = layout.record_to_item(&record());
        item.insert(
            "status".to_string(),
            AttributeValue::S("PENDING".to_string()),
        );
        assert!(matches!(
            layout.item_to_record(&item),
            Err(StoreError::Backend { .. })
        ));
    }

    #[test]
    fn test_item_to_record_rejects_malformed_expiry() {
        let layout = TableLayout::default();
        let mut item = layout.record_to_item(&record());
        item.insert(
            "expiration".to_string(),
            AttributeValue::S("not-a-number".to_string()),
        );
        assert!(matches!(
            layout.item_to_record(&item),
            Err(StoreError::Backend { .. })
        ));
    }

    #[test]
    fn test_put_condition_covers_all_absence_clauses() {
        let layout = TableLayout::default();
        let condition = layout.put_condition();
        assert!(condition.contains("attribute_not_exists(#key)"));
        assert!(condition.contains("#expiry <= :now"));
        assert!(condition.contains("#status = :inprogress AND #lease <= :now_ms"));
    }

    #[test]
    fn test_builder_requires_table_name() {
        std::env::remove_var(ENV_TABLE_NAME);
        let config = aws_sdk_dynamodb::Config::builder()
            .behavior_version(aws_sdk_dynamodb::config::BehaviorVersion::latest())
            .build();
        let client = Client::from_conf(config);

        let err = DynamoDbStore::builder()
            .build_with_client(client)
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::Configuration { .. }));
    }
}

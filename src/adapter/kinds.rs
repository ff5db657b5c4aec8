//! Sample resource kinds
//!
//! A notification topic whose policies are JSON documents, and a table with
//! create-only key attributes and order-insensitive tag sets.

use std::sync::Arc;

use crate::adapter::{AdapterRegistry, ClientAdapter, ExternalClient};
use crate::attributes::{AttributeKind, AttributeSchema, AttributeSpec};

/// Notification topic kind
pub const TOPIC_KIND: &str = "Topic";

/// Key-value table kind
pub const TABLE_KIND: &str = "Table";

/// Schema of [`TOPIC_KIND`]
pub fn topic_schema() -> AttributeSchema {
    AttributeSchema::new(vec![
        AttributeSpec::new("DisplayName", AttributeKind::Text),
        AttributeSpec::new("Policy", AttributeKind::Json),
        AttributeSpec::new("DeliveryPolicy", AttributeKind::Json),
        AttributeSpec::new("KmsMasterKeyId", AttributeKind::Text),
    ])
}

/// Schema of [`TABLE_KIND`]
pub fn table_schema() -> AttributeSchema {
    AttributeSchema::new(vec![
        AttributeSpec::new("KeySchema", AttributeKind::List).create_only(),
        AttributeSpec::new("AttributeDefinitions", AttributeKind::Set).create_only(),
        AttributeSpec::new("BillingMode", AttributeKind::Text),
        AttributeSpec::new("ReadCapacityUnits", AttributeKind::Number),
        AttributeSpec::new("WriteCapacityUnits", AttributeKind::Number),
        AttributeSpec::new("Tags", AttributeKind::Set),
    ])
}

/// Registry serving both sample kinds from one client
pub fn sample_registry<C: ExternalClient + 'static>(client: Arc<C>) -> AdapterRegistry {
    AdapterRegistry::new()
        .with(Arc::new(ClientAdapter::new(
            TOPIC_KIND,
            topic_schema(),
            client.clone(),
        )))
        .with(Arc::new(ClientAdapter::new(TABLE_KIND, table_schema(), client)))
}

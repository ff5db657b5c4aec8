//! Declarative manifests of desired records
//!
//! A manifest is a YAML list of records. Each record names its kind, its
//! name, and a `spec` mapping typed by the kind's attribute schema. A `null`
//! spec value leaves the field unset; an empty string, list or object asks
//! for the empty value.
//!
//! ```yaml
//! - kind: Topic
//!   name: orders
//!   spec:
//!     DisplayName: Orders
//!     Policy: {"Version": "2012-10-17", "Statement": []}
//! - kind: Table
//!   name: users
//!   deletionPolicy: Orphan
//!   spec:
//!     KeySchema: [id]
//!     BillingMode: PAY_PER_REQUEST
//! ```

use serde::Deserialize;

use crate::adapter::AdapterRegistry;
use crate::resource::{DeletionPolicy, ManagedResource, ResourceKey};
use crate::Error;

/// One record as written in a manifest
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Resource kind
    pub kind: String,
    /// Name, unique within the kind
    pub name: String,
    /// What deletion does to the external resource
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    /// Desired attributes
    #[serde(default)]
    pub spec: serde_json::Map<String, serde_json::Value>,
}

/// Parse a manifest into fresh, unbound records.
///
/// Every kind must have a registered adapter; its schema types the spec.
pub fn parse_manifest(yaml: &str, adapters: &AdapterRegistry) -> Result<Vec<ManagedResource>, Error> {
    let entries: Vec<ManifestEntry> = serde_yaml::from_str(yaml)
        .map_err(|e| Error::serialization(format!("invalid manifest: {e}")))?;

    entries
        .into_iter()
        .map(|entry| {
            let adapter = adapters.get(&entry.kind)?;
            let key = ResourceKey::new(entry.kind, entry.name);
            let spec = adapter
                .schema()
                .spec_from_manifest(&entry.spec)
                .map_err(|e| Error::serialization(format!("{key}: {e}")))?;
            Ok(ManagedResource::new(key, spec).with_deletion_policy(entry.deletion_policy))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::adapter::kinds::sample_registry;
    use crate::adapter::memory::MemoryExternalSystem;
    use crate::attributes::Field;
    use serde_json::json;

    fn registry() -> AdapterRegistry {
        sample_registry(Arc::new(MemoryExternalSystem::new()))
    }

    #[test]
    fn test_manifest_records_are_typed_by_schema() {
        let yaml = r#"
- kind: Topic
  name: orders
  spec:
    DisplayName: Orders
    Policy: {"Version": "2012-10-17"}
    DeliveryPolicy: null
- kind: Table
  name: users
  deletionPolicy: Orphan
  spec:
    KeySchema: [id, ts]
    ReadCapacityUnits: 5
    Tags: []
"#;
        let records = parse_manifest(yaml, &registry()).expect("manifest should parse");
        assert_eq!(records.len(), 2);

        let topic = &records[0];
        assert_eq!(topic.key, ResourceKey::new("Topic", "orders"));
        assert_eq!(topic.spec.get("DisplayName"), &Field::text("Orders"));
        assert_eq!(topic.spec.get("Policy"), &Field::json(json!({"Version": "2012-10-17"})));
        assert!(topic.spec.get("DeliveryPolicy").is_unset());
        assert_eq!(topic.deletion_policy, DeletionPolicy::Delete);

        let table = &records[1];
        assert_eq!(table.deletion_policy, DeletionPolicy::Orphan);
        assert_eq!(table.spec.get("KeySchema"), &Field::list(["id", "ts"]));
        assert_eq!(table.spec.get("ReadCapacityUnits"), &Field::number(5.0));
        assert_eq!(table.spec.get("Tags"), &Field::Empty);
        assert!(!table.is_bound());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = parse_manifest("- kind: Queue\n  name: jobs\n", &registry()).unwrap_err();
        assert!(matches!(err, Error::UnknownKind { .. }));
    }

    #[test]
    fn test_bad_field_names_the_record() {
        let yaml = "- kind: Table\n  name: users\n  spec:\n    KeySchema: id\n";
        let err = parse_manifest(yaml, &registry()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Table/users"));
        assert!(msg.contains("spec.KeySchema"));
    }
}

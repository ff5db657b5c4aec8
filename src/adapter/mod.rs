//! Resource adapters and the external system surface
//!
//! The controller never talks to an external system directly. Each resource
//! kind registers one [`ResourceAdapter`] that knows the kind's attribute
//! schema and how to reach the system. [`ClientAdapter`] implements the
//! adapter once for any [`ExternalClient`] plus schema, which is enough for
//! systems that address resources by an opaque identifier and set one
//! attribute per call.

pub mod kinds;
pub mod memory;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::attributes::{AttributeSchema, ExternalAttributes, Field, Spec};
use crate::diff::{ChangeItem, DiffResult};
use crate::error::ExternalError;
use crate::metrics::{self, CallOutcome};
use crate::resource::{ManagedResource, ResourceKey};
use crate::Error;

/// Names of external operations, used in errors, logs and metrics
pub mod operations {
    /// Read current attributes
    pub const DESCRIBE: &str = "describe";
    /// Search by deterministic name
    pub const LOOKUP: &str = "lookup";
    /// Create the external resource
    pub const CREATE: &str = "create";
    /// Write one attribute
    pub const SET_ATTRIBUTE: &str = "set-attribute";
    /// Delete the external resource
    pub const DELETE: &str = "delete";
}

/// Result of observing an external resource
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Observation {
    /// Whether the resource exists. `false` drives the create path.
    pub exists: bool,
    /// Fresh attributes; empty when the resource does not exist
    pub attributes: ExternalAttributes,
}

impl Observation {
    /// The resource does not exist
    pub fn absent() -> Self {
        Self::default()
    }

    /// The resource exists with these attributes
    pub fn present(attributes: ExternalAttributes) -> Self {
        Self {
            exists: true,
            attributes,
        }
    }
}

/// Outcome of searching the external system by deterministic name
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// A resource with the name exists under this identifier
    Found(String),
    /// No resource with the name exists
    Absent,
    /// The system cannot be searched by name
    Unsupported,
}

/// Raw round-trips against an external system.
///
/// Implementations classify their failures with [`ExternalError`]; a missing
/// resource must be reported as `NotFound`, never as a transient error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExternalClient: Send + Sync {
    /// Fetch all attributes of the resource with identifier `id`
    async fn describe(&self, id: &str) -> Result<ExternalAttributes, ExternalError>;

    /// Create a resource named `name` and return its identifier
    async fn create(
        &self,
        name: &str,
        attributes: &ExternalAttributes,
    ) -> Result<String, ExternalError>;

    /// Write a single attribute
    async fn set_attribute(&self, id: &str, key: &str, value: &str) -> Result<(), ExternalError>;

    /// Delete the resource with identifier `id`
    async fn delete(&self, id: &str) -> Result<(), ExternalError>;

    /// Find a resource by the name it was created with
    async fn find_by_name(&self, _name: &str) -> Result<Lookup, ExternalError> {
        Ok(Lookup::Unsupported)
    }
}

/// Per-kind strategy injected into the shared controller
#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    /// Kind this adapter serves
    fn kind(&self) -> &str;

    /// Ordered attribute schema of the kind
    fn schema(&self) -> &AttributeSchema;

    /// Observe the bound external resource. Absence is not an error.
    async fn observe(&self, external_name: &str) -> Result<Observation, ExternalError>;

    /// Secondary lookup of an unbound resource by its deterministic name
    async fn lookup(&self, resource: &ManagedResource) -> Result<Lookup, ExternalError>;

    /// Create the external resource and return its identifier
    async fn create(&self, resource: &ManagedResource) -> Result<String, ExternalError>;

    /// Apply a single change item
    async fn set_attribute(
        &self,
        external_name: &str,
        change: &ChangeItem,
    ) -> Result<(), ExternalError>;

    /// Delete the external resource. Succeeds when it is already gone.
    async fn delete(&self, external_name: &str) -> Result<(), ExternalError>;

    /// Fill unset spec fields from observed attributes
    fn late_initialize(&self, spec: &mut Spec, observed: &ExternalAttributes) -> Vec<String> {
        crate::late_init::late_initialize(self.schema(), spec, observed)
    }

    /// Compare the spec against observed attributes
    fn diff(&self, spec: &Spec, observed: &ExternalAttributes) -> DiffResult {
        crate::diff::diff(self.schema(), spec, observed)
    }
}

/// [`ResourceAdapter`] over an [`ExternalClient`] and a schema
pub struct ClientAdapter<C> {
    kind: String,
    schema: AttributeSchema,
    client: Arc<C>,
}

impl<C: ExternalClient> ClientAdapter<C> {
    /// Create an adapter for `kind`
    pub fn new(kind: impl Into<String>, schema: AttributeSchema, client: Arc<C>) -> Self {
        Self {
            kind: kind.into(),
            schema,
            client,
        }
    }

    /// Name the resource is created and searched under. Scoped by kind, so
    /// kinds sharing one client never find each other's resources.
    pub fn deterministic_name(&self, key: &ResourceKey) -> String {
        format!("{}/{}", self.kind, key.name)
    }

    /// Raw attributes sent with Create: every explicit field, empty ones as
    /// the empty value of their kind
    fn creation_attributes(&self, spec: &Spec) -> ExternalAttributes {
        spec.iter()
            .filter_map(|(key, field)| {
                let raw = match field {
                    Field::Unset => return None,
                    Field::Empty => self
                        .schema
                        .get(key)
                        .map(|attr| attr.kind)
                        .unwrap_or_default()
                        .empty_value()
                        .to_raw(),
                    Field::Value(value) => value.to_raw(),
                };
                Some((key.to_string(), raw))
            })
            .collect()
    }
}

#[async_trait]
impl<C: ExternalClient> ResourceAdapter for ClientAdapter<C> {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn schema(&self) -> &AttributeSchema {
        &self.schema
    }

    async fn observe(&self, external_name: &str) -> Result<Observation, ExternalError> {
        match self.client.describe(external_name).await {
            Ok(attributes) => Ok(Observation::present(attributes)),
            Err(e) if e.is_not_found() => Ok(Observation::absent()),
            Err(e) => Err(e),
        }
    }

    async fn lookup(&self, resource: &ManagedResource) -> Result<Lookup, ExternalError> {
        self.client
            .find_by_name(&self.deterministic_name(&resource.key))
            .await
    }

    async fn create(&self, resource: &ManagedResource) -> Result<String, ExternalError> {
        let attributes = self.creation_attributes(&resource.spec);
        self.client
            .create(&self.deterministic_name(&resource.key), &attributes)
            .await
    }

    async fn set_attribute(
        &self,
        external_name: &str,
        change: &ChangeItem,
    ) -> Result<(), ExternalError> {
        self.client
            .set_attribute(external_name, &change.key, &change.desired.to_raw())
            .await
    }

    async fn delete(&self, external_name: &str) -> Result<(), ExternalError> {
        match self.client.delete(external_name).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

/// Adapters by kind, passed to the controller at construction
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ResourceAdapter>>,
}

impl AdapterRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration
    pub fn with(mut self, adapter: Arc<dyn ResourceAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Register an adapter, replacing any previous one for the same kind
    pub fn register(&mut self, adapter: Arc<dyn ResourceAdapter>) {
        self.adapters.insert(adapter.kind().to_string(), adapter);
    }

    /// Adapter for `kind`
    pub fn get(&self, kind: &str) -> Result<Arc<dyn ResourceAdapter>, Error> {
        self.adapters
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownKind {
                kind: kind.to_string(),
            })
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

/// Run one external call under `deadline`.
///
/// Collaborator errors are wrapped with the operation and resource. An
/// expired deadline is a transient [`Error::DeadlineExceeded`]; the call may
/// still have taken effect.
pub async fn call<T, F>(
    operation: &'static str,
    resource: &ResourceKey,
    deadline: Duration,
    fut: F,
) -> Result<T, Error>
where
    F: Future<Output = Result<T, ExternalError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(value)) => {
            metrics::record_external_call(operation, CallOutcome::Success);
            Ok(value)
        }
        Ok(Err(e)) => {
            metrics::record_external_call(operation, CallOutcome::Failed(e.class));
            Err(Error::external(operation, resource, e))
        }
        Err(_) => {
            metrics::record_external_call(operation, CallOutcome::Deadline);
            warn!(%resource, operation, ?deadline, "external call exceeded its deadline");
            Err(Error::DeadlineExceeded {
                operation,
                resource: resource.to_string(),
                deadline,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AttributeKind, AttributeSpec};
    use crate::error::ErrorClass;
    use mockall::predicate::eq;

    fn schema() -> AttributeSchema {
        AttributeSchema::new(vec![
            AttributeSpec::new("DisplayName", AttributeKind::Text),
            AttributeSpec::new("Policy", AttributeKind::Json),
        ])
    }

    fn adapter(client: MockExternalClient) -> ClientAdapter<MockExternalClient> {
        ClientAdapter::new("Topic", schema(), Arc::new(client))
    }

    /// Story: a describe that reports NotFound is the normal "go create it"
    /// signal, not a failure
    #[tokio::test]
    async fn story_not_found_observes_as_absent() {
        let mut client = MockExternalClient::new();
        client
            .expect_describe()
            .with(eq("arn:gone"))
            .returning(|_| Err(ExternalError::not_found("NotFound: Topic does not exist")));

        let observation = adapter(client).observe("arn:gone").await.expect("observe");
        assert!(!observation.exists);
        assert!(observation.attributes.is_empty());
    }

    #[tokio::test]
    async fn test_observe_returns_fresh_attributes() {
        let mut client = MockExternalClient::new();
        client.expect_describe().returning(|_| {
            Ok([("Policy".to_string(), "P".to_string())].into_iter().collect())
        });

        let observation = adapter(client).observe("arn:123").await.expect("observe");
        assert!(observation.exists);
        assert_eq!(observation.attributes["Policy"], "P");
    }

    #[tokio::test]
    async fn test_observe_propagates_transient_errors() {
        let mut client = MockExternalClient::new();
        client
            .expect_describe()
            .returning(|_| Err(ExternalError::transient("Throttling")));

        let err = adapter(client).observe("arn:123").await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Transient);
    }

    /// Story: deleting something already gone is a success
    #[tokio::test]
    async fn story_delete_is_idempotent() {
        let mut client = MockExternalClient::new();
        client
            .expect_delete()
            .times(1)
            .returning(|_| Err(ExternalError::not_found("gone")));

        assert!(adapter(client).delete("arn:123").await.is_ok());
    }

    #[tokio::test]
    async fn test_create_sends_explicit_fields_under_kind_scoped_name() {
        let mut client = MockExternalClient::new();
        client
            .expect_create()
            .withf(|name, attributes| {
                name == "Topic/orders"
                    && attributes.get("DisplayName").map(String::as_str) == Some("")
                    && attributes.get("Policy").map(String::as_str) == Some(r#"{"a":1}"#)
                    && attributes.len() == 2
            })
            .returning(|_, _| Ok("arn:123".to_string()));

        let resource = ManagedResource::new(
            ResourceKey::new("Topic", "orders"),
            Spec::new()
                .with("DisplayName", Field::Empty)
                .with("Policy", Field::json(serde_json::json!({"a": 1}))),
        );
        let id = adapter(client).create(&resource).await.expect("create");
        assert_eq!(id, "arn:123");
    }

    #[tokio::test]
    async fn test_set_attribute_sends_raw_rendering() {
        let mut client = MockExternalClient::new();
        client
            .expect_set_attribute()
            .with(eq("arn:123"), eq("DisplayName"), eq("Q"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let change = ChangeItem::new("DisplayName", crate::attributes::AttributeValue::Text("Q".into()));
        adapter(client)
            .set_attribute("arn:123", &change)
            .await
            .expect("set attribute");
    }

    #[tokio::test]
    async fn test_lookup_uses_kind_scoped_name() {
        let mut client = MockExternalClient::new();
        client
            .expect_find_by_name()
            .with(eq("Topic/orders"))
            .returning(|_| Ok(Lookup::Found("arn:123".to_string())));

        let resource = ManagedResource::new(ResourceKey::new("Topic", "orders"), Spec::new());
        assert_eq!(
            adapter(client).lookup(&resource).await.expect("lookup"),
            Lookup::Found("arn:123".to_string())
        );
    }

    #[test]
    fn test_registry_rejects_unknown_kind() {
        let registry = AdapterRegistry::new().with(Arc::new(adapter(MockExternalClient::new())));
        assert!(registry.get("Topic").is_ok());
        assert_eq!(registry.kinds(), ["Topic"]);

        let err = registry.get("Queue").err().expect("unknown kind");
        assert!(matches!(err, Error::UnknownKind { ref kind } if kind == "Queue"));
    }

    mod deadlines {
        use super::*;

        /// Story: a hung call surfaces as a transient deadline error instead
        /// of stalling the worker
        #[tokio::test(start_paused = true)]
        async fn story_hung_call_hits_deadline() {
            let key = ResourceKey::new("Topic", "orders");
            let result: Result<(), Error> = call(
                operations::DESCRIBE,
                &key,
                Duration::from_secs(5),
                std::future::pending(),
            )
            .await;

            let err = result.unwrap_err();
            assert!(matches!(err, Error::DeadlineExceeded { .. }));
            assert!(err.is_retryable());
        }

        #[tokio::test]
        async fn test_collaborator_error_is_wrapped_with_context() {
            let key = ResourceKey::new("Topic", "orders");
            let err = call::<(), _>(
                operations::SET_ATTRIBUTE,
                &key,
                Duration::from_secs(5),
                async { Err(ExternalError::terminal("InvalidParameter")) },
            )
            .await
            .unwrap_err();

            assert_eq!(err.class(), ErrorClass::Terminal);
            assert_eq!(err.resource(), Some("Topic/orders"));
            assert!(err.to_string().starts_with("set-attribute failed"));
        }
    }
}

//! In-memory external system
//!
//! Behaves like a remote attribute store that addresses resources by an
//! opaque identifier and accepts one attribute per `set_attribute` call.
//! Faults can be injected per operation or per attribute, a create can be
//! made to lose its acknowledgement, and resources can be changed or removed
//! out of band to simulate drift.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::adapter::{ExternalClient, Lookup};
use crate::attributes::ExternalAttributes;
use crate::error::ExternalError;

/// Prefix of issued identifiers
const ID_PREFIX: &str = "arn:";

/// Operations of the in-memory system, for fault injection and call counts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `describe`
    Describe,
    /// `find_by_name`
    Lookup,
    /// `create`
    Create,
    /// `set_attribute`
    SetAttribute,
    /// `delete`
    Delete,
}

#[derive(Clone, Debug)]
struct StoredResource {
    name: String,
    attributes: ExternalAttributes,
}

/// One successful `set_attribute` call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeWrite {
    /// Resource identifier
    pub id: String,
    /// Attribute key
    pub key: String,
    /// Raw value written
    pub value: String,
}

/// Thread-safe in-memory [`ExternalClient`]
pub struct MemoryExternalSystem {
    next_id: AtomicU64,
    searchable: bool,
    defaults: ExternalAttributes,
    latency: Mutex<Option<Duration>>,
    resources: DashMap<String, StoredResource>,
    faults: Mutex<HashMap<Operation, VecDeque<ExternalError>>>,
    attribute_faults: Mutex<HashMap<String, VecDeque<ExternalError>>>,
    lost_create_acks: AtomicU32,
    calls: DashMap<Operation, u64>,
    writes: Mutex<Vec<AttributeWrite>>,
}

impl Default for MemoryExternalSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryExternalSystem {
    /// A searchable system issuing identifiers `arn:1`, `arn:2`, ...
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            searchable: true,
            defaults: ExternalAttributes::new(),
            latency: Mutex::new(None),
            resources: DashMap::new(),
            faults: Mutex::new(HashMap::new()),
            attribute_faults: Mutex::new(HashMap::new()),
            lost_create_acks: AtomicU32::new(0),
            calls: DashMap::new(),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Make `find_by_name` report [`Lookup::Unsupported`]
    pub fn without_search(mut self) -> Self {
        self.searchable = false;
        self
    }

    /// Attributes the system fills in when a create does not set them
    pub fn with_defaults(mut self, defaults: ExternalAttributes) -> Self {
        self.defaults = defaults;
        self
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Fail the next call of `operation` with `error`. Queued faults are
    /// consumed in order.
    pub fn fail_next(&self, operation: Operation, error: ExternalError) {
        self.faults
            .lock()
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Fail the next `times` writes of attribute `key` with `error`
    pub fn fail_attribute(&self, key: impl Into<String>, error: ExternalError, times: usize) {
        let mut faults = self.attribute_faults.lock();
        let queue = faults.entry(key.into()).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// The next create takes effect but its response is lost
    pub fn lose_next_create_ack(&self) {
        self.lost_create_acks.fetch_add(1, Ordering::SeqCst);
    }

    /// Change an attribute out of band
    pub fn mutate(&self, id: &str, key: impl Into<String>, value: impl Into<String>) -> bool {
        match self.resources.get_mut(id) {
            Some(mut resource) => {
                resource.attributes.insert(key.into(), value.into());
                true
            }
            None => false,
        }
    }

    /// Delete a resource out of band
    pub fn remove(&self, id: &str) -> bool {
        self.resources.remove(id).is_some()
    }

    /// Current attributes of a resource
    pub fn get(&self, id: &str) -> Option<ExternalAttributes> {
        self.resources.get(id).map(|r| r.attributes.clone())
    }

    /// Identifiers of resources created under `name`
    pub fn ids_for_name(&self, name: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .resources
            .iter()
            .filter(|entry| entry.value().name == name)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of live resources
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether no resources exist
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Number of calls made to `operation`, including failed ones
    pub fn calls(&self, operation: Operation) -> u64 {
        self.calls.get(&operation).map(|c| *c).unwrap_or(0)
    }

    /// Successful attribute writes, in order
    pub fn writes(&self) -> Vec<AttributeWrite> {
        self.writes.lock().clone()
    }

    async fn begin(&self, operation: Operation) -> Result<(), ExternalError> {
        *self.calls.entry(operation).or_insert(0) += 1;

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let fault = self
            .faults
            .lock()
            .get_mut(&operation)
            .and_then(VecDeque::pop_front);
        match fault {
            Some(error) => {
                debug!(?operation, %error, "injected fault");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn not_found(id: &str) -> ExternalError {
        ExternalError::not_found(format!("NotFound: resource {id} does not exist"))
    }
}

#[async_trait]
impl ExternalClient for MemoryExternalSystem {
    async fn describe(&self, id: &str) -> Result<ExternalAttributes, ExternalError> {
        self.begin(Operation::Describe).await?;
        self.get(id).ok_or_else(|| Self::not_found(id))
    }

    async fn create(
        &self,
        name: &str,
        attributes: &ExternalAttributes,
    ) -> Result<String, ExternalError> {
        self.begin(Operation::Create).await?;

        if !self.ids_for_name(name).is_empty() {
            return Err(ExternalError::terminal(format!(
                "ResourceInUse: a resource named {name} already exists"
            )));
        }

        let id = format!("{ID_PREFIX}{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut stored = self.defaults.clone();
        stored.extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.resources.insert(
            id.clone(),
            StoredResource {
                name: name.to_string(),
                attributes: stored,
            },
        );

        let lost = self
            .lost_create_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            debug!(%id, name, "dropping create acknowledgement");
            return Err(ExternalError::transient("connection reset before response"));
        }
        Ok(id)
    }

    async fn set_attribute(&self, id: &str, key: &str, value: &str) -> Result<(), ExternalError> {
        self.begin(Operation::SetAttribute).await?;

        let fault = self
            .attribute_faults
            .lock()
            .get_mut(key)
            .and_then(VecDeque::pop_front);
        if let Some(error) = fault {
            return Err(error);
        }

        let mut resource = self.resources.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        resource.attributes.insert(key.to_string(), value.to_string());
        drop(resource);

        self.writes.lock().push(AttributeWrite {
            id: id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), ExternalError> {
        self.begin(Operation::Delete).await?;
        self.resources
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn find_by_name(&self, name: &str) -> Result<Lookup, ExternalError> {
        self.begin(Operation::Lookup).await?;
        if !self.searchable {
            return Ok(Lookup::Unsupported);
        }
        Ok(match self.ids_for_name(name).into_iter().next() {
            Some(id) => Lookup::Found(id),
            None => Lookup::Absent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> ExternalAttributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_describe_delete() {
        let system = MemoryExternalSystem::new();
        let id = system
            .create("orders", &attrs(&[("DisplayName", "Orders")]))
            .await
            .expect("create");
        assert_eq!(id, "arn:1");

        let observed = system.describe(&id).await.expect("describe");
        assert_eq!(observed["DisplayName"], "Orders");

        system.delete(&id).await.expect("delete");
        assert!(system.describe(&id).await.unwrap_err().is_not_found());
        assert!(system.delete(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_defaults_fill_unset_attributes() {
        let system = MemoryExternalSystem::new()
            .with_defaults(attrs(&[("DisplayName", "default"), ("Policy", "{}")]));
        let id = system
            .create("orders", &attrs(&[("DisplayName", "mine")]))
            .await
            .expect("create");

        let observed = system.get(&id).expect("stored");
        assert_eq!(observed["DisplayName"], "mine");
        assert_eq!(observed["Policy"], "{}");
    }

    /// Story: the create lands but the caller only sees a connection reset;
    /// a lookup by name still finds it
    #[tokio::test]
    async fn story_lost_create_ack_is_findable() {
        let system = MemoryExternalSystem::new();
        system.lose_next_create_ack();

        let err = system.create("orders", &attrs(&[])).await.unwrap_err();
        assert!(!err.is_not_found());
        assert_eq!(system.len(), 1);

        assert_eq!(
            system.find_by_name("orders").await.expect("lookup"),
            Lookup::Found("arn:1".to_string())
        );
        let second = system.create("orders", &attrs(&[])).await.unwrap_err();
        assert!(second.message.contains("already exists"));
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let system = MemoryExternalSystem::new();
        let id = system.create("orders", &attrs(&[])).await.expect("create");

        system.fail_next(Operation::Describe, ExternalError::transient("Throttling"));
        assert!(system.describe(&id).await.is_err());
        assert!(system.describe(&id).await.is_ok());
        assert_eq!(system.calls(Operation::Describe), 2);
    }

    #[tokio::test]
    async fn test_attribute_faults_only_hit_that_key() {
        let system = MemoryExternalSystem::new();
        let id = system.create("orders", &attrs(&[])).await.expect("create");
        system.fail_attribute("Policy", ExternalError::terminal("InvalidParameter"), 1);

        assert!(system.set_attribute(&id, "DisplayName", "A").await.is_ok());
        assert!(system.set_attribute(&id, "Policy", "P").await.is_err());
        assert!(system.set_attribute(&id, "Policy", "P").await.is_ok());
        assert_eq!(system.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_unsearchable_system_reports_unsupported() {
        let system = MemoryExternalSystem::new().without_search();
        assert_eq!(
            system.find_by_name("orders").await.expect("lookup"),
            Lookup::Unsupported
        );
    }

    #[tokio::test]
    async fn test_out_of_band_changes() {
        let system = MemoryExternalSystem::new();
        let id = system.create("orders", &attrs(&[])).await.expect("create");

        assert!(system.mutate(&id, "DisplayName", "drifted"));
        assert_eq!(system.get(&id).expect("stored")["DisplayName"], "drifted");
        assert!(system.remove(&id));
        assert!(!system.mutate(&id, "DisplayName", "x"));
        assert!(system.is_empty());
    }
}

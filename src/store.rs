//! Desired-state record store
//!
//! The controller reads desired records and writes status, late-initialized
//! spec fields and the bound external name back through [`DesiredStore`].
//! [`MemoryStore`] keeps records in a concurrent map and publishes user
//! changes on a broadcast feed the runner subscribes to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::attributes::Spec;
use crate::resource::{ManagedResource, Phase, ResourceKey, ResourceStatus};
use crate::Error;

/// Capacity of the change feed before slow subscribers lag
const CHANGE_FEED_CAPACITY: usize = 1024;

/// Storage of declarative records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DesiredStore: Send + Sync {
    /// Load the current record, `None` once it has been retired
    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedResource>, Error>;

    /// Keys of every live record
    async fn list(&self) -> Result<Vec<ResourceKey>, Error>;

    /// Persist late-initialized fields. Each field in `fields` is written
    /// only if the current record still has it unset; returns the keys
    /// written.
    async fn fill_unset_fields(&self, key: &ResourceKey, fields: &Spec)
        -> Result<Vec<String>, Error>;

    /// Write the external name. Rejects a second, different name and clears
    /// the create-pending marker.
    async fn bind_external_name(&self, key: &ResourceKey, external_name: &str)
        -> Result<(), Error>;

    /// Record that a create call is about to be made
    async fn mark_create_pending(&self, key: &ResourceKey, at: DateTime<Utc>)
        -> Result<(), Error>;

    /// Record that no create call is outstanding
    async fn clear_create_pending(&self, key: &ResourceKey) -> Result<(), Error>;

    /// Replace the status
    async fn update_status(&self, key: &ResourceKey, status: &ResourceStatus)
        -> Result<(), Error>;

    /// Release the record after its external resource is gone
    async fn retire(&self, key: &ResourceKey) -> Result<(), Error>;

    /// Feed of keys whose desired state changed
    fn subscribe(&self) -> broadcast::Receiver<ResourceKey>;
}

/// In-memory [`DesiredStore`]
pub struct MemoryStore {
    records: DashMap<ResourceKey, ManagedResource>,
    retired: DashMap<ResourceKey, ManagedResource>,
    changes: broadcast::Sender<ResourceKey>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// An empty store
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            records: DashMap::new(),
            retired: DashMap::new(),
            changes,
        }
    }

    /// Insert or replace a whole record and notify subscribers
    pub fn insert(&self, resource: ManagedResource) {
        let key = resource.key.clone();
        self.records.insert(key.clone(), resource);
        self.notify(key);
    }

    /// Create a record or replace its spec, keeping status and binding
    pub fn apply(&self, key: ResourceKey, spec: Spec) {
        self.records
            .entry(key.clone())
            .and_modify(|resource| resource.spec = spec.clone())
            .or_insert_with(|| ManagedResource::new(key.clone(), spec));
        self.notify(key);
    }

    /// Ask for the record's external resource to be deleted.
    ///
    /// Returns false when no such record exists.
    pub fn request_deletion(&self, key: &ResourceKey) -> bool {
        let found = match self.records.get_mut(key) {
            Some(mut resource) => {
                resource.deletion_requested = true;
                true
            }
            None => false,
        };
        if found {
            self.notify(key.clone());
        }
        found
    }

    /// Snapshot of a live record
    pub fn record(&self, key: &ResourceKey) -> Option<ManagedResource> {
        self.records.get(key).map(|r| r.clone())
    }

    /// Final snapshot of a retired record
    pub fn retired(&self, key: &ResourceKey) -> Option<ManagedResource> {
        self.retired.get(key).map(|r| r.clone())
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no live records exist
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn notify(&self, key: ResourceKey) {
        // no subscribers yet is fine; the runner resyncs on start
        let _ = self.changes.send(key);
    }

    fn missing(key: &ResourceKey) -> Error {
        Error::store(key, "record not found")
    }
}

#[async_trait]
impl DesiredStore for MemoryStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedResource>, Error> {
        Ok(self.record(key))
    }

    async fn list(&self) -> Result<Vec<ResourceKey>, Error> {
        let mut keys: Vec<ResourceKey> = self.records.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn fill_unset_fields(
        &self,
        key: &ResourceKey,
        fields: &Spec,
    ) -> Result<Vec<String>, Error> {
        let mut resource = self.records.get_mut(key).ok_or_else(|| Self::missing(key))?;
        let mut written = Vec::new();
        for (field_key, field) in fields.iter().filter(|(_, f)| !f.is_unset()) {
            if resource.spec.get(field_key).is_unset() {
                resource.spec.set(field_key, field.clone());
                written.push(field_key.to_string());
            }
        }
        Ok(written)
    }

    async fn bind_external_name(
        &self,
        key: &ResourceKey,
        external_name: &str,
    ) -> Result<(), Error> {
        let mut resource = self.records.get_mut(key).ok_or_else(|| Self::missing(key))?;
        match &resource.external_name {
            Some(existing) if existing == external_name => {}
            Some(existing) => {
                return Err(Error::AlreadyBound {
                    resource: key.to_string(),
                    existing: existing.clone(),
                    attempted: external_name.to_string(),
                });
            }
            None => resource.external_name = Some(external_name.to_string()),
        }
        resource.create_pending = None;
        Ok(())
    }

    async fn mark_create_pending(&self, key: &ResourceKey, at: DateTime<Utc>) -> Result<(), Error> {
        let mut resource = self.records.get_mut(key).ok_or_else(|| Self::missing(key))?;
        resource.create_pending = Some(at);
        Ok(())
    }

    async fn clear_create_pending(&self, key: &ResourceKey) -> Result<(), Error> {
        let mut resource = self.records.get_mut(key).ok_or_else(|| Self::missing(key))?;
        resource.create_pending = None;
        Ok(())
    }

    async fn update_status(&self, key: &ResourceKey, status: &ResourceStatus) -> Result<(), Error> {
        let mut resource = self.records.get_mut(key).ok_or_else(|| Self::missing(key))?;
        resource.status = status.clone();
        Ok(())
    }

    async fn retire(&self, key: &ResourceKey) -> Result<(), Error> {
        match self.records.remove(key) {
            Some((key, mut resource)) => {
                resource.status.phase = Phase::Retired;
                info!(resource = %key, "record retired");
                self.retired.insert(key, resource);
            }
            None => debug!(resource = %key, "retire of unknown record ignored"),
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceKey> {
        self.changes.subscribe()
    }
}

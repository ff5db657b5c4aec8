//! Event recording for the reconciliation controller.
//!
//! Provides a trait-based abstraction over event emission so that the
//! controller can report lifecycle milestones and failures to whatever sink
//! the embedding process provides.
//!
//! Events are **fire-and-forget**: implementations log failures and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::resource::ResourceKey;

/// Severity of an event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Expected lifecycle progress
    Normal,
    /// Something the user may need to act on
    Warning,
}

/// Trait for publishing events about managed resources.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource` - The managed resource this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "CreatedExternalResource")
    /// * `action` - What action was taken (e.g. "Create")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource: &ResourceKey,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher that writes events to the tracing log.
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(
        &self,
        resource: &ResourceKey,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let note = note.unwrap_or_default();
        match type_ {
            EventType::Normal => info!(%resource, reason, action, note, "event"),
            EventType::Warning => warn!(%resource, reason, action, note, "event"),
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource: &ResourceKey,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Create succeeded and the identifier was bound
    pub const CREATED_EXTERNAL_RESOURCE: &str = "CreatedExternalResource";
    /// An already existing external resource was found and bound
    pub const BOUND_EXISTING_RESOURCE: &str = "BoundExistingResource";
    /// Unset spec fields were filled from observed values
    pub const LATE_INITIALIZED: &str = "LateInitialized";
    /// Attribute changes were applied
    pub const UPDATED_EXTERNAL_RESOURCE: &str = "UpdatedExternalResource";
    /// The external resource matches the desired state
    pub const SYNCED: &str = "Synced";
    /// Delete was issued
    pub const DELETING_EXTERNAL_RESOURCE: &str = "DeletingExternalResource";
    /// The record was released
    pub const RETIRED: &str = "Retired";
    /// The bound external resource disappeared
    pub const EXTERNAL_RESOURCE_VANISHED: &str = "ExternalResourceVanished";
    /// A pass failed
    pub const RECONCILE_ERROR: &str = "ReconcileError";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation pass
    pub const RECONCILE: &str = "Reconcile";
    /// Create or bind
    pub const CREATE: &str = "Create";
    /// Attribute updates
    pub const UPDATE: &str = "Update";
    /// Delete or retire
    pub const DELETE: &str = "Delete";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishers_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
        assert_send_sync::<TracingEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::CREATED_EXTERNAL_RESOURCE, "CreatedExternalResource");
        assert_eq!(reasons::SYNCED, "Synced");
        assert_eq!(actions::RECONCILE, "Reconcile");
    }

    #[tokio::test]
    async fn publishers_do_not_panic() {
        let key = ResourceKey::new("Topic", "orders");
        NoopEventPublisher
            .publish(&key, EventType::Normal, reasons::SYNCED, actions::RECONCILE, None)
            .await;
        TracingEventPublisher
            .publish(
                &key,
                EventType::Warning,
                reasons::RECONCILE_ERROR,
                actions::UPDATE,
                Some("throttled".to_string()),
            )
            .await;
    }
}

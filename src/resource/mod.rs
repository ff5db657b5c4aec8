//! Managed resource records
//!
//! A [`ManagedResource`] is the controller's view of one declarative record:
//! the desired [`Spec`], the last observed status, and the external
//! identifier once it has been bound.

mod condition;

pub use condition::{reasons, Condition, ConditionStatus, READY, SYNCED};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attributes::{ExternalAttributes, Spec};

/// Stable internal identity of a managed resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Resource kind, selects the adapter
    pub kind: String,
    /// Name, unique within the kind
    pub name: String,
}

impl ResourceKey {
    /// Create a key
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// What happens to the external resource when its record is deleted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionPolicy {
    /// Delete the external resource, then retire the record
    #[default]
    Delete,
    /// Retire the record and leave the external resource in place
    Orphan,
}

/// Reconciliation state of a managed resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// No external identifier bound yet
    #[default]
    Unbound,
    /// Bound, and the last observation differed from the desired state
    OutOfSync,
    /// Bound, and the last observation matched the desired state
    Synced,
    /// Delete was issued and is awaiting confirmation
    Deleting,
    /// The external resource is gone and the record is released
    Retired,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unbound => write!(f, "Unbound"),
            Self::OutOfSync => write!(f, "OutOfSync"),
            Self::Synced => write!(f, "Synced"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Retired => write!(f, "Retired"),
        }
    }
}

/// Observed state of a managed resource
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Current phase
    pub phase: Phase,

    /// Attributes from the most recent successful Observe
    #[serde(default)]
    pub at_provider: ExternalAttributes,

    /// Ready and Synced conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Human-readable summary of the last pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the last pass finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<DateTime<Utc>>,
}

impl ResourceStatus {
    /// Status in the given phase
    pub fn with_phase(phase: Phase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the phase
    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Set the message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Add or replace a condition of the same type
    pub fn condition(mut self, condition: Condition) -> Self {
        self.set_condition(condition);
        self
    }

    /// Add or replace a condition of the same type.
    ///
    /// The transition time is kept when the status value did not change.
    pub fn set_condition(&mut self, mut condition: Condition) {
        if let Some(existing) = self.get_condition(&condition.type_) {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
        }
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
    }

    /// Condition of the given type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Whether the Ready condition is True
    pub fn is_ready(&self) -> bool {
        self.get_condition(READY)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}

/// The controller's view of one declarative record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResource {
    /// Stable identity
    pub key: ResourceKey,

    /// Desired parameters
    #[serde(default)]
    pub spec: Spec,

    /// Observed state
    #[serde(default)]
    pub status: ResourceStatus,

    /// Identifier in the external system; assigned at most once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_name: Option<String>,

    /// Whether the user asked for the resource to be deleted
    #[serde(default)]
    pub deletion_requested: bool,

    /// What deletion does to the external resource
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,

    /// Set while a create call's outcome is unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_pending: Option<DateTime<Utc>>,
}

impl ManagedResource {
    /// A fresh, unbound resource
    pub fn new(key: ResourceKey, spec: Spec) -> Self {
        Self {
            key,
            spec,
            status: ResourceStatus::default(),
            external_name: None,
            deletion_requested: false,
            deletion_policy: DeletionPolicy::default(),
            create_pending: None,
        }
    }

    /// Builder-style deletion policy
    pub fn with_deletion_policy(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = policy;
        self
    }

    /// Whether an external identifier has been bound
    pub fn is_bound(&self) -> bool {
        self.external_name.is_some()
    }
}

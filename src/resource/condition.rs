//! Status conditions exposed to observers of a desired record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition type reporting whether the external resource is usable
pub const READY: &str = "Ready";
/// Condition type reporting whether the last reconciliation pass succeeded
pub const SYNCED: &str = "Synced";

/// Well-known condition reasons
pub mod reasons {
    /// The external resource exists and matches the desired state
    pub const AVAILABLE: &str = "Available";
    /// The external resource is being created
    pub const CREATING: &str = "Creating";
    /// Attribute changes are being applied
    pub const UPDATING: &str = "Updating";
    /// The external resource is being deleted
    pub const DELETING: &str = "Deleting";
    /// The external resource is missing or cannot be used
    pub const UNAVAILABLE: &str = "Unavailable";
    /// The last pass completed without error
    pub const RECONCILE_SUCCESS: &str = "ReconcileSuccess";
    /// The last pass failed
    pub const RECONCILE_ERROR: &str = "ReconcileError";
}

/// Condition status
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A status entry with type, status, reason and message
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Condition {
    /// Type of condition (Ready, Synced)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition's status changed
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// The external resource was observed to exist and be up to date
    pub fn available() -> Self {
        Self::new(READY, ConditionStatus::True, reasons::AVAILABLE, "")
    }

    /// Create was issued and the resource has not been observed yet
    pub fn creating() -> Self {
        Self::new(READY, ConditionStatus::False, reasons::CREATING, "")
    }

    /// The external resource differs from the desired state
    pub fn updating(message: impl Into<String>) -> Self {
        Self::new(READY, ConditionStatus::False, reasons::UPDATING, message)
    }

    /// Delete was issued
    pub fn deleting() -> Self {
        Self::new(READY, ConditionStatus::False, reasons::DELETING, "")
    }

    /// The external resource is missing or unusable
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(READY, ConditionStatus::False, reasons::UNAVAILABLE, message)
    }

    /// The pass completed without error
    pub fn reconcile_success() -> Self {
        Self::new(SYNCED, ConditionStatus::True, reasons::RECONCILE_SUCCESS, "")
    }

    /// The pass failed
    pub fn reconcile_error(message: impl Into<String>) -> Self {
        Self::new(SYNCED, ConditionStatus::False, reasons::RECONCILE_ERROR, message)
    }

    /// Same type, status, reason and message, ignoring the timestamp
    pub fn equivalent(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

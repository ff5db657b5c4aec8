//! Error types for the reconciliation engine
//!
//! Errors are structured with fields to aid debugging in production. Every
//! failure of an external call carries the operation name and the resource
//! identity it concerns. The [`ErrorClass`] of an error decides how the
//! runner requeues the resource.

use std::time::Duration;

use thiserror::Error;

/// Failure category used to pick a requeue strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The external resource does not exist. Drives create, or confirms delete.
    NotFound,
    /// Network, timeout or throttling failure that may succeed on retry
    Transient,
    /// Validation, permission or conflicting-state failure
    Terminal,
}

impl ErrorClass {
    /// Metric label for this class
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Transient => "transient",
            Self::Terminal => "terminal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Transient => write!(f, "transient"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

/// Error reported by an external system collaborator
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{class} failure: {message}")]
pub struct ExternalError {
    /// Failure category
    pub class: ErrorClass,
    /// Message from the external system
    pub message: String,
}

impl ExternalError {
    /// The addressed resource does not exist
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::NotFound,
            message: msg.into(),
        }
    }

    /// A failure worth retrying (throttling, connectivity)
    pub fn transient(msg: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: msg.into(),
        }
    }

    /// A failure that will repeat until something changes (validation, permission)
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Terminal,
            message: msg.into(),
        }
    }

    /// Whether the external system reported the resource as absent
    pub fn is_not_found(&self) -> bool {
        self.class == ErrorClass::NotFound
    }
}

/// Main error type for reconciliation
#[derive(Debug, Error)]
pub enum Error {
    /// An external system call failed
    #[error("{operation} failed for {resource}: {source}")]
    External {
        /// Operation being performed (describe, create, ...)
        operation: &'static str,
        /// Identity of the managed resource
        resource: String,
        /// The collaborator's error
        #[source]
        source: ExternalError,
    },

    /// An external system call did not finish before its deadline
    #[error("{operation} for {resource} exceeded its {deadline:?} deadline")]
    DeadlineExceeded {
        /// Operation being performed
        operation: &'static str,
        /// Identity of the managed resource
        resource: String,
        /// The deadline that expired
        deadline: Duration,
    },

    /// Some attribute changes were applied before one failed
    #[error(
        "partial apply for {resource}: applied [{}], pending [{}]: {source}",
        .applied.join(", "),
        .pending.join(", ")
    )]
    PartialApply {
        /// Identity of the managed resource
        resource: String,
        /// Attribute keys that were applied this pass
        applied: Vec<String>,
        /// Attribute keys that still need to be applied
        pending: Vec<String>,
        /// The first hard error, or the last transient one
        source: Box<Error>,
    },

    /// The bound external resource disappeared while deletion was not requested
    #[error("external resource {external_name} for {resource} no longer exists")]
    Vanished {
        /// Identity of the managed resource
        resource: String,
        /// The bound external identifier
        external_name: String,
    },

    /// A create-only attribute differs from the desired value
    #[error("attribute {key} of {resource} cannot be changed after creation")]
    ImmutableAttribute {
        /// Identity of the managed resource
        resource: String,
        /// The attribute key
        key: String,
    },

    /// A previous create may have succeeded and the adapter cannot look it up
    #[error(
        "create outcome for {resource} is unknown and the external system cannot be searched by name"
    )]
    CreateOutcomeUnknown {
        /// Identity of the managed resource
        resource: String,
    },

    /// An attempt to rebind an already bound external name
    #[error("{resource} is bound to {existing}, refusing to bind {attempted}")]
    AlreadyBound {
        /// Identity of the managed resource
        resource: String,
        /// The identifier already bound
        existing: String,
        /// The identifier that was rejected
        attempted: String,
    },

    /// No adapter was registered for the resource's kind
    #[error("no adapter registered for kind {kind}")]
    UnknownKind {
        /// The resource kind
        kind: String,
    },

    /// The desired-record store failed
    #[error("store error for {resource}: {message}")]
    Store {
        /// Identity of the managed resource
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Invalid controller configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what is invalid
        message: String,
    },
}

impl Error {
    /// Wrap a collaborator error with the operation and resource it concerns
    pub fn external(
        operation: &'static str,
        resource: impl ToString,
        source: ExternalError,
    ) -> Self {
        Self::External {
            operation,
            resource: resource.to_string(),
            source,
        }
    }

    /// Create a store error for the given resource
    pub fn store(resource: impl ToString, msg: impl Into<String>) -> Self {
        Self::Store {
            resource: resource.to_string(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Failure category of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::External { source, .. } => source.class,
            Error::DeadlineExceeded { .. } => ErrorClass::Transient,
            Error::PartialApply { source, .. } => source.class(),
            Error::Vanished { .. } => ErrorClass::Terminal,
            Error::ImmutableAttribute { .. } => ErrorClass::Terminal,
            Error::CreateOutcomeUnknown { .. } => ErrorClass::Terminal,
            Error::AlreadyBound { .. } => ErrorClass::Terminal,
            Error::UnknownKind { .. } => ErrorClass::Terminal,
            Error::Store { .. } => ErrorClass::Transient,
            Error::Serialization { .. } => ErrorClass::Terminal,
            Error::Config { .. } => ErrorClass::Terminal,
        }
    }

    /// Check if this error is worth retrying soon
    ///
    /// Only transient failures are retried with backoff. Terminal failures
    /// are retried at the slow cadence by the runner instead.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Get the resource identity if this error concerns a specific resource
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::External { resource, .. }
            | Error::DeadlineExceeded { resource, .. }
            | Error::PartialApply { resource, .. }
            | Error::Vanished { resource, .. }
            | Error::ImmutableAttribute { resource, .. }
            | Error::CreateOutcomeUnknown { resource }
            | Error::AlreadyBound { resource, .. }
            | Error::Store { resource, .. } => Some(resource),
            Error::UnknownKind { .. } | Error::Serialization { .. } | Error::Config { .. } => None,
        }
    }

    /// Attribute keys still waiting to be applied, for partial apply failures
    pub fn pending_keys(&self) -> &[String] {
        match self {
            Error::PartialApply { pending, .. } => pending,
            _ => &[],
        }
    }
}

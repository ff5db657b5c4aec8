//! converge - reconciliation engine for declaratively described external
//! resources
//!
//! converge drives resources that live in a remote system toward the state
//! declared in desired records, through a repeated observe, create, update
//! and delete loop. Every pass re-observes the external resource, so the
//! engine tolerates eventual consistency, partial failures, out-of-band
//! drift and restarts at any point.
//!
//! # Architecture
//!
//! - A [`runner::Runner`] drains a deduplicating [`queue::WorkQueue`] with a
//!   bounded pool of workers; a key is never held by two workers.
//! - Each worker calls [`controller::reconcile`], which loads the record from
//!   a [`store::DesiredStore`] and picks the create, update or delete path.
//! - Kind-specific behavior sits behind one [`adapter::ResourceAdapter`] per
//!   kind, registered in an [`adapter::AdapterRegistry`].
//!
//! # Modules
//!
//! - [`attributes`] - Raw and typed attribute values, tri-state fields, schemas
//! - [`diff`] - Up-to-date check between desired and observed state
//! - [`late_init`] - Copies observed values into unset desired fields
//! - [`binder`] - Pins the external identifier after the first create
//! - [`adapter`] - External system surface and per-kind adapters
//! - [`controller`] - The reconciliation state machine
//! - [`queue`] / [`runner`] - Work queue and worker pool
//! - [`store`] - Desired-record storage and change feed
//! - [`error`] - Error types and failure classes

#![deny(missing_docs)]

pub mod adapter;
pub mod attributes;
pub mod binder;
pub mod config;
pub mod controller;
pub mod diff;
pub mod error;
pub mod events;
pub mod late_init;
pub mod manifest;
pub mod metrics;
pub mod queue;
pub mod resource;
pub mod retry;
pub mod runner;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

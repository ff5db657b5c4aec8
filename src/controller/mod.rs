//! Reconciliation controller
//!
//! One shared controller serves every resource kind. Kind-specific behavior
//! comes from the [`ResourceAdapter`] registered for the kind; the record
//! store, event sink and tunables are injected through [`Context`].

mod apply;
mod reconciler;

use std::sync::Arc;
use std::time::Duration;

pub use apply::{apply_changes, ApplyOutcome};
pub use reconciler::{error_policy, reconcile};

use crate::adapter::{AdapterRegistry, ResourceAdapter};
use crate::config::ControllerConfig;
use crate::events::{EventPublisher, TracingEventPublisher};
use crate::store::DesiredStore;

/// What the runner should do with a key after a pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Reconcile again after the delay
    Requeue(Duration),
    /// Wait for the next change notification
    AwaitChange,
}

impl Action {
    /// Reconcile again after `delay`
    pub fn requeue(delay: Duration) -> Self {
        Self::Requeue(delay)
    }

    /// Do nothing until the record changes
    pub fn await_change() -> Self {
        Self::AwaitChange
    }
}

/// Collaborators shared by every reconciliation pass
pub struct Context {
    /// Desired-state records (trait object for testability)
    pub store: Arc<dyn DesiredStore>,
    /// Adapters by resource kind
    pub adapters: AdapterRegistry,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Deadlines, intervals and backoff
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(store: Arc<dyn DesiredStore>) -> ContextBuilder {
        ContextBuilder::new(store)
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    store: Arc<dyn DesiredStore>,
    adapters: AdapterRegistry,
    events: Option<Arc<dyn EventPublisher>>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(store: Arc<dyn DesiredStore>) -> Self {
        Self {
            store,
            adapters: AdapterRegistry::new(),
            events: None,
            config: ControllerConfig::default(),
        }
    }

    /// Replace the adapter registry
    pub fn adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    /// Register one more adapter
    pub fn adapter(mut self, adapter: Arc<dyn ResourceAdapter>) -> Self {
        self.adapters.register(adapter);
        self
    }

    /// Override the event publisher (defaults to the tracing log)
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the controller configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: self.store,
            adapters: self.adapters,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(TracingEventPublisher)),
            config: self.config,
        }
    }
}

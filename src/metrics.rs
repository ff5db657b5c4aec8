//! Metrics registry for reconciliation observability
//!
//! Provides OpenTelemetry metrics for:
//! - Reconciliation passes (duration, errors by class)
//! - External system calls (count by operation and outcome)
//! - Work queue depth

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::error::ErrorClass;

/// Global meter for converge metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("converge"));

/// Histogram of reconciliation pass duration
///
/// Labels:
/// - `kind`: resource kind
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("converge_reconcile_duration_seconds")
        .with_description("Duration of reconciliation passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconciliation errors
///
/// Labels:
/// - `kind`: resource kind
/// - `class`: not_found, transient, terminal
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("converge_reconcile_errors_total")
        .with_description("Total number of failed reconciliation passes")
        .with_unit("{errors}")
        .build()
});

/// Counter of external system calls
///
/// Labels:
/// - `operation`: describe, lookup, create, set-attribute, delete
/// - `outcome`: success, not_found, transient, terminal, deadline
pub static EXTERNAL_CALLS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("converge_external_calls_total")
        .with_description("Total number of external system calls")
        .with_unit("{calls}")
        .build()
});

/// Gauge of resource keys waiting in the work queue
pub static QUEUE_DEPTH: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("converge_queue_depth")
        .with_description("Number of resource keys waiting to be reconciled")
        .with_unit("{keys}")
        .build()
});

/// Outcome label for an external call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    /// The call succeeded
    Success,
    /// The call returned an error of this class
    Failed(ErrorClass),
    /// The call's deadline expired
    Deadline,
}

impl CallOutcome {
    /// Metric label for this outcome
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed(class) => class.as_str(),
            Self::Deadline => "deadline",
        }
    }
}

/// Record one external call
pub fn record_external_call(operation: &'static str, outcome: CallOutcome) {
    EXTERNAL_CALLS.add(
        1,
        &[
            KeyValue::new("operation", operation),
            KeyValue::new("outcome", outcome.as_str()),
        ],
    );
}

/// Record the current queue depth
pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.record(depth as i64, &[]);
}

/// Times one reconciliation pass
pub struct ReconcileTimer {
    kind: String,
    start: Instant,
}

impl ReconcileTimer {
    /// Start timing a pass for the given kind
    pub fn start(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            start: Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record failed completion
    pub fn error(self, class: ErrorClass) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("kind", self.kind.clone()),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("class", class.as_str()),
            ],
        );
    }
}

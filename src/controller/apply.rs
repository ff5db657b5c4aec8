//! Ordered application of attribute changes
//!
//! A multi-attribute diff is applied as a sequence of single-attribute
//! writes. Transient failures are retried in place a few times and then left
//! pending while the remaining items proceed; any other failure stops the
//! sequence. The next pass re-observes and only sees what still differs.

use tracing::{debug, warn};

use crate::adapter::{call, operations, ResourceAdapter};
use crate::config::ControllerConfig;
use crate::diff::ChangeItem;
use crate::resource::ResourceKey;
use crate::retry::retry_with_backoff;
use crate::Error;

/// Per-item result of applying a change list
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Keys written successfully, in order
    pub applied: Vec<String>,
    /// Keys not written, in order
    pub pending: Vec<String>,
    /// The hard error that stopped the sequence, or the first transient one.
    /// Set exactly when `pending` is non-empty.
    pub error: Option<Error>,
}

impl ApplyOutcome {
    /// Applied keys, or a [`Error::PartialApply`] naming what is pending
    pub fn into_result(self, resource: &ResourceKey) -> Result<Vec<String>, Error> {
        match self.error {
            None => Ok(self.applied),
            Some(source) => Err(Error::PartialApply {
                resource: resource.to_string(),
                applied: self.applied,
                pending: self.pending,
                source: Box::new(source),
            }),
        }
    }

    fn stop(&mut self, remaining: &[ChangeItem], error: Error) {
        self.pending.extend(remaining.iter().map(|c| c.key.clone()));
        self.error = Some(error);
    }
}

/// Apply `changes` to `external_name` one attribute at a time.
pub async fn apply_changes(
    adapter: &dyn ResourceAdapter,
    resource: &ResourceKey,
    external_name: &str,
    changes: &[ChangeItem],
    config: &ControllerConfig,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();

    for (index, change) in changes.iter().enumerate() {
        let immutable = adapter
            .schema()
            .get(&change.key)
            .is_some_and(|attr| !attr.mutable);
        if immutable {
            outcome.stop(
                &changes[index..],
                Error::ImmutableAttribute {
                    resource: resource.to_string(),
                    key: change.key.clone(),
                },
            );
            return outcome;
        }

        let result = retry_with_backoff(
            &config.apply_retry,
            operations::SET_ATTRIBUTE,
            Error::is_retryable,
            || {
                call(
                    operations::SET_ATTRIBUTE,
                    resource,
                    config.call_timeout,
                    adapter.set_attribute(external_name, change),
                )
            },
        )
        .await;

        match result {
            Ok(()) => {
                debug!(%resource, key = %change.key, "applied attribute");
                outcome.applied.push(change.key.clone());
            }
            Err(error) if error.is_retryable() => {
                warn!(%resource, key = %change.key, %error, "attribute left pending");
                outcome.pending.push(change.key.clone());
                outcome.error.get_or_insert(error);
            }
            Err(error) => {
                warn!(%resource, key = %change.key, %error, "stopping attribute updates");
                outcome.stop(&changes[index..], error);
                return outcome;
            }
        }
    }

    outcome
}

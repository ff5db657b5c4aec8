//! Late initialization of unset desired fields from observed state
//!
//! Copies observed values into fields the user left unset so the spec
//! documents what the external system defaulted. The copy is one-way: the
//! external system is never written, and a field that is explicitly empty or
//! valued is never touched. Runs before the diff so a freshly copied field is
//! not reported as a mismatch.

use tracing::debug;

use crate::attributes::{AttributeSchema, ExternalAttributes, Field, Spec};

/// Fill unset schema fields from `observed`.
///
/// Returns the keys that were initialized, in schema order.
pub fn late_initialize(
    schema: &AttributeSchema,
    spec: &mut Spec,
    observed: &ExternalAttributes,
) -> Vec<String> {
    let mut initialized = Vec::new();

    for attr in schema.iter().filter(|a| a.late_init) {
        if !spec.get(&attr.key).is_unset() {
            continue;
        }
        let Some(raw) = observed.get(&attr.key) else {
            continue;
        };

        let field = if attr.kind.is_empty_raw(raw) {
            Field::Empty
        } else {
            match attr.kind.parse(raw) {
                Ok(value) => Field::Value(value),
                Err(error) => {
                    debug!(key = %attr.key, %error, "skipping late initialization of unparseable value");
                    continue;
                }
            }
        };

        spec.set(attr.key.clone(), field);
        initialized.push(attr.key.clone());
    }

    initialized
}

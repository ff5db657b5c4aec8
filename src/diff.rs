//! Up-to-date check between desired spec and observed attributes
//!
//! [`diff`] is a pure function: no I/O, no clock, same inputs give the same
//! output. Only explicitly empty or valued fields are compared; an unset
//! field is "don't care" and never produces a change.

use crate::attributes::{AttributeKind, AttributeSchema, AttributeValue, ExternalAttributes, Field, Spec};

/// One attribute that must be set to converge
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeItem {
    /// Attribute key
    pub key: String,
    /// Value to write
    pub desired: AttributeValue,
}

impl ChangeItem {
    /// Create a change item
    pub fn new(key: impl Into<String>, desired: AttributeValue) -> Self {
        Self {
            key: key.into(),
            desired,
        }
    }
}

/// Result of comparing desired against observed state
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiffResult {
    /// True when no change is needed
    pub up_to_date: bool,
    /// Changes in application order
    pub changes: Vec<ChangeItem>,
}

impl DiffResult {
    /// Keys of the changed attributes, in order
    pub fn keys(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.key.as_str()).collect()
    }
}

/// Compare `desired` against `observed`.
///
/// Schema attributes are compared in schema order using their kind's
/// equality. Desired keys outside the schema follow, in key order, compared
/// by the kind of their own value. Observed keys nobody asked about are
/// ignored.
pub fn diff(schema: &AttributeSchema, desired: &Spec, observed: &ExternalAttributes) -> DiffResult {
    let mut changes = Vec::new();

    for attr in schema.iter() {
        if let Some(change) = compare(&attr.key, attr.kind, desired.get(&attr.key), observed) {
            changes.push(change);
        }
    }

    for (key, field) in desired.iter().filter(|(key, _)| !schema.contains(key)) {
        let kind = field.value().map(AttributeValue::kind).unwrap_or_default();
        if let Some(change) = compare(key, kind, field, observed) {
            changes.push(change);
        }
    }

    DiffResult {
        up_to_date: changes.is_empty(),
        changes,
    }
}

fn compare(
    key: &str,
    kind: AttributeKind,
    field: &Field,
    observed: &ExternalAttributes,
) -> Option<ChangeItem> {
    let observed = observed.get(key);
    match field {
        Field::Unset => None,
        Field::Empty => match observed {
            None => None,
            Some(raw) if kind.is_empty_raw(raw) => None,
            Some(_) => Some(ChangeItem::new(key, kind.empty_value())),
        },
        Field::Value(value) => match observed {
            None if value.is_empty_value() => None,
            Some(raw) if kind.matches(value, raw) => None,
            _ => Some(ChangeItem::new(key, value.clone())),
        },
    }
}

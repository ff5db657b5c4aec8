//! Attribute model shared by the diff engine and the late initializer
//!
//! External systems report attributes as raw strings. The desired side is
//! typed: every spec field is a tri-state [`Field`] holding an
//! [`AttributeValue`]. An [`AttributeSchema`] names the [`AttributeKind`] of
//! each key, which decides how a raw observed value is parsed and which
//! equality the diff engine uses.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Raw attributes returned by one Observe call, ordered by key.
///
/// Never cached across reconciliation passes.
pub type ExternalAttributes = BTreeMap<String, String>;

/// How an attribute is parsed and compared
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    /// Exact string equality
    #[default]
    Text,
    /// Numeric equality of the parsed values
    Number,
    /// Element-wise equality, order significant
    List,
    /// Membership equality, order and duplicates insignificant
    Set,
    /// Structural equality of JSON documents
    Json,
}

/// A typed desired attribute value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum AttributeValue {
    /// A string
    Text(String),
    /// A number
    Number(f64),
    /// An ordered list of strings
    List(Vec<String>),
    /// An unordered set of strings
    Set(BTreeSet<String>),
    /// A JSON document (policies and similar)
    Json(serde_json::Value),
}

impl AttributeValue {
    /// The kind this value naturally compares as
    pub fn kind(&self) -> AttributeKind {
        match self {
            Self::Text(_) => AttributeKind::Text,
            Self::Number(_) => AttributeKind::Number,
            Self::List(_) => AttributeKind::List,
            Self::Set(_) => AttributeKind::Set,
            Self::Json(_) => AttributeKind::Json,
        }
    }

    /// Canonical raw rendering sent to the external system
    pub fn to_raw(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Number(n) => format_number(*n),
            Self::List(items) => serde_json::Value::from(items.clone()).to_string(),
            Self::Set(items) => {
                serde_json::Value::from(items.iter().cloned().collect::<Vec<_>>()).to_string()
            }
            Self::Json(value) => value.to_string(),
        }
    }

    /// Whether this is the empty value of its kind
    pub fn is_empty_value(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Number(_) => false,
            Self::List(items) => items.is_empty(),
            Self::Set(items) => items.is_empty(),
            Self::Json(value) => match value {
                serde_json::Value::Null => true,
                serde_json::Value::Object(map) => map.is_empty(),
                serde_json::Value::Array(items) => items.is_empty(),
                _ => false,
            },
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl AttributeKind {
    /// Parse a raw observed value
    pub fn parse(&self, raw: &str) -> Result<AttributeValue, String> {
        match self {
            Self::Text => Ok(AttributeValue::Text(raw.to_string())),
            Self::Number => raw
                .trim()
                .parse::<f64>()
                .map(AttributeValue::Number)
                .map_err(|e| format!("not a number: {raw:?}: {e}")),
            Self::List => parse_string_array(raw).map(AttributeValue::List),
            Self::Set => {
                parse_string_array(raw).map(|items| AttributeValue::Set(items.into_iter().collect()))
            }
            Self::Json => {
                if raw.trim().is_empty() {
                    return Ok(AttributeValue::Json(serde_json::Value::Null));
                }
                serde_json::from_str(raw)
                    .map(AttributeValue::Json)
                    .map_err(|e| format!("not a JSON document: {e}"))
            }
        }
    }

    /// Whether a raw observed value is the empty value of this kind
    pub fn is_empty_raw(&self, raw: &str) -> bool {
        let trimmed = raw.trim();
        match self {
            Self::Text => raw.is_empty(),
            Self::Number => trimmed.is_empty(),
            Self::List | Self::Set | Self::Json => {
                trimmed.is_empty() || self.parse(raw).is_ok_and(|v| v.is_empty_value())
            }
        }
    }

    /// The empty value of this kind, used to clear an attribute
    pub fn empty_value(&self) -> AttributeValue {
        match self {
            Self::Text | Self::Number => AttributeValue::Text(String::new()),
            Self::List => AttributeValue::List(Vec::new()),
            Self::Set => AttributeValue::Set(BTreeSet::new()),
            Self::Json => AttributeValue::Json(serde_json::Value::Object(Default::default())),
        }
    }

    /// Whether the desired value matches the raw observed value under this
    /// kind's equality
    pub fn matches(&self, desired: &AttributeValue, observed_raw: &str) -> bool {
        let observed = match self.parse(observed_raw) {
            Ok(observed) => observed,
            Err(_) => return desired.to_raw() == observed_raw,
        };
        match (self, desired, &observed) {
            (Self::Text, _, AttributeValue::Text(o)) => &desired.to_raw() == o,
            (Self::Number, AttributeValue::Number(d), AttributeValue::Number(o)) => d == o,
            (Self::Number, AttributeValue::Text(d), AttributeValue::Number(o)) => {
                d.trim().parse::<f64>().is_ok_and(|d| d == *o)
            }
            (Self::List, AttributeValue::List(d), AttributeValue::List(o)) => d == o,
            (Self::Set, AttributeValue::Set(d), AttributeValue::Set(o)) => d == o,
            (Self::Set, AttributeValue::List(d), AttributeValue::Set(o)) => {
                d.iter().cloned().collect::<BTreeSet<_>>() == *o
            }
            (Self::Json, AttributeValue::Json(d), AttributeValue::Json(o)) => d == o,
            (Self::Json, AttributeValue::Text(d), AttributeValue::Json(o)) => {
                serde_json::from_str::<serde_json::Value>(d).map_or(d == observed_raw, |d| d == *o)
            }
            _ => desired.to_raw() == observed_raw,
        }
    }

    /// Interpret a value from a declarative manifest as a spec field.
    ///
    /// `null` leaves the field unset; an empty string, list or object is an
    /// explicit empty value.
    pub fn field_from_manifest(&self, value: &serde_json::Value) -> Result<Field, String> {
        use serde_json::Value;

        let parsed = match (self, value) {
            (_, Value::Null) => return Ok(Field::Unset),
            (Self::Text, Value::String(s)) => AttributeValue::Text(s.clone()),
            (Self::Text, Value::Number(n)) => AttributeValue::Text(n.to_string()),
            (Self::Text, Value::Bool(b)) => AttributeValue::Text(b.to_string()),
            (Self::Number, Value::Number(n)) => AttributeValue::Number(
                n.as_f64().ok_or_else(|| format!("number out of range: {n}"))?,
            ),
            (Self::Number, Value::String(s)) => self.parse(s)?,
            (Self::List, Value::Array(items)) => AttributeValue::List(string_items(items)?),
            (Self::Set, Value::Array(items)) => {
                AttributeValue::Set(string_items(items)?.into_iter().collect())
            }
            (Self::Json, Value::String(s)) => self.parse(s)?,
            (Self::Json, other) => AttributeValue::Json(other.clone()),
            (kind, other) => return Err(format!("{other} is not a valid {kind:?} value")),
        };

        if parsed.is_empty_value() {
            Ok(Field::Empty)
        } else {
            Ok(Field::Value(parsed))
        }
    }
}

fn parse_string_array(raw: &str) -> Result<Vec<String>, String> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let items: Vec<serde_json::Value> =
        serde_json::from_str(raw).map_err(|e| format!("not a JSON array: {e}"))?;
    string_items(&items)
}

fn string_items(items: &[serde_json::Value]) -> Result<Vec<String>, String> {
    items
        .iter()
        .map(|item| match item {
            serde_json::Value::String(s) => Ok(s.clone()),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            other => Err(format!("unsupported list element {other}")),
        })
        .collect()
}

/// A desired field: unset, explicitly empty, or explicitly valued.
///
/// Only `Unset` fields are "don't care". An explicitly empty field is still
/// compared and is never late-initialized.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "lowercase")]
pub enum Field {
    /// The user expressed no opinion
    #[default]
    Unset,
    /// The user asked for the empty value of the attribute's kind
    Empty,
    /// The user asked for this value
    Value(AttributeValue),
}

impl Field {
    /// A text value
    pub fn text(value: impl Into<String>) -> Self {
        Self::Value(AttributeValue::Text(value.into()))
    }

    /// A numeric value
    pub fn number(value: f64) -> Self {
        Self::Value(AttributeValue::Number(value))
    }

    /// An ordered list value
    pub fn list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Value(AttributeValue::List(items.into_iter().map(Into::into).collect()))
    }

    /// A set value
    pub fn set<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Value(AttributeValue::Set(items.into_iter().map(Into::into).collect()))
    }

    /// A JSON document value
    pub fn json(value: serde_json::Value) -> Self {
        Self::Value(AttributeValue::Json(value))
    }

    /// Whether the user expressed no opinion
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    /// The explicit value, if any
    pub fn value(&self) -> Option<&AttributeValue> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }
}

static UNSET: Field = Field::Unset;

/// Desired parameters of a managed resource, keyed by attribute
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Spec {
    fields: BTreeMap<String, Field>,
}

impl Spec {
    /// An empty spec with every field unset
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn with(mut self, key: impl Into<String>, field: Field) -> Self {
        self.set(key, field);
        self
    }

    /// Set a field. Setting `Unset` removes the key.
    pub fn set(&mut self, key: impl Into<String>, field: Field) {
        let key = key.into();
        if field.is_unset() {
            self.fields.remove(&key);
        } else {
            self.fields.insert(key, field);
        }
    }

    /// Field for `key`; missing keys are unset
    pub fn get(&self, key: &str) -> &Field {
        self.fields.get(key).unwrap_or(&UNSET)
    }

    /// Explicitly empty or valued fields, ordered by key
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(k, f)| (k.as_str(), f))
    }

    /// Number of fields that are not unset
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether every field is unset
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One attribute in a resource kind's schema
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeSpec {
    /// Attribute key as the external system names it
    pub key: String,
    /// Parsing and comparison rules
    pub kind: AttributeKind,
    /// False for create-only attributes
    pub mutable: bool,
    /// False to opt the attribute out of late initialization
    pub late_init: bool,
}

impl AttributeSpec {
    /// A mutable, late-initialized attribute
    pub fn new(key: impl Into<String>, kind: AttributeKind) -> Self {
        Self {
            key: key.into(),
            kind,
            mutable: true,
            late_init: true,
        }
    }

    /// Mark the attribute as settable only at creation
    pub fn create_only(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Never copy the observed value into the spec
    pub fn without_late_init(mut self) -> Self {
        self.late_init = false;
        self
    }
}

/// Ordered attribute schema of a resource kind.
///
/// The order is the order in which changes are produced and applied.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSchema {
    attributes: Vec<AttributeSpec>,
}

impl AttributeSchema {
    /// Build a schema from attributes in application order
    pub fn new(attributes: Vec<AttributeSpec>) -> Self {
        Self { attributes }
    }

    /// Look up an attribute by key
    pub fn get(&self, key: &str) -> Option<&AttributeSpec> {
        self.attributes.iter().find(|a| a.key == key)
    }

    /// Attributes in schema order
    pub fn iter(&self) -> impl Iterator<Item = &AttributeSpec> {
        self.attributes.iter()
    }

    /// Whether `key` is part of the schema
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Parse a manifest's `spec` mapping into a typed [`Spec`].
    ///
    /// Keys outside the schema are kept, typed by their JSON shape.
    pub fn spec_from_manifest(
        &self,
        values: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Spec, String> {
        let mut spec = Spec::new();
        for (key, value) in values {
            let kind = match self.get(key) {
                Some(attr) => attr.kind,
                None => match value {
                    serde_json::Value::Number(_) => AttributeKind::Number,
                    serde_json::Value::Array(_) => AttributeKind::List,
                    serde_json::Value::Object(_) => AttributeKind::Json,
                    _ => AttributeKind::Text,
                },
            };
            let field = kind
                .field_from_manifest(value)
                .map_err(|e| format!("spec.{key}: {e}"))?;
            spec.set(key.clone(), field);
        }
        Ok(spec)
    }
}

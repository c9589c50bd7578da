//! Opaque market-data snapshot passed unchanged to every source.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::decimal_from_json;

/// One snapshot of external data.
///
/// The core never interprets the fields; each source reads the ones it
/// understands and ignores the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    fields: Map<String, Value>,
}

impl Snapshot {
    /// Create a snapshot from a field map, stamped now.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            taken_at: Utc::now(),
            fields,
        }
    }

    /// Create an empty snapshot.
    pub fn empty() -> Self {
        Self::new(Map::new())
    }

    /// Build from a JSON value; only objects are valid snapshots.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self::new(fields)),
            _ => None,
        }
    }

    /// Override the capture timestamp.
    pub fn with_timestamp(mut self, taken_at: DateTime<Utc>) -> Self {
        self.taken_at = taken_at;
        self
    }

    /// Set a field.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    /// Builder form of [`Snapshot::insert`].
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Field as an array; missing or mistyped fields read as empty.
    pub fn array(&self, key: &str) -> &[Value] {
        self.fields
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Field as an object, if it is one.
    pub fn object(&self, key: &str) -> Option<&Map<String, Value>> {
        self.fields.get(key).and_then(Value::as_object)
    }

    /// Field as a decimal, if it is numeric.
    pub fn decimal(&self, key: &str) -> Option<Decimal> {
        self.fields.get(key).and_then(decimal_from_json)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Read a numeric member of a JSON object.
pub fn number(value: &Value, key: &str) -> Option<Decimal> {
    value.get(key).and_then(decimal_from_json)
}

/// Read a string member of a JSON object.
pub fn text<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

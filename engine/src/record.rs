//! Record type for storing data.

use crate::{error::Result, Error, Key};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

static NULL: Value = Value::Null;

/// A row stored in a table: a JSON object keyed by column name.
///
/// One column holds the primary key and one holds the server-issued version
/// stamp; which ones is decided by the table definition, not by the record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style field assignment.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Get a field value. Missing fields read as `null`.
    pub fn field(&self, name: &str) -> &Value {
        self.0.get(name).unwrap_or(&NULL)
    }

    /// Whether the field is present (possibly as `null`).
    pub fn has_field(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Set a field value, returning the previous one.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    /// The key held in `column`, if it is an indexable scalar.
    pub fn key(&self, column: &str) -> Option<Key> {
        Key::from_value(self.field(column))
    }

    /// Whether the record has been persisted remotely, i.e. carries a
    /// non-null version stamp.
    pub fn is_persistent(&self, version_column: &str) -> bool {
        !self.field(version_column).is_null()
    }

    /// Copy of `self` with every field of `overlay` written over it, except
    /// `skip`.
    pub fn merged_except(&self, overlay: &Record, skip: &str) -> Record {
        let mut merged = self.clone();
        for (name, value) in overlay.fields() {
            if name != skip {
                merged.0.insert(name.clone(), value.clone());
            }
        }
        merged
    }

    /// Iterate over all fields.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume the record into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Record {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidRecord(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.into_value()
    }
}

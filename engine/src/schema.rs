//! Table definitions and record validation.
//!
//! A [`TableDef`] declares the columns of a table, which of them is the
//! primary key, which ones get a secondary index and which column carries
//! the server-issued version stamp.

use crate::{error::Result, Error, Key, Record, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Column types supported in table definitions.
///
/// `Int` and `Timestamp` columns accept integral floats such as `160.0`,
/// which compare and index equal to the matching integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

fn is_integral(value: &Value) -> bool {
    value.is_i64()
        || value.is_u64()
        || value
            .as_f64()
            .is_some_and(|f| f.is_finite() && f.fract() == 0.0)
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int | FieldType::Timestamp => is_integral(value),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Json => true,
        }
    }
}

fn default_nullable() -> bool {
    true
}

/// Definition of a single column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    /// Column type
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Maximum string length; 0 means unbounded
    #[serde(default)]
    pub length: usize,
    /// Whether the column may be null or missing
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    /// Name of the referenced table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<TableName>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub indexed: bool,
}

impl ColumnDef {
    /// A plain nullable column.
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            length: 0,
            nullable: true,
            primary_key: false,
            foreign_key: None,
            unique: false,
            indexed: false,
        }
    }

    /// A primary key column.
    pub fn key(field_type: FieldType) -> Self {
        Self {
            primary_key: true,
            nullable: false,
            ..Self::new(field_type)
        }
    }

    /// Enforce uniqueness through a unique secondary index.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Maintain a secondary index on this column.
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn max_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    /// Declare a foreign key to `table`. Foreign key columns are indexed.
    pub fn references(mut self, table: impl Into<TableName>) -> Self {
        self.foreign_key = Some(table.into());
        self
    }

    /// Whether this column is backed by a secondary index.
    pub fn has_index(&self) -> bool {
        !self.primary_key && (self.unique || self.indexed || self.foreign_key.is_some())
    }

    /// Validate a field value against this column.
    pub fn validate(&self, name: &str, value: &Value) -> Result<()> {
        if value.is_null() {
            return if self.nullable {
                Ok(())
            } else {
                Err(Error::MissingRequiredField(name.to_string()))
            };
        }
        if !self.field_type.accepts(value) {
            return Err(Error::TypeMismatch {
                field: name.to_string(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            });
        }
        if self.length > 0 {
            if let Some(s) = value.as_str() {
                if s.chars().count() > self.length {
                    return Err(Error::ValueTooLong {
                        field: name.to_string(),
                        length: self.length,
                    });
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

fn default_version_column() -> String {
    "version".to_string()
}

/// Definition of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDef {
    /// Column definitions by name
    pub columns: BTreeMap<String, ColumnDef>,
    /// Column holding the server-issued version stamp
    #[serde(default = "default_version_column")]
    pub version_column: String,
}

impl Default for TableDef {
    /// An `id` integer primary key and a `version` column.
    fn default() -> Self {
        Self::new().column("id", ColumnDef::key(FieldType::Int))
    }
}

impl TableDef {
    /// A definition with no columns. At least a primary key column must be
    /// added before it validates.
    pub fn new() -> Self {
        Self {
            columns: BTreeMap::new(),
            version_column: default_version_column(),
        }
    }

    /// Builder-style method to add a column.
    pub fn column(mut self, name: impl Into<String>, def: ColumnDef) -> Self {
        self.columns.insert(name.into(), def);
        self
    }

    /// Builder-style method to name the version column.
    pub fn with_version_column(mut self, name: impl Into<String>) -> Self {
        self.version_column = name.into();
        self
    }

    /// The primary key column, if exactly one is declared.
    pub fn primary_key(&self) -> Option<&str> {
        let mut keys = self.columns.iter().filter(|(_, c)| c.primary_key);
        match (keys.next(), keys.next()) {
            (Some((name, _)), None) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Names of the columns backed by a secondary index.
    pub fn indexed_columns(&self) -> impl Iterator<Item = (&String, &ColumnDef)> {
        self.columns.iter().filter(|(_, c)| c.has_index())
    }

    /// Check the definition, returning the primary key column name.
    pub fn validate(&self) -> Result<&str> {
        let keys: Vec<&String> = self
            .columns
            .iter()
            .filter(|(_, c)| c.primary_key)
            .map(|(name, _)| name)
            .collect();
        let pk = match keys.as_slice() {
            [] => return Err(Error::Schema("no primary key column found".into())),
            [pk] => pk.as_str(),
            [first, second, ..] => {
                return Err(Error::Schema(format!(
                    "multiple primary key columns found: '{first}' and '{second}'"
                )))
            }
        };
        if pk == self.version_column {
            return Err(Error::Schema(format!(
                "column '{pk}' cannot be both primary key and version"
            )));
        }
        if let Some(version) = self.columns.get(&self.version_column) {
            if !version.nullable {
                return Err(Error::Schema(format!(
                    "version column '{}' must be nullable",
                    self.version_column
                )));
            }
        }
        for (name, column) in self.indexed_columns() {
            if column.field_type == FieldType::Json {
                return Err(Error::Schema(format!(
                    "column '{name}' of type Json cannot be indexed"
                )));
            }
        }
        Ok(pk)
    }

    /// Validate a record against the declared columns, returning its
    /// primary key. Undeclared fields are accepted as-is.
    pub fn validate_record(&self, record: &Record) -> Result<Key> {
        let pk = self.validate()?;
        for (name, column) in &self.columns {
            column.validate(name, record.field(name))?;
        }
        record
            .key(pk)
            .ok_or_else(|| Error::MissingPrimaryKey(pk.to_string()))
    }
}

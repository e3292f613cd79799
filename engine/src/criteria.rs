//! Query predicates accepted by [`Table::get`](crate::Table::get).
//!
//! A [`Criteria`] is a conjunction of per-field constraints. Each constraint
//! is an equality test, a membership test or a range.

use crate::{error::Result, Bounds, Error, Key, Record};
use serde_json::{Map, Value};

/// A constraint on a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// Field equals the value
    Equals(Value),
    /// Field equals one of the values
    In(Vec<Value>),
    /// Field key lies within the bounds
    Range(Bounds<Key>),
}

impl Constraint {
    /// Evaluate the constraint against a field value.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Constraint::Equals(expected) => values_equal(value, expected),
            Constraint::In(options) => options.iter().any(|o| values_equal(value, o)),
            Constraint::Range(bounds) => {
                Key::from_value(value).is_some_and(|key| bounds.contains(&key))
            }
        }
    }

    /// The index keys to look up for this constraint, or `None` when some
    /// operand cannot be served by an index (e.g. `null`).
    pub(crate) fn lookup_keys(&self) -> Option<Vec<Key>> {
        match self {
            Constraint::Equals(value) => Key::from_value(value).map(|k| vec![k]),
            Constraint::In(values) => values.iter().map(Key::from_value).collect(),
            Constraint::Range(_) => None,
        }
    }
}

/// Equality with numeric normalization, so that `3` equals `3.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (Key::from_value(a), Key::from_value(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

/// A named field constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    pub field: String,
    pub constraint: Constraint,
}

/// A conjunction of field constraints. Empty criteria match every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    criteria: Vec<Criterion>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field == value`.
    pub fn equals(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Constraint::Equals(value.into()))
    }

    /// Require `field` to equal one of `values`.
    pub fn one_of<I, V>(self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.with(field, Constraint::In(values))
    }

    /// Require `field` to lie within `bounds`.
    pub fn range(self, field: impl Into<String>, bounds: Bounds<Key>) -> Self {
        self.with(field, Constraint::Range(bounds))
    }

    /// Add an arbitrary constraint.
    pub fn with(mut self, field: impl Into<String>, constraint: Constraint) -> Self {
        self.criteria.push(Criterion {
            field: field.into(),
            constraint,
        });
        self
    }

    /// Parse object criteria: a scalar means equality, an array means
    /// membership and an object of `$gt`/`$gte`/`$lt`/`$lte` operators means
    /// a range. An object without operators is compared for equality.
    ///
    /// ```
    /// use stash_engine::Criteria;
    /// use serde_json::json;
    ///
    /// let criteria = Criteria::from_json(&json!({
    ///     "lastName": "Dalton",
    ///     "size": {"$gte": 170, "$lt": 190},
    /// }))
    /// .unwrap();
    /// assert_eq!(criteria.len(), 2);
    /// ```
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::InvalidCriteria(format!("expected an object, got {value}")))?;
        let mut criteria = Criteria::new();
        for (field, operand) in object {
            let constraint = match operand {
                Value::Array(values) => Constraint::In(values.clone()),
                Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    Constraint::Range(parse_bounds(field, ops)?)
                }
                other => Constraint::Equals(other.clone()),
            };
            criteria = criteria.with(field.clone(), constraint);
        }
        Ok(criteria)
    }

    /// Whether every constraint holds for `record`.
    pub fn matches(&self, record: &Record) -> bool {
        self.criteria
            .iter()
            .all(|c| c.constraint.matches(record.field(&c.field)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Criterion> {
        self.criteria.iter()
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }
}

fn parse_bounds(field: &str, ops: &Map<String, Value>) -> Result<Bounds<Key>> {
    let mut bounds = Bounds::new();
    for (op, operand) in ops {
        let key = Key::from_value(operand).ok_or_else(|| {
            Error::InvalidCriteria(format!("'{field}': {operand} is not a valid bound"))
        })?;
        match op.as_str() {
            "$gt" => bounds.gt = Some(key),
            "$gte" => bounds.gte = Some(key),
            "$lt" => bounds.lt = Some(key),
            "$lte" => bounds.lte = Some(key),
            other => {
                return Err(Error::InvalidCriteria(format!(
                    "'{field}': unknown operator {other}"
                )))
            }
        }
    }
    Ok(bounds)
}

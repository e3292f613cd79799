//! Synch wire format for a single table.
//!
//! The request lists every local identity with its version, plus the
//! journaled creates, updates and deletes. The response carries rows as
//! positional tuples that are decoded against its `columns`.

use crate::{error::Result, Error, Key, Record, Table};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-table part of a synch request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSynchRequest {
    /// Primary key of every local record, in key order
    pub identities: Vec<Key>,
    /// Version of every local record, parallel to `identities`
    pub versions: Vec<Value>,
    /// Records created locally
    pub created: Vec<Record>,
    /// Pre-edit snapshots of records updated locally
    pub updated: Vec<Record>,
    /// Snapshots or bare identities of records deleted locally
    pub deleted: Vec<Value>,
}

impl TableSynchRequest {
    /// Whether the request carries no local change.
    pub fn has_changes(&self) -> bool {
        !(self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty())
    }
}

/// A positional row.
pub type Row = Vec<Value>;

/// Per-table part of a synch response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSynchResponse {
    /// Field names for the positional rows
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub created: Vec<Row>,
    #[serde(default)]
    pub updated: Vec<Row>,
    #[serde(default)]
    pub deleted_ids: Vec<Value>,
    #[serde(default)]
    pub stale: Vec<Row>,
    #[serde(default)]
    pub failed: Vec<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purged: Option<Vec<Value>>,
}

impl TableSynchResponse {
    /// Decode every row into a field-named record.
    ///
    /// Fails with [`Error::InvalidResponse`] when a row does not match the
    /// column list or a deleted identity is not a valid key.
    pub fn decode(&self) -> Result<SynchChanges> {
        let deleted = self
            .deleted_ids
            .iter()
            .map(|id| {
                Key::from_value(id)
                    .ok_or_else(|| Error::InvalidResponse(format!("{id} is not a valid identity")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SynchChanges {
            created: self.decode_rows(&self.created)?,
            updated: self.decode_rows(&self.updated)?,
            deleted,
            stale: self.decode_rows(&self.stale)?,
            failed: self.decode_rows(&self.failed)?,
            purged: self.purged.clone().unwrap_or_default(),
        })
    }

    fn decode_rows(&self, rows: &[Row]) -> Result<Vec<Record>> {
        rows.iter().map(|row| self.decode_row(row)).collect()
    }

    fn decode_row(&self, row: &[Value]) -> Result<Record> {
        if row.len() != self.columns.len() {
            return Err(Error::InvalidResponse(format!(
                "row has {} values for {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        let fields: Map<String, Value> = self
            .columns
            .iter()
            .cloned()
            .zip(row.iter().cloned())
            .collect();
        Ok(Record::from(fields))
    }

    /// Encode records as positional rows for `columns`. Used by servers and
    /// test doubles.
    pub fn encode_rows<'a, I>(columns: &[String], records: I) -> Vec<Row>
    where
        I: IntoIterator<Item = &'a Record>,
    {
        records
            .into_iter()
            .map(|record| columns.iter().map(|c| record.field(c).clone()).collect())
            .collect()
    }
}

/// A decoded per-table synch response, ready to be applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynchChanges {
    pub created: Vec<Record>,
    pub updated: Vec<Record>,
    pub deleted: Vec<Key>,
    pub stale: Vec<Record>,
    pub failed: Vec<Record>,
    pub purged: Vec<Value>,
}

impl SynchChanges {
    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.created.len()
            + self.updated.len()
            + self.deleted.len()
            + self.stale.len()
            + self.failed.len()
            + self.purged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Table {
    /// Build this table's part of a synch request.
    pub fn create_synch_request(&self) -> TableSynchRequest {
        let mut request = TableSynchRequest::default();
        for record in self.all() {
            if let Some(key) = record.key(self.primary_key()) {
                request.identities.push(key);
                request
                    .versions
                    .push(record.field(self.version_column()).clone());
            }
        }
        request.created = self.created().into_iter().cloned().collect();
        request.updated = self.updated().into_iter().cloned().collect();
        request.deleted = self.deleted();
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TableDef;
    use serde_json::json;

    #[test]
    fn response_rows_decode_against_columns() {
        let response: TableSynchResponse = serde_json::from_value(json!({
            "columns": ["id", "version", "name"],
            "created": [[1, 1, "Joe"]],
            "updated": [[2, 4, "Jack"]],
            "deletedIds": [3],
            "stale": [],
            "failed": []
        }))
        .unwrap();
        let changes = response.decode().unwrap();
        assert_eq!(changes.created[0].field("name"), &json!("Joe"));
        assert_eq!(changes.updated[0].field("version"), &json!(4));
        assert_eq!(changes.deleted, vec![Key::Int(3)]);
        assert!(changes.purged.is_empty());
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn short_rows_are_rejected() {
        let response = TableSynchResponse {
            columns: vec!["id".into(), "version".into()],
            created: vec![vec![json!(1)]],
            ..Default::default()
        };
        assert!(matches!(response.decode(), Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn invalid_deleted_ids_are_rejected() {
        let response = TableSynchResponse {
            deleted_ids: vec![json!({"id": 1})],
            ..Default::default()
        };
        assert!(matches!(response.decode(), Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn rows_roundtrip_through_encode() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let record = Record::new().with("id", 1).with("name", "Joe");
        let response = TableSynchResponse {
            created: TableSynchResponse::encode_rows(&columns, [&record]),
            columns,
            ..Default::default()
        };
        assert_eq!(response.decode().unwrap().created, vec![record]);
    }

    #[test]
    fn request_lists_identities_and_journal() {
        let mut table = Table::new("cowboys", TableDef::default()).unwrap();
        table
            .set(vec![
                Record::new().with("id", 1).with("version", 3),
                Record::new().with("id", 2).with("version", Value::Null),
            ])
            .unwrap();
        table.del([Key::Int(9)]).unwrap();

        let request = table.create_synch_request();
        assert_eq!(request.identities, vec![Key::Int(1), Key::Int(2)]);
        assert_eq!(request.versions, vec![json!(3), Value::Null]);
        assert_eq!(request.created.len(), 1);
        assert_eq!(request.updated.len(), 1);
        assert_eq!(request.deleted, vec![json!(9)]);
        assert!(request.has_changes());

        let wire = serde_json::to_value(&request).unwrap();
        assert!(wire.get("identities").is_some());
    }
}

//! Table - indexed record storage with a change journal.
//!
//! A table owns one unique [`OrderedIndex`] keyed by primary key and one
//! secondary index per indexed, unique or foreign key column. Secondary
//! indexes map column values to primary keys and never store `null`.

use crate::{
    criteria::Constraint, error::Result, ChangeStatus, Criteria, Error, IndexError, Journal, Key,
    OrderedIndex, Record, TableDef, TableName,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Drop repeated keys, keeping first occurrences in order.
fn dedup(keys: Vec<Key>) -> Vec<Key> {
    let mut seen = BTreeSet::new();
    keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
}

/// A named table of records.
#[derive(Debug, Clone)]
pub struct Table {
    name: TableName,
    def: TableDef,
    primary_key: String,
    records: OrderedIndex<Key, Record>,
    indexes: BTreeMap<String, OrderedIndex<Key, Key>>,
    journal: Journal,
    tracked: bool,
    synching: bool,
    /// Created records as they were sent by the synch in flight
    sent_creates: BTreeMap<Key, Record>,
}

impl Table {
    /// Create an empty table whose writes are journaled for synch.
    ///
    /// Fails with [`Error::Schema`] if the definition is invalid.
    pub fn new(name: impl Into<TableName>, def: TableDef) -> Result<Self> {
        let primary_key = def.validate()?.to_string();
        let indexes = def
            .indexed_columns()
            .map(|(column, c)| (column.clone(), OrderedIndex::new(c.unique)))
            .collect();
        Ok(Self {
            name: name.into(),
            def,
            primary_key,
            records: OrderedIndex::new(true),
            indexes,
            journal: Journal::new(),
            tracked: true,
            synching: false,
            sent_creates: BTreeMap::new(),
        })
    }

    /// Create an empty table that does not journal its writes.
    pub fn untracked(name: impl Into<TableName>, def: TableDef) -> Result<Self> {
        let mut table = Self::new(name, def)?;
        table.tracked = false;
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &TableDef {
        &self.def
    }

    /// Name of the primary key column.
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Name of the version column.
    pub fn version_column(&self) -> &str {
        &self.def.version_column
    }

    /// Whether writes are journaled.
    pub fn is_tracked(&self) -> bool {
        self.tracked
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.key_count()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in primary key order.
    pub fn all(&self) -> Vec<&Record> {
        self.records.values()
    }

    /// Look up a single record by primary key.
    pub fn get_by_key(&self, key: &Key) -> Option<&Record> {
        self.records.search(key).first()
    }

    /// Records matching `criteria`.
    ///
    /// A constraint on the primary key fetches by identity. Otherwise the
    /// primary keys found through secondary indexes are intersected, the
    /// first lookup seeding the set. Without any usable index the whole
    /// table is scanned. The full criteria are then applied as a filter.
    /// Results of a range lookup keep ascending key order.
    pub fn get(&self, criteria: &Criteria) -> Vec<&Record> {
        let candidates: Vec<&Record> = match self.plan(criteria) {
            Some(keys) => keys
                .iter()
                .filter_map(|key| self.get_by_key(key))
                .collect(),
            None => self.records.values(),
        };
        candidates
            .into_iter()
            .filter(|record| criteria.matches(record))
            .collect()
    }

    /// Records matching `criteria`, decoded into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, criteria: &Criteria) -> Result<Vec<T>> {
        self.get(criteria)
            .into_iter()
            .map(|record| {
                serde_json::from_value(record.clone().into_value())
                    .map_err(|e| Error::InvalidRecord(e.to_string()))
            })
            .collect()
    }

    /// Primary keys to fetch, or `None` for a full scan.
    fn plan(&self, criteria: &Criteria) -> Option<Vec<Key>> {
        if let Some(pk) = criteria.iter().find(|c| c.field == self.primary_key) {
            return self
                .lookup(&self.records, &pk.constraint, |r| r.key(&self.primary_key))
                .map(dedup);
        }

        // ranges first so that their key order is kept
        let mut indexed: Vec<_> = criteria
            .iter()
            .filter_map(|c| self.indexes.get(&c.field).map(|index| (c, index)))
            .collect();
        indexed.sort_by_key(|(c, _)| !matches!(c.constraint, Constraint::Range(_)));

        let mut result: Option<Vec<Key>> = None;
        for (criterion, index) in indexed {
            let Some(found) = self.lookup(index, &criterion.constraint, |pk| Some(pk.clone()))
            else {
                continue;
            };
            result = Some(match result {
                None => dedup(found),
                Some(seed) => {
                    let found: BTreeSet<Key> = found.into_iter().collect();
                    seed.into_iter().filter(|k| found.contains(k)).collect()
                }
            });
        }
        result
    }

    /// Keys served by `index` for `constraint`, mapped through `to_key`.
    fn lookup<V>(
        &self,
        index: &OrderedIndex<Key, V>,
        constraint: &Constraint,
        to_key: impl Fn(&V) -> Option<Key>,
    ) -> Option<Vec<Key>> {
        let values: Vec<&V> = match constraint {
            Constraint::Range(bounds) => index.range_search(bounds),
            other => other
                .lookup_keys()?
                .iter()
                .flat_map(|key| index.search(key))
                .collect(),
        };
        Some(values.into_iter().filter_map(to_key).collect())
    }

    /// Insert or replace records, one at a time in order.
    ///
    /// On error the failing record is rejected without any index change;
    /// records before it stay applied. Returns the accepted records.
    pub fn set<I>(&mut self, records: I) -> Result<Vec<Record>>
    where
        I: IntoIterator<Item = Record>,
    {
        records
            .into_iter()
            .map(|record| self.set_one(record))
            .collect()
    }

    /// Insert or replace a single record.
    pub fn set_one(&mut self, record: Record) -> Result<Record> {
        let key = self.def.validate_record(&record)?;
        let previous = self.upsert(key.clone(), record.clone())?;
        if self.tracked {
            let persistent = record.is_persistent(&self.def.version_column);
            self.journal.record_set(
                key,
                previous.as_ref(),
                &record,
                persistent,
                self.synching,
            );
        }
        Ok(record)
    }

    /// Insert or replace serializable entities.
    pub fn set_entities<T, I>(&mut self, entities: I) -> Result<Vec<Record>>
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        let mut accepted = Vec::new();
        for entity in entities {
            let value =
                serde_json::to_value(entity).map_err(|e| Error::InvalidRecord(e.to_string()))?;
            accepted.push(self.set_one(Record::try_from(value)?)?);
        }
        Ok(accepted)
    }

    /// Delete records by primary key.
    ///
    /// Deleting an absent identity is not an error. Returns, per key, the
    /// backup record if one is known, else the key itself.
    pub fn del<I>(&mut self, keys: I) -> Result<Vec<Value>>
    where
        I: IntoIterator<Item = Key>,
    {
        keys.into_iter()
            .map(|key| {
                let backup = self.del_one(&key)?;
                Ok(backup.map_or_else(|| key.to_value(), Record::into_value))
            })
            .collect()
    }

    /// Delete the given records, identified by their primary key.
    pub fn del_records<I>(&mut self, records: I) -> Result<Vec<Value>>
    where
        I: IntoIterator<Item = Record>,
    {
        let keys = records
            .into_iter()
            .map(|r| {
                r.key(&self.primary_key)
                    .ok_or_else(|| Error::MissingPrimaryKey(self.primary_key.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        self.del(keys)
    }

    /// Delete a single record, returning the best known backup.
    pub fn del_one(&mut self, key: &Key) -> Result<Option<Record>> {
        let removed = self.remove(key)?;
        if !self.tracked {
            return Ok(removed);
        }
        Ok(self.journal.record_delete(key.clone(), removed))
    }

    // ===== index maintenance =====

    /// Upsert into the primary and secondary indexes, returning the
    /// replaced record. Unique constraints are checked before anything is
    /// touched.
    pub(crate) fn upsert(&mut self, key: Key, record: Record) -> Result<Option<Record>> {
        let previous = self.get_by_key(&key).cloned();

        let mut changes = Vec::new();
        for (column, index) in &self.indexes {
            let new = self.column_key(column, &record)?;
            let old = match &previous {
                Some(p) => self.column_key(column, p)?,
                None => None,
            };
            if new == old {
                continue;
            }
            if let Some(new) = &new {
                if index.is_unique() && index.contains_key(new) {
                    return Err(Error::DuplicateKey {
                        table: self.name.clone(),
                        column: column.clone(),
                        key: new.to_string(),
                    });
                }
            }
            changes.push((column.clone(), old, new));
        }

        let pk = self.primary_key.clone();
        if previous.is_some() {
            self.records
                .update_with(&key, record, |a, b| a.key(&pk) == b.key(&pk))
                .map_err(|e| self.index_error(e, &pk, &key))?;
        } else {
            self.records
                .insert(key.clone(), record)
                .map_err(|e| self.index_error(e, &pk, &key))?;
        }

        for (column, old, new) in changes {
            if let Some(old) = old {
                self.index_mut(&column)?
                    .remove(&old, Some(&key))
                    .map_err(|e| self.index_error(e, &column, &old))?;
            }
            if let Some(new) = new {
                self.index_mut(&column)?
                    .insert(new.clone(), key.clone())
                    .map_err(|e| self.index_error(e, &column, &new))?;
            }
        }
        Ok(previous)
    }

    /// Remove from the primary and secondary indexes, returning the removed
    /// record if it was present.
    pub(crate) fn remove(&mut self, key: &Key) -> Result<Option<Record>> {
        let Some(removed) = self.get_by_key(key).cloned() else {
            return Ok(None);
        };
        let pk = self.primary_key.clone();
        self.records
            .remove(key, None)
            .map_err(|e| self.index_error(e, &pk, key))?;

        let columns: Vec<String> = self.indexes.keys().cloned().collect();
        for column in columns {
            if let Some(value) = self.column_key(&column, &removed)? {
                self.index_mut(&column)?
                    .remove(&value, Some(key))
                    .map_err(|e| self.index_error(e, &column, &value))?;
            }
        }
        Ok(Some(removed))
    }

    fn column_key(&self, column: &str, record: &Record) -> Result<Option<Key>> {
        let value = record.field(column);
        if value.is_null() {
            return Ok(None);
        }
        Key::from_value(value)
            .map(Some)
            .ok_or_else(|| Error::InvalidKey(column.to_string()))
    }

    fn index_mut(&mut self, column: &str) -> Result<&mut OrderedIndex<Key, Key>> {
        self.indexes
            .get_mut(column)
            .ok_or_else(|| Error::Schema(format!("no index on column '{column}'")))
    }

    fn index_error(&self, err: IndexError, column: &str, key: &Key) -> Error {
        match err {
            IndexError::DuplicateKey => Error::DuplicateKey {
                table: self.name.clone(),
                column: column.to_string(),
                key: key.to_string(),
            },
            IndexError::NotFound => Error::NotFound {
                table: self.name.clone(),
                key: key.to_string(),
            },
        }
    }

    /// Rebuild this table under a new definition, keeping every record.
    ///
    /// The journal is kept when the primary key column is unchanged. A
    /// primary key change is refused while unsynched changes exist.
    pub fn rebuild(&self, def: TableDef) -> Result<Table> {
        let mut table = Table::new(self.name.clone(), def)?;
        table.tracked = self.tracked;
        table.synching = self.synching;
        table.sent_creates = self.sent_creates.clone();
        let same_key = table.primary_key == self.primary_key;
        if !same_key && !self.journal.is_synched() {
            return Err(Error::Schema(format!(
                "cannot change primary key of '{}' while it has unsynched changes",
                self.name
            )));
        }
        for record in self.records.values() {
            let key = table.def.validate_record(record)?;
            table.upsert(key, record.clone())?;
        }
        if same_key {
            table.journal = self.journal.clone();
        }
        debug!(table = %self.name, records = table.len(), "rebuilt table");
        Ok(table)
    }

    // ===== journal =====

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub(crate) fn journal_mut(&mut self) -> &mut Journal {
        &mut self.journal
    }

    /// Synch status of a single identity.
    pub fn status(&self, key: &Key) -> &ChangeStatus {
        self.journal.status(key)
    }

    /// Records created locally and not yet persisted.
    pub fn created(&self) -> Vec<&Record> {
        self.journal
            .created()
            .filter_map(|key| self.get_by_key(key))
            .collect()
    }

    /// Pre-edit snapshots of locally updated records.
    pub fn updated(&self) -> Vec<&Record> {
        self.journal.updated().collect()
    }

    /// Locally deleted records, as snapshots or bare identities.
    pub fn deleted(&self) -> Vec<Value> {
        self.journal.deleted().collect()
    }

    /// Edits made while the previous edit was being reconciled.
    pub fn future(&self) -> Vec<&Record> {
        self.journal.future().collect()
    }

    /// Server records that diverged from a local edit.
    pub fn stale(&self) -> Vec<&Record> {
        self.journal.stale().collect()
    }

    /// Server records for changes the server rejected.
    pub fn failed(&self) -> Vec<&Record> {
        self.journal.failed().collect()
    }

    /// Whether no local change is waiting to be synched.
    pub fn synched(&self) -> bool {
        self.journal.is_synched()
    }

    /// Clear a `Stale` or `Failed` status after the caller has handled it.
    /// Returns whether anything was cleared.
    pub fn resolve(&mut self, key: &Key) -> bool {
        match self.journal.status(key) {
            ChangeStatus::Stale(_) | ChangeStatus::Failed(_) => {
                self.journal.take(key);
                true
            }
            _ => false,
        }
    }

    /// Mark the start of a synch. Persisted records edited again from now
    /// on get a future edit, and the created records about to be sent are
    /// remembered so that local writes made to them meanwhile survive the
    /// server's confirmation.
    pub fn begin_synch(&mut self) {
        let sent = self
            .journal
            .created()
            .filter_map(|key| Some((key.clone(), self.get_by_key(key)?.clone())))
            .collect();
        self.sent_creates = sent;
        self.synching = true;
    }

    /// Mark the end of a synch, successful or not.
    pub fn finish_synch(&mut self) {
        self.synching = false;
        self.sent_creates.clear();
    }

    /// Take the copy of a created record sent by the synch in flight.
    pub(crate) fn take_sent_create(&mut self, key: &Key) -> Option<Record> {
        self.sent_creates.remove(key)
    }

    pub fn is_synching(&self) -> bool {
        self.synching
    }
}

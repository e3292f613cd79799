//! A named collection of tables with a synch coordinator.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use stash_engine::{
    ColumnDef, Criteria, Key, ReconcileReport, Record, SynchChanges, Table, TableDef,
};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::coordinator::{SynchCoordinator, SynchOutcome};
use crate::error::{Error, Result};
use crate::observer::{NoopObserver, SynchObserver};
use crate::transport::{HttpTransport, SynchRequest, SynchResponse, Transport};

/// Metadata of one column of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub table: String,
    pub name: String,
    #[serde(flatten)]
    pub def: ColumnDef,
}

/// Builder for a [`Database`].
pub struct DatabaseBuilder {
    name: String,
    config: DatabaseConfig,
    transport: Option<Arc<dyn Transport>>,
    observer: Arc<dyn SynchObserver>,
}

impl DatabaseBuilder {
    pub fn config(mut self, config: DatabaseConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this transport instead of HTTP.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SynchObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> Result<Arc<Database>> {
        let coordinator = if self.config.synch_enabled {
            let transport: Arc<dyn Transport> = match self.transport {
                Some(transport) => transport,
                None => Arc::new(HttpTransport::from_config(&self.config)?),
            };
            Some(SynchCoordinator::new(
                self.name.clone(),
                self.config.clone(),
                transport,
                self.observer,
            ))
        } else {
            None
        };

        info!(
            database = %self.name,
            synch = self.config.synch_enabled,
            "opened database"
        );

        Ok(Arc::new(Database {
            name: self.name,
            config: self.config,
            tables: RwLock::new(BTreeMap::new()),
            coordinator,
        }))
    }
}

/// An in-memory database.
///
/// Shared through `Arc`; every method takes `&self`. Table access is guarded
/// by one lock, so each `get`/`set`/`del` is atomic with respect to the
/// others and to the application of a synch response.
pub struct Database {
    name: String,
    config: DatabaseConfig,
    tables: RwLock<BTreeMap<String, Table>>,
    coordinator: Option<SynchCoordinator>,
}

impl Database {
    pub fn builder(name: impl Into<String>) -> DatabaseBuilder {
        DatabaseBuilder {
            name: name.into(),
            config: DatabaseConfig::default(),
            transport: None,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Open a database with the HTTP transport.
    pub fn new(name: impl Into<String>, config: DatabaseConfig) -> Result<Arc<Self>> {
        Self::builder(name).config(config).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Table>> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Table>> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ===== schema =====

    /// Create a table. Its writes are journaled when synch is enabled.
    pub fn create_table(&self, name: impl Into<String>, def: TableDef) -> Result<()> {
        let name = name.into();
        let mut tables = self.write();
        if tables.contains_key(&name) {
            return Err(Error::TableExists(name));
        }

        let table = if self.config.synch_enabled {
            Table::new(name.clone(), def)?
        } else {
            Table::untracked(name.clone(), def)?
        };
        debug!(database = %self.name, table = %name, "created table");
        tables.insert(name, table);
        Ok(())
    }

    /// Replace a table's definition, rebuilding its indexes from the
    /// current records.
    pub fn alter_table(&self, name: &str, def: TableDef) -> Result<()> {
        let mut tables = self.write();
        let table = tables
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
        let rebuilt = table.rebuild(def)?;
        tables.insert(name.to_string(), rebuilt);
        debug!(database = %self.name, table = %name, "altered table");
        Ok(())
    }

    /// Drop a table. Returns whether it existed.
    pub fn drop_table(&self, name: &str) -> bool {
        let dropped = self.write().remove(name).is_some();
        if dropped {
            debug!(database = %self.name, table = %name, "dropped table");
        } else {
            warn!(database = %self.name, table = %name, "ignoring drop of unknown table");
        }
        dropped
    }

    pub fn table_names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Column metadata of every table, ordered by table then column.
    pub fn columns(&self) -> Vec<ColumnInfo> {
        self.read()
            .iter()
            .flat_map(|(table, t)| {
                t.definition()
                    .columns
                    .iter()
                    .map(move |(name, def)| ColumnInfo {
                        table: table.clone(),
                        name: name.clone(),
                        def: def.clone(),
                    })
            })
            .collect()
    }

    // ===== records =====

    /// Run `f` against a table.
    pub fn with_table<R>(&self, name: &str, f: impl FnOnce(&Table) -> R) -> Result<R> {
        let tables = self.read();
        let table = tables
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
        Ok(f(table))
    }

    /// Run `f` against a table with write access.
    pub fn with_table_mut<R>(&self, name: &str, f: impl FnOnce(&mut Table) -> R) -> Result<R> {
        let mut tables = self.write();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
        Ok(f(table))
    }

    pub fn get(&self, table: &str, criteria: &Criteria) -> Result<Vec<Record>> {
        self.with_table(table, |t| t.get(criteria).into_iter().cloned().collect())
    }

    pub fn get_as<T: DeserializeOwned>(&self, table: &str, criteria: &Criteria) -> Result<Vec<T>> {
        Ok(self.with_table(table, |t| t.get_as(criteria))??)
    }

    pub fn set<I>(&self, table: &str, records: I) -> Result<Vec<Record>>
    where
        I: IntoIterator<Item = Record>,
    {
        Ok(self.with_table_mut(table, |t| t.set(records))??)
    }

    pub fn set_entities<T, I>(&self, table: &str, entities: I) -> Result<Vec<Record>>
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        Ok(self.with_table_mut(table, |t| t.set_entities(entities))??)
    }

    pub fn del<I>(&self, table: &str, keys: I) -> Result<Vec<Value>>
    where
        I: IntoIterator<Item = Key>,
    {
        Ok(self.with_table_mut(table, |t| t.del(keys))??)
    }

    // ===== synch =====

    pub(crate) fn coordinator(&self) -> Result<&SynchCoordinator> {
        self.coordinator
            .as_ref()
            .ok_or_else(|| Error::SynchDisabled(self.name.clone()))
    }

    /// Synch every table with the server.
    ///
    /// Joins the synch in flight if there is one. Unless `force` is set, a
    /// database that is synched and up to date is left alone.
    pub async fn synch(self: &Arc<Self>, force: bool) -> Result<SynchOutcome> {
        let pending = self.coordinator()?.synch(self, force);
        pending.await
    }

    pub fn synching(&self) -> bool {
        self.coordinator
            .as_ref()
            .is_some_and(SynchCoordinator::is_synching)
    }

    pub fn last_synched_at(&self) -> Option<DateTime<Utc>> {
        self.coordinator
            .as_ref()
            .and_then(SynchCoordinator::last_synched_at)
    }

    pub fn last_error(&self) -> Option<Error> {
        self.coordinator
            .as_ref()
            .and_then(SynchCoordinator::last_error)
    }

    /// Whether the database synched at least once and has no pending change.
    pub fn synched(&self) -> bool {
        self.last_synched_at().is_some() && self.read().values().all(Table::synched)
    }

    /// Whether the last synch is within the poll interval.
    pub fn up_to_date(&self) -> bool {
        match self.last_synched_at() {
            Some(at) => match chrono::Duration::from_std(self.config.poll()) {
                Ok(poll) => Utc::now() < at + poll,
                Err(_) => true,
            },
            None => false,
        }
    }

    /// Mark every table in flight and collect the aggregate request.
    pub(crate) fn begin_synch(&self, last_synched: Option<DateTime<Utc>>) -> SynchRequest {
        let mut tables = self.write();
        let mut request = SynchRequest {
            last_synched,
            tables: BTreeMap::new(),
        };
        for (name, table) in tables.iter_mut() {
            table.begin_synch();
            request
                .tables
                .insert(name.clone(), table.create_synch_request());
        }
        request
    }

    pub(crate) fn finish_synch(&self) {
        for table in self.write().values_mut() {
            table.finish_synch();
        }
    }

    /// Apply a synch response to every table, or to none, and end the
    /// synch.
    ///
    /// Every table response is decoded first; the changes are then applied
    /// to copies of the tables, which replace the originals only when all of
    /// them applied cleanly. The in-flight marks are cleared under the same
    /// lock as the commit, whatever the outcome.
    pub(crate) fn apply_synch_response(
        &self,
        response: SynchResponse,
    ) -> Result<BTreeMap<String, ReconcileReport>> {
        let decoded = response
            .into_iter()
            .map(|(name, table_response)| -> Result<(String, SynchChanges)> {
                Ok((name, table_response.decode()?))
            })
            .collect::<Result<Vec<_>>>();
        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                self.finish_synch();
                return Err(err);
            }
        };

        let mut tables = self.write();
        let staged = decoded
            .into_iter()
            .filter_map(|(name, changes)| {
                let Some(table) = tables.get(&name) else {
                    debug!(database = %self.name, table = %name, "ignoring response for unknown table");
                    return None;
                };
                let mut table = table.clone();
                Some(
                    table
                        .apply_synch_changes(changes)
                        .map(|report| (name, table, report))
                        .map_err(Error::from),
                )
            })
            .collect::<Result<Vec<_>>>();

        let result = staged.map(|staged| {
            let mut reports = BTreeMap::new();
            for (name, table, report) in staged {
                tables.insert(name.clone(), table);
                reports.insert(name, report);
            }
            reports
        });
        for table in tables.values_mut() {
            table.finish_synch();
        }
        result
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("tables", &self.table_names())
            .field("synch_enabled", &self.config.synch_enabled)
            .finish()
    }
}

//! Named databases.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::database::{Database, DatabaseBuilder};
use crate::error::Result;

/// Get-or-create map from database name to database.
///
/// Owned by the application and shared through `Arc`.
#[derive(Debug, Default)]
pub struct Registry {
    databases: DashMap<String, Arc<Database>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            databases: DashMap::new(),
        }
    }

    /// Create a new registry wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Return the database named `name`, opening it with `config` if it is
    /// not registered yet. The config of an already open database is kept.
    pub fn open(&self, name: &str, config: DatabaseConfig) -> Result<Arc<Database>> {
        self.open_with(name, |builder| builder.config(config))
    }

    /// Like [`Registry::open`], configuring a new database through its builder.
    pub fn open_with<F>(&self, name: &str, configure: F) -> Result<Arc<Database>>
    where
        F: FnOnce(DatabaseBuilder) -> DatabaseBuilder,
    {
        match self.databases.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let db = configure(Database::builder(name)).build()?;
                entry.insert(Arc::clone(&db));
                debug!(database = %name, "registered database");
                Ok(db)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Unregister a database. It stays alive while other handles exist.
    pub fn remove(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.remove(name).map(|(_, db)| db)
    }

    /// Names of every registered database, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .databases
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }
}

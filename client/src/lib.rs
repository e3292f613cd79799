//! # Stash Client
//!
//! Async databases of [`stash_engine`] tables, synched with a server.
//!
//! A [`Database`] owns a set of named tables. When synch is enabled every
//! local write is journaled, and [`Database::synch`] sends the journal of
//! every table in one request, then applies the server's answer to all
//! tables or to none. Concurrent synchs share a single request; transient
//! server errors are retried.
//!
//! ```rust,no_run
//! use stash_client::{Database, DatabaseConfig};
//! use stash_engine::{ColumnDef, Criteria, FieldType, Record, TableDef};
//!
//! # async fn run() -> stash_client::Result<()> {
//! let config = DatabaseConfig::default()
//!     .with_synch_enabled(true)
//!     .with_synch_url("http://localhost:3000/api/webdb/synch");
//! let db = Database::new("western", config)?;
//!
//! db.create_table(
//!     "cowboys",
//!     TableDef::default()
//!         .column("version", ColumnDef::new(FieldType::Int))
//!         .column("lastName", ColumnDef::new(FieldType::String).indexed()),
//! )?;
//! db.set("cowboys", [Record::new().with("id", 1).with("lastName", "Dalton")])?;
//!
//! let outcome = db.synch(false).await?;
//! println!("changed: {}", outcome.changed);
//!
//! let daltons = db.get("cowboys", &Criteria::new().equals("lastName", "Dalton"))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod database;
pub mod error;
pub mod observer;
pub mod registry;
pub mod transport;

pub use config::{ConfigError, DatabaseConfig};
pub use coordinator::{PendingSynch, SynchCoordinator, SynchOutcome};
pub use database::{ColumnInfo, Database, DatabaseBuilder};
pub use error::{Error, Result, TransportError};
pub use observer::{NoopObserver, SynchObserver};
pub use registry::Registry;
pub use transport::{HttpTransport, SynchRequest, SynchResponse, Transport};

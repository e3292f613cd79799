//! # Stash Engine
//!
//! In-memory indexed tables with a change journal for offline-first synch.
//!
//! This crate holds the pure logic of a stash database: ordered indexes,
//! tables with secondary indexes, the per-record change journal and the
//! reconciliation of server synch responses. It performs no IO; the async
//! coordination and the transport live in `stash-client`.
//!
//! ## Core Concepts
//!
//! ### Ordered index
//!
//! [`OrderedIndex`] is an AVL tree mapping keys to buckets of values, in
//! unique or duplicate-key mode, with exact and range lookups.
//!
//! ### Tables
//!
//! A [`Table`] stores [`Record`]s under their primary [`Key`] and keeps a
//! secondary index for every indexed, unique or foreign key column declared
//! in its [`TableDef`]. Queries are expressed as [`Criteria`].
//!
//! ### Change journal
//!
//! Every local write moves the record's identity through a [`ChangeStatus`]:
//! created, updated (with the first pre-edit snapshot), deleted, or
//! reconciling with a newer edit made while a synch was in flight. Server
//! responses move identities back to clean, or to stale or failed.
//!
//! ## Quick Start
//!
//! ```rust
//! use stash_engine::{Bounds, ColumnDef, Criteria, FieldType, Key, Record, Table, TableDef};
//!
//! let def = TableDef::default()
//!     .column("lastName", ColumnDef::new(FieldType::String).indexed())
//!     .column("size", ColumnDef::new(FieldType::Int).indexed());
//! let mut cowboys = Table::new("cowboys", def).unwrap();
//!
//! cowboys
//!     .set(vec![
//!         Record::new().with("id", 1).with("lastName", "Dalton").with("size", 160),
//!         Record::new().with("id", 2).with("lastName", "Luke").with("size", 190),
//!     ])
//!     .unwrap();
//!
//! let daltons = cowboys.get(&Criteria::new().equals("lastName", "Dalton"));
//! assert_eq!(daltons.len(), 1);
//!
//! let tall = cowboys.get(&Criteria::new().range("size", Bounds::new().gte(170)));
//! assert_eq!(tall[0].key("id"), Some(Key::Int(2)));
//!
//! // both records are new and waiting to be synched
//! assert_eq!(cowboys.create_synch_request().created.len(), 2);
//! ```

pub mod criteria;
pub mod error;
pub mod index;
pub mod journal;
pub mod key;
pub mod reconcile;
pub mod record;
pub mod schema;
pub mod synch;
pub mod table;

// Re-export main types at crate root
pub use criteria::{Constraint, Criteria, Criterion};
pub use error::Error;
pub use index::{Bounds, IndexError, OrderedIndex};
pub use journal::{ChangeStatus, Journal};
pub use key::Key;
pub use reconcile::ReconcileReport;
pub use record::Record;
pub use schema::{ColumnDef, FieldType, TableDef};
pub use synch::{Row, SynchChanges, TableSynchRequest, TableSynchResponse};
pub use table::Table;

/// Type aliases for clarity
pub type TableName = String;
pub type ColumnName = String;

//! Synch lifecycle notifications.

use crate::error::Error;

/// Receives synch lifecycle events of a database.
///
/// Every method has an empty default, so implementors only override what
/// they care about. Callbacks run on the synch task and must not block.
pub trait SynchObserver: Send + Sync {
    /// A synch request is about to be sent.
    fn synch_started(&self, _database: &str) {}

    /// A synch completed and its response was applied.
    fn synch_succeeded(&self, _database: &str, _changed: bool) {}

    /// A synch failed; local tables were left as they were.
    fn synch_failed(&self, _database: &str, _error: &Error) {}

    /// A synch changed the visible records of these tables.
    fn changed(&self, _database: &str, _tables: &[String]) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SynchObserver for NoopObserver {}

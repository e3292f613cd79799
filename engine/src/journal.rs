//! Per-identity change journal.
//!
//! Every identity is in exactly one [`ChangeStatus`]. Clean identities are not
//! stored. The transitions below are driven by local writes
//! ([`Journal::record_set`], [`Journal::record_delete`]) and by server
//! confirmations (see [`crate::reconcile`]).

use crate::{Key, Record};
use serde_json::Value;
use std::collections::BTreeMap;

/// The synch status of one record identity.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeStatus {
    /// No unreconciled local change
    Clean,
    /// Created locally, never persisted remotely
    Created,
    /// Edited after persistence; holds the first pre-edit state
    Updated { snapshot: Record },
    /// Deleted after persistence; holds the pre-delete state if known
    Deleted { snapshot: Option<Record> },
    /// Edited again while the first edit was being reconciled. `future` wins
    /// over whatever the server answers for `snapshot`.
    Reconciling { snapshot: Record, future: Record },
    /// The server copy diverged; holds the server's record
    Stale(Record),
    /// The server rejected the change; holds the server's record
    Failed(Record),
}

static CLEAN: ChangeStatus = ChangeStatus::Clean;

impl ChangeStatus {
    /// Whether the status holds a change that still has to be sent.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ChangeStatus::Created
                | ChangeStatus::Updated { .. }
                | ChangeStatus::Deleted { .. }
                | ChangeStatus::Reconciling { .. }
        )
    }
}

/// Change journal of a single table.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: BTreeMap<Key, ChangeStatus>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status of `key`; [`ChangeStatus::Clean`] when nothing is recorded.
    pub fn status(&self, key: &Key) -> &ChangeStatus {
        self.entries.get(key).unwrap_or(&CLEAN)
    }

    /// Journal a local write of `record`.
    ///
    /// `previous` is the record it replaced, if any. `persistent` tells
    /// whether the record carries a version stamp and `in_flight` whether a
    /// synch is currently outstanding.
    pub fn record_set(
        &mut self,
        key: Key,
        previous: Option<&Record>,
        record: &Record,
        persistent: bool,
        in_flight: bool,
    ) {
        let current = self.entries.remove(&key).unwrap_or(ChangeStatus::Clean);
        let next = if !persistent {
            ChangeStatus::Created
        } else {
            let snapshot_or = |snapshot: Option<Record>| {
                snapshot
                    .or_else(|| previous.cloned())
                    .unwrap_or_else(|| record.clone())
            };
            match current {
                ChangeStatus::Updated { snapshot } if in_flight => ChangeStatus::Reconciling {
                    snapshot,
                    future: record.clone(),
                },
                ChangeStatus::Updated { snapshot } => ChangeStatus::Updated { snapshot },
                ChangeStatus::Reconciling { snapshot, .. } => ChangeStatus::Reconciling {
                    snapshot,
                    future: record.clone(),
                },
                ChangeStatus::Deleted { snapshot } => ChangeStatus::Updated {
                    snapshot: snapshot_or(snapshot),
                },
                ChangeStatus::Clean
                | ChangeStatus::Created
                | ChangeStatus::Stale(_)
                | ChangeStatus::Failed(_) => ChangeStatus::Updated {
                    snapshot: snapshot_or(None),
                },
            }
        };
        self.entries.insert(key, next);
    }

    /// Journal a local delete. `removed` is the record taken out of the
    /// table, if it was present. Returns the best known backup, preferring
    /// the earliest snapshot.
    pub fn record_delete(&mut self, key: Key, removed: Option<Record>) -> Option<Record> {
        match self.entries.remove(&key).unwrap_or(ChangeStatus::Clean) {
            // never persisted, nothing to tell the server
            ChangeStatus::Created => removed,
            ChangeStatus::Updated { snapshot } | ChangeStatus::Reconciling { snapshot, .. } => {
                self.entries.insert(
                    key,
                    ChangeStatus::Deleted {
                        snapshot: Some(snapshot.clone()),
                    },
                );
                Some(snapshot)
            }
            ChangeStatus::Deleted { snapshot } => {
                let backup = removed.or_else(|| snapshot.clone());
                self.entries.insert(key, ChangeStatus::Deleted { snapshot });
                backup
            }
            ChangeStatus::Clean | ChangeStatus::Stale(_) | ChangeStatus::Failed(_) => {
                self.entries.insert(
                    key,
                    ChangeStatus::Deleted {
                        snapshot: removed.clone(),
                    },
                );
                removed
            }
        }
    }

    /// Replace the status of `key`. Setting [`ChangeStatus::Clean`] removes
    /// the entry.
    pub fn set_status(&mut self, key: Key, status: ChangeStatus) {
        match status {
            ChangeStatus::Clean => {
                self.entries.remove(&key);
            }
            status => {
                self.entries.insert(key, status);
            }
        }
    }

    /// Remove and return the status of `key`.
    pub fn take(&mut self, key: &Key) -> ChangeStatus {
        self.entries.remove(key).unwrap_or(ChangeStatus::Clean)
    }

    /// Iterate over all non-clean entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &ChangeStatus)> {
        self.entries.iter()
    }

    /// Identities with status `Created`.
    pub fn created(&self) -> impl Iterator<Item = &Key> {
        self.entries
            .iter()
            .filter(|(_, s)| matches!(s, ChangeStatus::Created))
            .map(|(k, _)| k)
    }

    /// Pre-edit snapshots of updated records, including those with a
    /// pending future edit.
    pub fn updated(&self) -> impl Iterator<Item = &Record> {
        self.entries.values().filter_map(|s| match s {
            ChangeStatus::Updated { snapshot } | ChangeStatus::Reconciling { snapshot, .. } => {
                Some(snapshot)
            }
            _ => None,
        })
    }

    /// Deleted records as snapshots, or bare identities when no snapshot is
    /// known.
    pub fn deleted(&self) -> impl Iterator<Item = Value> + '_ {
        self.entries.iter().filter_map(|(key, s)| match s {
            ChangeStatus::Deleted { snapshot } => Some(
                snapshot
                    .as_ref()
                    .map_or_else(|| key.to_value(), |r| r.clone().into_value()),
            ),
            _ => None,
        })
    }

    pub fn future(&self) -> impl Iterator<Item = &Record> {
        self.entries.values().filter_map(|s| match s {
            ChangeStatus::Reconciling { future, .. } => Some(future),
            _ => None,
        })
    }

    pub fn stale(&self) -> impl Iterator<Item = &Record> {
        self.entries.values().filter_map(|s| match s {
            ChangeStatus::Stale(record) => Some(record),
            _ => None,
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = &Record> {
        self.entries.values().filter_map(|s| match s {
            ChangeStatus::Failed(record) => Some(record),
            _ => None,
        })
    }

    /// Whether no change is waiting to be sent.
    pub fn is_synched(&self) -> bool {
        !self.entries.values().any(ChangeStatus::is_pending)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

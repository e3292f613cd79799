//! Applying a server synch response to a table.
//!
//! # Algorithm
//!
//! Entries are applied in a fixed order:
//!
//! 1. `created` confirmations are upserted and leave `Created`. A record
//!    edited locally after its create was sent is merged over the server
//!    record and journaled as updated; one deleted meanwhile stays deleted
//!    and is journaled for deletion on the server
//! 2. `updated` confirmations are upserted; a pending future edit is merged
//!    over the server record (all fields but the version) and stays journaled
//! 3. `deletedIds` are removed from the table and the journal
//! 4. `purged` entries are only logged
//! 5. `stale` records replace the identity's journal entry with `Stale`
//! 6. `failed` records replace the identity's journal entry with `Failed`
//!
//! Stale and failed records are not written to the table; the local state is
//! kept until the caller resolves the conflict.

use crate::{
    error::Result, synch::SynchChanges, ChangeStatus, Error, Key, Record, Table,
    TableSynchResponse,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Summary of an applied synch response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Whether any visible record changed
    pub changed: bool,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub purged: usize,
    pub stale: usize,
    pub failed: usize,
}

impl Table {
    /// Decode and apply a synch response. Returns whether any visible
    /// record changed.
    pub fn process_synch_response(&mut self, response: &TableSynchResponse) -> Result<bool> {
        let changes = response.decode()?;
        Ok(self.apply_synch_changes(changes)?.changed)
    }

    /// Apply decoded synch changes.
    ///
    /// On error the table may be partially updated; callers that need
    /// all-or-nothing semantics apply to a clone.
    pub fn apply_synch_changes(&mut self, changes: SynchChanges) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for record in changes.created {
            let key = self.definition().validate_record(&record)?;
            report.changed |= self.confirm_create(key, record)?;
            report.created += 1;
        }
        if report.created > 0 {
            debug!(table = %self.name(), count = report.created, "processed created records");
        }

        for record in changes.updated {
            let key = self.definition().validate_record(&record)?;
            report.changed |= self.confirm_update(key, record)?;
            report.updated += 1;
        }
        if report.updated > 0 {
            debug!(table = %self.name(), count = report.updated, "processed updated records");
        }

        for key in changes.deleted {
            report.changed |= self.remove(&key)?.is_some();
            self.journal_mut().take(&key);
            report.deleted += 1;
        }
        if report.deleted > 0 {
            debug!(table = %self.name(), count = report.deleted, "processed deleted records");
        }

        report.purged = changes.purged.len();
        if report.purged > 0 {
            debug!(table = %self.name(), count = report.purged, "ignoring purged records");
        }

        for record in changes.stale {
            let key = self.response_key(&record)?;
            self.journal_mut().set_status(key, ChangeStatus::Stale(record));
            report.stale += 1;
        }
        if report.stale > 0 {
            debug!(table = %self.name(), count = report.stale, "processed stale records");
        }

        for record in changes.failed {
            let key = self.response_key(&record)?;
            self.journal_mut().set_status(key, ChangeStatus::Failed(record));
            report.failed += 1;
        }
        if report.failed > 0 {
            debug!(table = %self.name(), count = report.failed, "processed failed records");
        }

        Ok(report)
    }

    fn confirm_create(&mut self, key: Key, record: Record) -> Result<bool> {
        let sent = self.take_sent_create(&key);
        match (sent, self.get_by_key(&key).cloned()) {
            (Some(_), None) => {
                if matches!(self.status(&key), ChangeStatus::Clean) {
                    self.journal_mut().set_status(
                        key,
                        ChangeStatus::Deleted {
                            snapshot: Some(record),
                        },
                    );
                }
                Ok(false)
            }
            (Some(sent), Some(local)) if local != sent => {
                let merged = record.merged_except(&local, self.version_column());
                self.definition().validate_record(&merged)?;
                self.journal_mut()
                    .set_status(key.clone(), ChangeStatus::Updated { snapshot: record });
                self.confirm(key, merged)
            }
            _ => {
                let changed = self.confirm(key.clone(), record)?;
                if matches!(self.status(&key), ChangeStatus::Created) {
                    self.journal_mut().take(&key);
                }
                Ok(changed)
            }
        }
    }

    fn confirm_update(&mut self, key: Key, record: Record) -> Result<bool> {
        match self.journal_mut().take(&key) {
            ChangeStatus::Reconciling { future, .. } => {
                let merged = record.merged_except(&future, self.version_column());
                self.definition().validate_record(&merged)?;
                self.journal_mut()
                    .set_status(key.clone(), ChangeStatus::Updated { snapshot: record });
                self.confirm(key, merged)
            }
            ChangeStatus::Updated { .. } => self.confirm(key, record),
            // a local delete is still waiting to be sent
            deleted @ ChangeStatus::Deleted { .. } => {
                self.journal_mut().set_status(key, deleted);
                Ok(false)
            }
            other => {
                self.journal_mut().set_status(key.clone(), other);
                self.confirm(key, record)
            }
        }
    }

    /// Upsert a server record, returning whether the visible state changed.
    fn confirm(&mut self, key: Key, record: Record) -> Result<bool> {
        let changed = self.get_by_key(&key) != Some(&record);
        self.upsert(key, record)?;
        Ok(changed)
    }

    fn response_key(&self, record: &Record) -> Result<Key> {
        record.key(self.primary_key()).ok_or_else(|| {
            Error::InvalidResponse(format!(
                "record without primary key '{}' in response for '{}'",
                self.primary_key(),
                self.name()
            ))
        })
    }
}

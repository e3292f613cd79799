//! Synch coordination.
//!
//! A database has at most one synch in flight. The attempt runs on its own
//! tokio task; callers await a [`Shared`] handle to it, so a `synch()` issued
//! while another is pending joins that attempt instead of sending a second
//! request. Failed attempts with a whitelisted status are retried after a
//! fixed delay until the retry budget is spent.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use stash_engine::ReconcileReport;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::DatabaseConfig;
use crate::database::Database;
use crate::error::{Error, Result, TransportError};
use crate::observer::SynchObserver;
use crate::transport::{SynchRequest, SynchResponse, Transport};

/// Handle on a synch attempt, shared by every caller that joined it.
pub type PendingSynch = Shared<BoxFuture<'static, Result<SynchOutcome>>>;

/// Result of a synch attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynchOutcome {
    /// No request was sent because the database was synched and up to date
    pub skipped: bool,
    /// Whether any visible record changed
    pub changed: bool,
    /// What the response did to each table
    pub tables: BTreeMap<String, ReconcileReport>,
}

impl SynchOutcome {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    /// Names of the tables whose visible records changed.
    pub fn changed_tables(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|(_, report)| report.changed)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[derive(Default)]
struct SynchState {
    pending: Option<PendingSynch>,
    last_synched_at: Option<DateTime<Utc>>,
    last_error: Option<Error>,
    auto: Option<JoinHandle<()>>,
}

/// Runs the synchs of one database.
pub struct SynchCoordinator {
    database: String,
    config: DatabaseConfig,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn SynchObserver>,
    state: Mutex<SynchState>,
}

impl SynchCoordinator {
    pub(crate) fn new(
        database: impl Into<String>,
        config: DatabaseConfig,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn SynchObserver>,
    ) -> Self {
        Self {
            database: database.into(),
            config,
            transport,
            observer,
            state: Mutex::new(SynchState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SynchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a synch is in flight.
    pub fn is_synching(&self) -> bool {
        self.state().pending.is_some()
    }

    /// Time of the last successful synch.
    pub fn last_synched_at(&self) -> Option<DateTime<Utc>> {
        self.state().last_synched_at
    }

    /// Error of the last synch, cleared when the next one starts.
    pub fn last_error(&self) -> Option<Error> {
        self.state().last_error.clone()
    }

    /// Whether the automatic synch timer has been armed.
    pub fn is_auto_synching(&self) -> bool {
        self.state().auto.is_some()
    }

    /// Join the synch in flight, or start a new one.
    pub(crate) fn synch(&self, db: &Arc<Database>, force: bool) -> PendingSynch {
        let mut state = self.state();
        if let Some(pending) = &state.pending {
            debug!(database = %self.database, "joining synch in flight");
            return pending.clone();
        }

        if state.auto.is_none() && self.config.auto_synch {
            let every = self.config.throttle();
            if every.is_zero() {
                warn!(database = %self.database, "auto synch needs a non-zero throttle interval");
            } else {
                state.auto = Some(spawn_auto_synch(Arc::downgrade(db), every));
            }
        }

        state.last_error = None;
        let task = tokio::spawn(run_synch(Arc::clone(db), force));
        let pending = async move { task.await.unwrap_or_else(|_| Err(Error::Aborted)) }
            .boxed()
            .shared();
        // the task clears this slot when it settles; it cannot do so before
        // the slot is filled because it needs the same lock
        state.pending = Some(pending.clone());
        pending
    }

    async fn run(&self, db: &Database, force: bool) -> Result<SynchOutcome> {
        let result = self.attempt(db, force).await;

        {
            let mut state = self.state();
            state.pending = None;
            match &result {
                Ok(outcome) if outcome.skipped => {}
                Ok(_) => state.last_synched_at = Some(Utc::now()),
                Err(err) => state.last_error = Some(err.clone()),
            }
        }

        match &result {
            Ok(outcome) if outcome.skipped => {}
            Ok(outcome) => {
                info!(database = %self.database, changed = outcome.changed, "synch succeeded");
                if outcome.changed {
                    self.observer
                        .changed(&self.database, &outcome.changed_tables());
                }
                self.observer
                    .synch_succeeded(&self.database, outcome.changed);
            }
            Err(err) => {
                warn!(database = %self.database, error = %err, "synch failed");
                self.observer.synch_failed(&self.database, err);
            }
        }
        result
    }

    async fn attempt(&self, db: &Database, force: bool) -> Result<SynchOutcome> {
        if !force && db.synched() && db.up_to_date() {
            debug!(database = %self.database, "synched and up to date, skipping synch");
            return Ok(SynchOutcome::skipped());
        }

        info!(database = %self.database, "synching");
        self.observer.synch_started(&self.database);

        let request = db.begin_synch(self.last_synched_at());
        let result = match self.send(&request).await {
            Ok(response) => db.apply_synch_response(response),
            Err(err) => {
                db.finish_synch();
                Err(Error::Transport(err))
            }
        };

        let tables = result?;
        Ok(SynchOutcome {
            skipped: false,
            changed: tables.values().any(|report| report.changed),
            tables,
        })
    }

    async fn send(&self, request: &SynchRequest) -> std::result::Result<SynchResponse, TransportError> {
        let mut retries = self.config.retry_count;
        let mut attempt = 1u32;
        loop {
            let result = tokio::time::timeout(self.config.timeout(), self.transport.send(request))
                .await
                .unwrap_or(Err(TransportError::Timeout));

            match result {
                Ok(response) => {
                    debug!(database = %self.database, attempt, tables = response.len(), "received synch response");
                    return Ok(response);
                }
                Err(TransportError::Status(status))
                    if retries > 0 && self.config.is_retryable(status) =>
                {
                    warn!(database = %self.database, attempt, status, "synch attempt failed, retrying");
                    retries -= 1;
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_wait()).await;
                }
                Err(err) => {
                    error!(database = %self.database, attempt, error = %err, "unable to synch with remote server");
                    return Err(err);
                }
            }
        }
    }
}

impl Drop for SynchCoordinator {
    fn drop(&mut self) {
        if let Some(auto) = self.state().auto.take() {
            auto.abort();
        }
    }
}

async fn run_synch(db: Arc<Database>, force: bool) -> Result<SynchOutcome> {
    db.coordinator()?.run(&db, force).await
}

/// Synch the database every `every` until it is dropped.
fn spawn_auto_synch(db: Weak<Database>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(interval = ?every, "auto synch started");

        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let Some(db) = db.upgrade() else {
                break;
            };
            // failures are logged and recorded by the attempt itself
            let _ = db.synch(false).await;
        }

        debug!("auto synch stopped");
    })
}

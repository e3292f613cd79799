//! Synch coordination tests against a scripted in-memory transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use stash_client::{
    Database, DatabaseConfig, Error, SynchObserver, SynchRequest, SynchResponse, Transport,
    TransportError,
};
use stash_engine::{
    ChangeStatus, ColumnDef, Criteria, FieldType, Key, Record, TableDef, TableSynchResponse,
};
use tokio::sync::Notify;

// ============================================================================
// Test transport
// ============================================================================

/// Answers requests from a script; an exhausted script answers with an
/// empty response.
#[derive(Default)]
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<SynchResponse, TransportError>>>,
    requests: Mutex<Vec<SynchRequest>>,
    delay: Duration,
    gate: Gate,
}

/// Holds the next request until released, so a test can act while it is in
/// flight.
#[derive(Default)]
struct Gate {
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl ScriptedTransport {
    fn new(script: Vec<Result<SynchResponse, TransportError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn arm(&self) {
        self.gate.armed.store(true, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, n: usize) -> SynchRequest {
        self.requests.lock().unwrap()[n].clone()
    }

    async fn entered(&self) {
        self.gate.entered.notified().await;
    }

    fn release(&self) {
        self.gate.release.notify_one();
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &SynchRequest) -> Result<SynchResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.gate.armed.swap(false, Ordering::SeqCst) {
            self.gate.entered.notify_one();
            self.gate.release.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SynchResponse::new()))
    }
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl SynchObserver for RecordingObserver {
    fn synch_started(&self, _database: &str) {
        self.events.lock().unwrap().push("started".into());
    }

    fn synch_succeeded(&self, _database: &str, changed: bool) {
        self.events
            .lock()
            .unwrap()
            .push(format!("succeeded changed={changed}"));
    }

    fn synch_failed(&self, _database: &str, error: &Error) {
        self.events.lock().unwrap().push(format!("failed {error}"));
    }

    fn changed(&self, _database: &str, tables: &[String]) {
        self.events
            .lock()
            .unwrap()
            .push(format!("changed {}", tables.join(",")));
    }
}

// ============================================================================
// Fixtures
// ============================================================================

const COLUMNS: [&str; 4] = ["id", "version", "name", "size"];

fn config() -> DatabaseConfig {
    DatabaseConfig::default()
        .with_synch_enabled(true)
        .with_auto_synch(false)
        .with_retries(2, Duration::from_millis(5))
}

fn cowboys() -> TableDef {
    TableDef::default()
        .column("version", ColumnDef::new(FieldType::Int))
        .column("name", ColumnDef::new(FieldType::String).unique())
        .column("size", ColumnDef::new(FieldType::Int).indexed())
}

fn open(transport: &Arc<ScriptedTransport>, config: DatabaseConfig) -> Arc<Database> {
    let db = Database::builder("western")
        .config(config)
        .transport(transport.clone())
        .build()
        .unwrap();
    db.create_table("cowboys", cowboys()).unwrap();
    db
}

fn cowboy(id: i64, version: Option<i64>, name: &str, size: i64) -> Record {
    Record::new()
        .with("id", id)
        .with("version", version)
        .with("name", name)
        .with("size", size)
}

fn columns() -> Vec<String> {
    COLUMNS.iter().map(|c| c.to_string()).collect()
}

/// A response for the cowboys table.
fn answer(build: impl FnOnce(&mut TableSynchResponse)) -> Result<SynchResponse, TransportError> {
    let mut response = TableSynchResponse {
        columns: columns(),
        ..Default::default()
    };
    build(&mut response);
    Ok(SynchResponse::from([("cowboys".to_string(), response)]))
}

fn rows(records: &[Record]) -> Vec<Vec<serde_json::Value>> {
    TableSynchResponse::encode_rows(&columns(), records.iter())
}

/// Open a database whose cowboys table holds persisted Joe and Jack.
async fn seeded(
    mut script: Vec<Result<SynchResponse, TransportError>>,
) -> (Arc<ScriptedTransport>, Arc<Database>) {
    script.insert(
        0,
        answer(|r| {
            r.created = rows(&[cowboy(1, Some(1), "Joe", 160), cowboy(2, Some(1), "Jack", 170)])
        }),
    );
    let transport = Arc::new(ScriptedTransport::new(script));
    let db = open(&transport, config());
    db.set(
        "cowboys",
        [cowboy(1, None, "Joe", 160), cowboy(2, None, "Jack", 170)],
    )
    .unwrap();
    db.synch(true).await.unwrap();
    assert!(db.synched());
    (transport, db)
}

// ============================================================================
// Request contents
// ============================================================================

#[tokio::test]
async fn first_synch_sends_created_records() {
    let (transport, db) = seeded(vec![]).await;

    let first = transport.request(0);
    assert_eq!(first.last_synched, None);
    let table = &first.tables["cowboys"];
    assert_eq!(table.created.len(), 2);
    assert_eq!(table.identities, vec![Key::Int(1), Key::Int(2)]);
    assert_eq!(table.versions, vec![json!(null), json!(null)]);

    db.with_table("cowboys", |t| {
        assert_eq!(t.status(&Key::Int(1)), &ChangeStatus::Clean);
        assert_eq!(t.get_by_key(&Key::Int(1)).unwrap().field("version"), &json!(1));
    })
    .unwrap();
    assert!(db.last_synched_at().is_some());
    assert!(db.up_to_date());
}

#[tokio::test]
async fn later_synch_reports_last_synched_and_versions() {
    let (transport, db) = seeded(vec![]).await;
    db.del("cowboys", [Key::Int(2)]).unwrap();
    db.synch(false).await.unwrap();

    let second = transport.request(1);
    assert!(second.last_synched.unwrap() <= db.last_synched_at().unwrap());
    let table = &second.tables["cowboys"];
    assert_eq!(table.identities, vec![Key::Int(1)]);
    assert_eq!(table.versions, vec![json!(1)]);
    assert_eq!(table.deleted, vec![cowboy(2, Some(1), "Jack", 170).into_value()]);
}

// ============================================================================
// Freshness
// ============================================================================

#[tokio::test]
async fn synched_and_up_to_date_skips_request() {
    let (transport, db) = seeded(vec![]).await;

    let outcome = db.synch(false).await.unwrap();
    assert!(outcome.skipped);
    assert_eq!(transport.calls(), 1);

    // a forced synch always goes out
    let outcome = db.synch(true).await.unwrap();
    assert!(!outcome.skipped);
    assert_eq!(transport.calls(), 2);

    // so does one with local changes
    db.set("cowboys", [cowboy(3, None, "William", 180)]).unwrap();
    db.synch(false).await.unwrap();
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn expired_poll_window_synchs_again() {
    let transport = Arc::new(ScriptedTransport::default());
    let db = open(&transport, config().with_poll(Duration::ZERO));
    db.synch(false).await.unwrap();
    db.synch(false).await.unwrap();
    assert_eq!(transport.calls(), 2);
    assert!(!db.up_to_date());
}

// ============================================================================
// Coalescing
// ============================================================================

#[tokio::test]
async fn concurrent_synchs_share_one_request() {
    let transport =
        Arc::new(ScriptedTransport::new(vec![]).delayed(Duration::from_millis(50)));
    let db = open(&transport, config());
    db.set("cowboys", [cowboy(1, None, "Joe", 160)]).unwrap();

    let (a, b, c) = tokio::join!(db.synch(false), db.synch(true), db.synch(false));
    assert_eq!(transport.calls(), 1);
    let a = a.unwrap();
    assert_eq!(a, b.unwrap());
    assert_eq!(a, c.unwrap());
    assert!(!db.synching());

    // the next synch is a new attempt
    db.synch(true).await.unwrap();
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn failures_are_shared_too() {
    let transport = Arc::new(
        ScriptedTransport::new(vec![Err(TransportError::Status(400))])
            .delayed(Duration::from_millis(20)),
    );
    let db = open(&transport, config());

    let (a, b) = tokio::join!(db.synch(true), db.synch(true));
    assert_eq!(a.unwrap_err(), Error::Transport(TransportError::Status(400)));
    assert_eq!(b.unwrap_err(), Error::Transport(TransportError::Status(400)));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn synch_task_survives_dropped_callers() {
    let transport = Arc::new(ScriptedTransport::default());
    let db = open(&transport, config());
    transport.arm();

    let pending = tokio::spawn({
        let db = db.clone();
        async move { db.synch(true).await }
    });
    transport.entered().await;
    pending.abort();
    assert!(db.synching());

    // a new caller joins the attempt that is still running
    let (joined, ()) = tokio::join!(db.synch(true), async { transport.release() });
    assert!(!joined.unwrap().skipped);
    assert_eq!(transport.calls(), 1);
    assert!(db.last_synched_at().is_some());
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test]
async fn retryable_status_is_retried_within_budget() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Err(TransportError::Status(503)),
        Err(TransportError::Status(500)),
    ]));
    let db = open(&transport, config());

    db.synch(true).await.unwrap();
    assert_eq!(transport.calls(), 3);
    assert!(db.last_error().is_none());
}

#[tokio::test]
async fn exhausted_retries_reject_the_synch() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Err(TransportError::Status(502)),
        Err(TransportError::Status(503)),
        Err(TransportError::Status(504)),
        answer(|_| {}),
    ]));
    let db = open(&transport, config());

    let err = db.synch(true).await.unwrap_err();
    assert_eq!(err, Error::Transport(TransportError::Status(504)));
    assert_eq!(transport.calls(), 3);
    assert_eq!(db.last_error(), Some(err));
    assert!(db.last_synched_at().is_none());
}

#[tokio::test]
async fn other_failures_are_not_retried() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Err(TransportError::Status(404)),
        Err(TransportError::Network("connection refused".into())),
    ]));
    let db = open(&transport, config());

    assert_eq!(
        db.synch(true).await.unwrap_err(),
        Error::Transport(TransportError::Status(404))
    );
    assert_eq!(transport.calls(), 1);

    assert!(matches!(
        db.synch(true).await.unwrap_err(),
        Error::Transport(TransportError::Network(_))
    ));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn slow_server_times_out_without_retry() {
    let transport =
        Arc::new(ScriptedTransport::new(vec![]).delayed(Duration::from_millis(500)));
    let db = open(&transport, config().with_timeout(Duration::from_millis(20)));

    let err = db.synch(true).await.unwrap_err();
    assert_eq!(err, Error::Transport(TransportError::Timeout));
    assert_eq!(transport.calls(), 1);
}

// ============================================================================
// Failure leaves local state unchanged
// ============================================================================

#[tokio::test]
async fn malformed_response_changes_nothing() {
    let transport = Arc::new(ScriptedTransport::new(vec![answer(|r| {
        r.created = vec![vec![json!(1), json!(1)]];
    })]));
    let db = open(&transport, config());
    db.set("cowboys", [cowboy(1, None, "Joe", 160)]).unwrap();

    let err = db.synch(true).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Engine(stash_engine::Error::InvalidResponse(_))
    ));
    db.with_table("cowboys", |t| {
        assert_eq!(t.created().len(), 1);
        assert!(!t.is_synching());
    })
    .unwrap();
    assert!(db.last_synched_at().is_none());
}

#[tokio::test]
async fn response_is_applied_to_all_tables_or_none() {
    let mut horses = TableSynchResponse {
        columns: vec!["id".into(), "version".into()],
        ..Default::default()
    };
    horses.created = vec![vec![json!(7), json!(1)]];
    let mut cowboys_response = TableSynchResponse {
        columns: columns(),
        ..Default::default()
    };
    // clashes with Joe on the unique name column
    cowboys_response.created = rows(&[cowboy(9, Some(1), "Joe", 150)]);
    let response = SynchResponse::from([
        ("horses".to_string(), horses),
        ("cowboys".to_string(), cowboys_response),
    ]);

    let transport = Arc::new(ScriptedTransport::new(vec![Ok(response)]));
    let db = open(&transport, config());
    db.create_table("horses", TableDef::default()).unwrap();
    db.set("horses", [Record::new().with("id", 7)]).unwrap();
    db.set("cowboys", [cowboy(1, None, "Joe", 160)]).unwrap();

    let err = db.synch(true).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Engine(stash_engine::Error::DuplicateKey { .. })
    ));
    db.with_table("horses", |t| {
        assert_eq!(t.status(&Key::Int(7)), &ChangeStatus::Created);
        assert_eq!(t.get_by_key(&Key::Int(7)).unwrap().field("version"), &json!(null));
    })
    .unwrap();
    assert_eq!(db.with_table("cowboys", |t| t.len()).unwrap(), 1);
}

#[tokio::test]
async fn response_for_unknown_table_is_ignored() {
    let response = SynchResponse::from([("horses".to_string(), TableSynchResponse::default())]);
    let transport = Arc::new(ScriptedTransport::new(vec![Ok(response)]));
    let db = open(&transport, config());

    let outcome = db.synch(true).await.unwrap();
    assert!(outcome.tables.is_empty());
    assert!(!outcome.changed);
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test]
async fn edit_during_synch_wins_over_server_answer() {
    // the server confirms the first edit with a new version
    let (transport, db) = seeded(vec![answer(|r| {
        r.updated = rows(&[cowboy(2, Some(2), "Jack", 171)]);
    })])
    .await;
    db.set("cowboys", [cowboy(2, Some(1), "Jack", 171)]).unwrap();

    transport.arm();
    let synch = tokio::spawn({
        let db = db.clone();
        async move { db.synch(false).await }
    });
    transport.entered().await;
    assert!(db.synching());

    // edited again while the first edit is in flight
    db.set("cowboys", [cowboy(2, Some(1), "Jackie", 172)]).unwrap();
    db.with_table("cowboys", |t| assert_eq!(t.future().len(), 1))
        .unwrap();

    transport.release();
    let outcome = synch.await.unwrap().unwrap();
    assert!(outcome.changed);

    let sent = transport.request(1);
    assert_eq!(
        sent.tables["cowboys"].updated,
        vec![cowboy(2, Some(1), "Jack", 170)]
    );

    let jack = db
        .get("cowboys", &Criteria::new().equals("id", 2))
        .unwrap()
        .remove(0);
    assert_eq!(jack, cowboy(2, Some(2), "Jackie", 172));
    db.with_table("cowboys", |t| {
        assert!(t.future().is_empty());
        // the merged edit goes out with the next synch
        assert_eq!(t.updated(), vec![&cowboy(2, Some(2), "Jack", 171)]);
    })
    .unwrap();
    assert!(!db.synched());
}

#[tokio::test]
async fn create_deleted_during_synch_is_deleted_remotely() {
    let transport = Arc::new(ScriptedTransport::new(vec![answer(|r| {
        r.created = rows(&[cowboy(3, Some(1), "Averell", 190)]);
    })]));
    let db = open(&transport, config());
    db.set("cowboys", [cowboy(3, None, "Averell", 190)]).unwrap();

    transport.arm();
    let synch = tokio::spawn({
        let db = db.clone();
        async move { db.synch(true).await }
    });
    transport.entered().await;
    db.del("cowboys", [Key::Int(3)]).unwrap();

    transport.release();
    synch.await.unwrap().unwrap();
    db.with_table("cowboys", |t| {
        assert!(t.get_by_key(&Key::Int(3)).is_none());
        assert_eq!(t.deleted(), vec![cowboy(3, Some(1), "Averell", 190).into_value()]);
    })
    .unwrap();
    assert!(!db.synched());

    db.synch(false).await.unwrap();
    assert_eq!(
        transport.request(1).tables["cowboys"].deleted,
        vec![cowboy(3, Some(1), "Averell", 190).into_value()]
    );
}

#[tokio::test]
async fn stale_and_failed_are_surfaced_not_raised() {
    let (transport, db) = seeded(vec![answer(|r| {
        r.stale = rows(&[cowboy(1, Some(4), "Joseph", 161)]);
        r.failed = rows(&[cowboy(3, None, "William", 180)]);
    })])
    .await;

    db.set(
        "cowboys",
        [cowboy(1, Some(1), "Joe", 165), cowboy(3, None, "William", 180)],
    )
    .unwrap();
    let outcome = db.synch(false).await.unwrap();
    assert!(!outcome.changed);
    assert_eq!(outcome.tables["cowboys"].stale, 1);
    assert_eq!(outcome.tables["cowboys"].failed, 1);
    assert_eq!(transport.calls(), 2);

    db.with_table("cowboys", |t| {
        assert_eq!(t.stale(), vec![&cowboy(1, Some(4), "Joseph", 161)]);
        assert_eq!(t.failed(), vec![&cowboy(3, None, "William", 180)]);
        // local state is kept until the caller resolves the conflict
        assert_eq!(
            t.get_by_key(&Key::Int(1)),
            Some(&cowboy(1, Some(1), "Joe", 165))
        );
        assert!(t.synched());
    })
    .unwrap();
}

// ============================================================================
// Observer and configuration
// ============================================================================

#[tokio::test]
async fn observer_sees_lifecycle() {
    let observer = Arc::new(RecordingObserver::default());
    let transport = Arc::new(ScriptedTransport::new(vec![
        answer(|r| r.created = rows(&[cowboy(1, Some(1), "Joe", 160)])),
        Err(TransportError::Status(418)),
    ]));
    let db = Database::builder("western")
        .config(config())
        .transport(transport.clone())
        .observer(observer.clone())
        .build()
        .unwrap();
    db.create_table("cowboys", cowboys()).unwrap();
    db.set("cowboys", [cowboy(1, None, "Joe", 160)]).unwrap();

    db.synch(true).await.unwrap();
    db.synch(true).await.unwrap_err();

    let events = observer.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "started",
            "changed cowboys",
            "succeeded changed=true",
            "started",
            "failed transport error: server responded with status 418",
        ]
    );
}

#[tokio::test]
async fn synch_disabled_database_refuses_to_synch() {
    let db = Database::new("local", DatabaseConfig::default()).unwrap();
    db.create_table("cowboys", cowboys()).unwrap();

    let err = db.synch(true).await.unwrap_err();
    assert_eq!(err, Error::SynchDisabled("local".into()));
    assert!(db.last_error().is_none());
}

// ============================================================================
// Auto synch
// ============================================================================

#[tokio::test]
async fn auto_synch_is_armed_by_the_first_synch() {
    let transport = Arc::new(ScriptedTransport::default());
    let config = config()
        .with_auto_synch(true)
        .with_throttle(Duration::from_millis(30))
        .with_poll(Duration::ZERO);
    let db = open(&transport, config);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.calls(), 0);

    db.synch(true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(transport.calls() >= 3, "calls: {}", transport.calls());

    drop(db);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let calls = transport.calls();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.calls(), calls);
}

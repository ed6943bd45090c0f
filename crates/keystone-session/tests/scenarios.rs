//! Integration tests: exclusive mode and result reuse through Database and
//! Session, the way an execution engine drives them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tempfile::TempDir;

use keystone_core::{Config, StorageError, StoreResult};
use keystone_session::{Database, ExclusiveState, PreparedStatement, Row, Session, Value};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const BLOCKED: Duration = Duration::from_millis(200);
const PROMPT: Duration = Duration::from_secs(5);

fn test_db() -> (Arc<Database>, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), Config::testing()).unwrap();
    (db, dir)
}

/// In-memory table T(id, name) with a counter of full scans.
struct Table {
    rows: Mutex<Vec<(i64, String)>>,
    scans: AtomicUsize,
}

impl Table {
    fn new(rows: &[(i64, &str)]) -> Self {
        Self {
            rows: Mutex::new(rows.iter().map(|(id, n)| (*id, n.to_string())).collect()),
            scans: AtomicUsize::new(0),
        }
    }

    fn scan(&self) -> StoreResult<Vec<Row>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .rows
            .lock()
            .iter()
            .map(|(id, name)| vec![Value::Int(*id), Value::Text(name.clone())])
            .collect())
    }

    fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

/// Run a statement for `session` on another thread; the result arrives on
/// the returned channel once the statement gets past the exclusive gate.
fn execute_in_background(session: Arc<Session>) -> mpsc::Receiver<StoreResult<usize>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let stmt = PreparedStatement::prepare("SELECT 1");
        let result = session
            .execute_query(&stmt, || Ok(vec![vec![Value::Int(1)]]))
            .map(|rows| rows.len());
        let _ = tx.send(result);
    });
    rx
}

// ---------------------------------------------------------------------------
// Exclusive mode
// ---------------------------------------------------------------------------

#[test]
fn test_exclusive_mode_sequence() {
    let (db, _dir) = test_db();
    let a = db.connect().unwrap();

    // A takes the lock: B cannot even connect
    a.set_exclusive(true).unwrap();
    match db.connect() {
        Err(StorageError::ExclusiveModeActive { holder }) => assert_eq!(holder, a.id()),
        other => panic!("expected ExclusiveModeActive, got {:?}", other.map(|s| s.id())),
    }

    // Released: B connects
    a.set_exclusive(false).unwrap();
    let b = Arc::new(db.connect().unwrap());

    // Locked again: B's statement waits instead of failing
    a.set_exclusive(true).unwrap();
    let pending = execute_in_background(Arc::clone(&b));
    assert!(pending.recv_timeout(BLOCKED).is_err(), "B must block while A is exclusive");

    a.set_exclusive(false).unwrap();
    assert_eq!(pending.recv_timeout(PROMPT).unwrap().unwrap(), 1);

    // A leaves exclusive mode set and disconnects: lock released with it
    a.set_exclusive(true).unwrap();
    let pending = execute_in_background(Arc::clone(&b));
    assert!(pending.recv_timeout(BLOCKED).is_err());
    drop(a);
    assert_eq!(pending.recv_timeout(PROMPT).unwrap().unwrap(), 1);
    assert_eq!(db.exclusive().state(), ExclusiveState::Normal);

    // And B keeps working without blocking
    let rx = execute_in_background(Arc::clone(&b));
    assert_eq!(rx.recv_timeout(PROMPT).unwrap().unwrap(), 1);

    // A third session can connect now
    db.connect().unwrap();
}

#[test]
fn test_blocked_update_completes_after_release() {
    let (db, _dir) = test_db();
    let a = db.connect().unwrap();
    let b = Arc::new(db.connect().unwrap());
    a.set_exclusive(true).unwrap();

    let (tx, rx) = mpsc::channel();
    let writer = Arc::clone(&b);
    thread::spawn(move || {
        let _ = tx.send(writer.execute_update(b"UPDATE T", || 7));
    });
    assert!(rx.recv_timeout(BLOCKED).is_err());
    assert_eq!(db.generation(), 0);

    a.set_exclusive(false).unwrap();
    assert_eq!(rx.recv_timeout(PROMPT).unwrap().unwrap(), 7);
    assert_eq!(db.generation(), 1);
}

#[test]
fn test_close_wakes_blocked_sessions() {
    let (db, _dir) = test_db();
    let a = db.connect().unwrap();
    let b = Arc::new(db.connect().unwrap());
    a.set_exclusive(true).unwrap();

    let pending = execute_in_background(Arc::clone(&b));
    assert!(pending.recv_timeout(BLOCKED).is_err());

    db.close();
    let result = pending.recv_timeout(PROMPT).unwrap();
    assert!(matches!(result, Err(StorageError::ConnectionClosed { .. })));
}

#[test]
fn test_killing_a_waiting_session_cancels_its_wait() {
    let (db, _dir) = test_db();
    let a = db.connect().unwrap();
    let b = Arc::new(db.connect().unwrap());
    a.set_exclusive(true).unwrap();

    let pending = execute_in_background(Arc::clone(&b));
    assert!(pending.recv_timeout(BLOCKED).is_err());

    db.disconnect(b.id());
    match pending.recv_timeout(PROMPT).unwrap() {
        Err(StorageError::ConnectionClosed { session }) => assert_eq!(session, b.id()),
        other => panic!("expected ConnectionClosed, got {:?}", other),
    }
    assert!(a.is_exclusive());
}

// ---------------------------------------------------------------------------
// Result reuse
// ---------------------------------------------------------------------------

#[test]
fn test_result_cache_scenario() {
    let (db, _dir) = test_db();
    let session = db.connect().unwrap();
    let t = Table::new(&[(1, "Hello"), (2, "World")]);
    let q = PreparedStatement::prepare("SELECT * FROM T");

    // Miss: populates the cache
    let first = session.execute_query(&q, || t.scan()).unwrap();
    assert_eq!(t.scans(), 1);

    // Hit: identical rows, no table scan
    let second = session.execute_query(&q, || t.scan()).unwrap();
    assert_eq!(t.scans(), 1);
    assert_eq!(first, second);

    // Update a row in T
    session.execute_update(b"UPDATE T SET NAME='Hallo' WHERE ID=1", || {
        t.rows.lock()[0].1 = "Hallo".to_string();
    }).unwrap();

    // Forced miss, rows reflect the update
    let third = session.execute_query(&q, || t.scan()).unwrap();
    assert_eq!(t.scans(), 2);
    assert_eq!(third[0][1], Value::Text("Hallo".into()));

    let stats = db.result_cache().stats();
    assert_eq!((stats.hits, stats.misses), (1, 2));
}

#[test]
fn test_write_by_other_session_invalidates() {
    let (db, _dir) = test_db();
    let reader = db.connect().unwrap();
    let writer = db.connect().unwrap();
    let t = Table::new(&[(1, "a")]);
    let q = PreparedStatement::prepare("SELECT * FROM T");

    reader.execute_query(&q, || t.scan()).unwrap();
    writer.execute_update(b"INSERT", || t.rows.lock().push((2, "b".into()))).unwrap();
    let rows = reader.execute_query(&q, || t.scan()).unwrap();
    assert_eq!(rows.len(), 2);
}

#[test]
fn test_current_timestamp_never_cached() {
    let (db, _dir) = test_db();
    let session = db.connect().unwrap();
    let q = PreparedStatement::prepare("SELECT CURRENT_TIMESTAMP()");
    assert!(!q.is_cacheable());

    let evaluations = AtomicUsize::new(0);
    let now = || -> StoreResult<Vec<Row>> {
        evaluations.fetch_add(1, Ordering::SeqCst);
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
        Ok(vec![vec![Value::Int(nanos as i64)]])
    };

    let first = session.execute_query(&q, now).unwrap();
    thread::sleep(Duration::from_millis(50));
    let second = session.execute_query(&q, now).unwrap();
    assert_ne!(first, second);
    assert_eq!(evaluations.load(Ordering::SeqCst), 2);
    assert!(db.result_cache().is_empty());
}

#[test]
fn test_reuse_disabled_always_scans() {
    let (db, _dir) = test_db();
    let session = db.connect().unwrap();
    session.set("OPTIMIZE_REUSE_RESULTS", "0").unwrap();
    let t = Table::new(&[(1, "x")]);
    let q = PreparedStatement::prepare("SELECT * FROM T");

    for _ in 0..3 {
        session.execute_query(&q, || t.scan()).unwrap();
    }
    assert_eq!(t.scans(), 3);

    session.set("OPTIMIZE_REUSE_RESULTS", "1").unwrap();
    for _ in 0..3 {
        session.execute_query(&q, || t.scan()).unwrap();
    }
    assert_eq!(t.scans(), 4);
}

#[test]
fn test_concurrent_readers_never_see_pre_write_rows() {
    let (db, _dir) = test_db();
    let t = Arc::new(Table::new(&[(0, "v0")]));
    let q = PreparedStatement::prepare("SELECT * FROM T");

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let session = db.connect().unwrap();
            let t = Arc::clone(&t);
            let q = q.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    // The generation read after the query can only be higher
                    let floor = session.database().generation();
                    let rows = session.execute_query(&q, || t.scan()).unwrap();
                    let seen = match &rows[0][0] {
                        Value::Int(v) => *v as u64,
                        other => panic!("unexpected value {:?}", other),
                    };
                    assert!(
                        seen >= floor,
                        "served rows from version {} after generation {}",
                        seen,
                        floor
                    );
                }
            })
        })
        .collect();

    let writer = db.connect().unwrap();
    for version in 1..=200i64 {
        writer.execute_update(b"UPDATE T", || {
            t.rows.lock()[0] = (version, format!("v{}", version));
        }).unwrap();
    }
    for r in readers {
        r.join().unwrap();
    }
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[test]
fn test_power_loss_keeps_committed_updates() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(dir.path(), Config::testing()).unwrap();
        let session = db.connect().unwrap();
        session.execute_update(b"one", || ()).unwrap();
        session.execute_update(b"two", || ()).unwrap();

        // Trip on the payload write of the next record
        db.storage().arm_power_failure(2);
        let applied = AtomicUsize::new(0);
        let err = session
            .execute_update(b"three", || applied.fetch_add(1, Ordering::SeqCst))
            .unwrap_err();
        assert!(err.is_simulated_power_loss());
        assert_eq!(applied.load(Ordering::SeqCst), 0);
        assert_eq!(db.generation(), 2);
    }

    let db = Database::open(dir.path(), Config::testing()).unwrap();
    assert_eq!(db.recovered_records(), &[b"one".to_vec(), b"two".to_vec()]);
    let session = db.connect().unwrap();
    session.execute_update(b"four", || ()).unwrap();
}

#[test]
fn test_writes_after_torn_commit_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = Database::open(dir.path(), Config::testing()).unwrap();
        let session = db.connect().unwrap();
        session.execute_update(b"one", || ()).unwrap();

        // Header of "two" reaches the journal, its payload does not
        db.storage().arm_power_failure(2);
        let err = session.execute_update(b"two", || ()).unwrap_err();
        assert!(err.is_simulated_power_loss());

        db.storage().reset_power_failure();
        session.execute_update(b"three", || ()).unwrap();
        session.execute_update(b"four", || ()).unwrap();
        assert_eq!(db.generation(), 3);
    }

    let db = Database::open(dir.path(), Config::testing()).unwrap();
    assert_eq!(
        db.recovered_records(),
        &[b"one".to_vec(), b"three".to_vec(), b"four".to_vec()]
    );
}

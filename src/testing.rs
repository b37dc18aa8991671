// In-memory stand-ins for the database, used by unit tests
//
// `FakeDatabase` holds canned rows per query and records transaction
// control calls. `FakeManager` hands out `FakeConnection`s that share it.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::db::{Connection, ConnectionManager, Query, Row, Store, StoreError, Value};

/// Builds a `Row` from anything convertible into `Value`
macro_rules! row {
    ($($value:expr),* $(,)?) => {
        $crate::db::Row::new(vec![$($crate::db::Value::from($value)),*])
    };
}

#[derive(Default)]
pub struct FakeDatabase {
    rows: Mutex<HashMap<Query, Vec<Row>>>,
    failing: Mutex<HashSet<Query>>,
    events: Mutex<Vec<String>>,
    pub fail_connect: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_rollback: AtomicBool,
    pub fail_release: AtomicBool,
    pub fail_ping: AtomicBool,
    /// Makes `connect` and `ping` hang until cancelled
    pub stall: AtomicBool,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
}

impl FakeDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeDatabase::default())
    }

    pub fn set_rows(&self, query: Query, rows: Vec<Row>) {
        self.rows.lock().unwrap().insert(query, rows);
    }

    pub fn set_count(&self, query: Query, count: i64) {
        self.set_rows(query, vec![Row::new(vec![Value::Int(count)])]);
    }

    /// Makes every future `fetch` of `query` fail
    pub fn fail(&self, query: Query) {
        self.failing.lock().unwrap().insert(query);
    }

    /// Transaction control calls in the order they happened
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    async fn maybe_stall(&self) {
        if self.stall.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    /// A connection that is not owned by any pool
    pub fn store(self: &Arc<Self>) -> FakeConnection {
        FakeConnection {
            db: Arc::clone(self),
        }
    }
}

pub struct FakeManager {
    db: Arc<FakeDatabase>,
}

impl FakeManager {
    pub fn new(db: &Arc<FakeDatabase>) -> Self {
        FakeManager { db: Arc::clone(db) }
    }
}

#[async_trait]
impl ConnectionManager for FakeManager {
    type Connection = FakeConnection;

    async fn connect(&self) -> Result<FakeConnection, StoreError> {
        self.db.maybe_stall().await;
        if self.db.fail_connect.load(Ordering::SeqCst) {
            return Err(database_error("connection refused".to_string()));
        }
        self.db.opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.db.store())
    }
}

pub struct FakeConnection {
    db: Arc<FakeDatabase>,
}

#[async_trait]
impl Store for FakeConnection {
    async fn fetch(&mut self, query: &Query) -> Result<Vec<Row>, StoreError> {
        if self.db.failing.lock().unwrap().contains(query) {
            return Err(database_error(format!(
                "relation for {} does not exist",
                query.name()
            )));
        }
        Ok(self
            .db
            .rows
            .lock()
            .unwrap()
            .get(query)
            .cloned()
            .unwrap_or_default())
    }
}

fn database_error(message: String) -> StoreError {
    StoreError::Database(sqlx::Error::Protocol(message))
}

fn outcome(flag: &AtomicBool, what: &str) -> Result<(), StoreError> {
    if flag.load(Ordering::SeqCst) {
        Err(database_error(format!("{} failed", what)))
    } else {
        Ok(())
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn begin(&mut self) -> Result<(), StoreError> {
        self.db.record("begin".to_string());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.db.record("commit".to_string());
        outcome(&self.db.fail_commit, "commit")
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.db.record("rollback".to_string());
        outcome(&self.db.fail_rollback, "rollback")
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.db.record(format!("savepoint {}", name));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.db.record(format!("rollback to {}", name));
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.db.record(format!("release {}", name));
        outcome(&self.db.fail_release, "release")
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        self.db.maybe_stall().await;
        outcome(&self.db.fail_ping, "ping")
    }

    async fn close(self) -> Result<(), StoreError> {
        self.db.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

//! In-memory database double.
//!
//! [`FakeDatabase`] implements [`TransactionalClient`] and understands just
//! enough SQL to exercise the coordination layer: the advisory lock
//! functions, the migration ledger statements, and transaction buffering.
//! Any other statement is recorded verbatim. Failures can be injected per
//! operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::client::{Connection, QueryExecutor, Row, SqlValue, Transaction, TransactionalClient};
use crate::error::{DbResult, DriverError};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Default)]
struct Failures {
    connect: bool,
    begin: bool,
    commit: bool,
    close: bool,
    statement: Option<String>,
}

#[derive(Default)]
struct FakeState {
    next_session: u64,
    opened: usize,
    open: usize,
    /// Lock name to holding session and its acquisition count.
    locks: HashMap<String, (u64, usize)>,
    ledger_created: bool,
    ledger: Vec<String>,
    statements: Vec<String>,
    commits: usize,
    rollbacks: usize,
    failures: Failures,
}

/// Writes buffered by an open transaction.
#[derive(Default)]
struct Pending {
    ledger: Vec<String>,
    statements: Vec<String>,
}

/// Shared in-memory database; clones see the same state.
#[derive(Clone, Default)]
pub struct FakeDatabase {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state().failures.connect = fail;
    }

    pub fn fail_begin(&self, fail: bool) {
        self.state().failures.begin = fail;
    }

    pub fn fail_commit(&self, fail: bool) {
        self.state().failures.commit = fail;
    }

    pub fn fail_close(&self, fail: bool) {
        self.state().failures.close = fail;
    }

    /// Fail every statement whose text contains `pattern`.
    pub fn fail_statements_containing(&self, pattern: impl Into<String>) {
        self.state().failures.statement = Some(pattern.into());
    }

    pub fn clear_failures(&self) {
        self.state().failures = Failures::default();
    }

    /// Pretend the given versions were applied by an earlier run.
    pub fn seed_ledger(&self, versions: &[&str]) {
        let mut state = self.state();
        state.ledger_created = true;
        state.ledger.extend(versions.iter().map(|v| v.to_string()));
    }

    /// Committed ledger versions, in insertion order.
    pub fn ledger(&self) -> Vec<String> {
        self.state().ledger.clone()
    }

    /// Committed statements other than lock and ledger bookkeeping.
    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }

    pub fn commits(&self) -> usize {
        self.state().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.state().rollbacks
    }

    /// Physical connections opened so far.
    pub fn opened_connections(&self) -> usize {
        self.state().opened
    }

    /// Physical connections currently open.
    pub fn open_connections(&self) -> usize {
        self.state().open
    }

    /// How many times the holding session has taken the named lock.
    pub fn lock_count(&self, name: &str) -> usize {
        self.state().locks.get(name).map_or(0, |(_, count)| *count)
    }

    /// Whether any session holds the named lock.
    pub fn is_locked(&self, name: &str) -> bool {
        self.state().locks.contains_key(name)
    }
}

#[async_trait]
impl TransactionalClient for FakeDatabase {
    async fn connection(&self) -> DbResult<Arc<dyn Connection>> {
        let mut state = self.state();
        if state.failures.connect {
            return Err(DriverError::new("connection refused"));
        }
        state.next_session += 1;
        state.opened += 1;
        state.open += 1;
        let session = Arc::new(Session {
            db: self.clone(),
            id: state.next_session,
            pending: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        Ok(Arc::new(FakeConnection { session }))
    }
}

struct Session {
    db: FakeDatabase,
    id: u64,
    pending: Mutex<Option<Pending>>,
    closed: AtomicBool,
}

impl Session {
    fn pending(&self) -> MutexGuard<'_, Option<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::new("connection is closed"));
        }
        let normalized = sql.trim().to_ascii_uppercase();

        if normalized.starts_with("SELECT GET_LOCK") {
            return self.get_lock(params).await.map(|row| vec![row]);
        }
        if normalized.starts_with("SELECT RELEASE_LOCK") {
            return self.release_lock(params).map(|row| vec![row]);
        }

        let mut state = self.db.state();
        if let Some(pattern) = &state.failures.statement {
            if sql.contains(pattern.as_str()) {
                return Err(DriverError::new(format!("statement failed: {}", sql.trim())));
            }
        }

        if normalized.starts_with("CREATE TABLE IF NOT EXISTS MIGRATION_VERSIONS") {
            state.ledger_created = true;
            return Ok(Vec::new());
        }

        if normalized.starts_with("SELECT VERSION FROM MIGRATION_VERSIONS") {
            if !state.ledger_created {
                return Err(DriverError::new("table 'migration_versions' doesn't exist"));
            }
            let mut versions = state.ledger.clone();
            if let Some(pending) = self.pending().as_ref() {
                versions.extend(pending.ledger.iter().cloned());
            }
            return Ok(versions
                .into_iter()
                .map(|v| Row::new(vec![SqlValue::Text(v)]))
                .collect());
        }

        if normalized.starts_with("INSERT INTO MIGRATION_VERSIONS") {
            let version = params
                .first()
                .and_then(SqlValue::as_str)
                .ok_or_else(|| DriverError::new("missing version parameter"))?
                .to_string();
            match self.pending().as_mut() {
                Some(pending) => pending.ledger.push(version),
                None => state.ledger.push(version),
            }
            return Ok(Vec::new());
        }

        let statement = sql.trim().to_string();
        match self.pending().as_mut() {
            Some(pending) => pending.statements.push(statement),
            None => state.statements.push(statement),
        }
        Ok(Vec::new())
    }

    async fn get_lock(&self, params: &[SqlValue]) -> DbResult<Row> {
        let name = lock_name(params)?;
        let seconds = params.get(1).and_then(SqlValue::as_i64).unwrap_or(0).max(0);
        let deadline = Instant::now() + Duration::from_secs(seconds as u64);

        loop {
            {
                let mut state = self.db.state();
                match state.locks.get_mut(&name) {
                    Some((holder, _)) if *holder != self.id => {}
                    Some((_, count)) => {
                        *count += 1;
                        return Ok(Row::new(vec![SqlValue::Int(1)]));
                    }
                    None => {
                        state.locks.insert(name, (self.id, 1));
                        return Ok(Row::new(vec![SqlValue::Int(1)]));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(Row::new(vec![SqlValue::Int(0)]));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    fn release_lock(&self, params: &[SqlValue]) -> DbResult<Row> {
        let name = lock_name(params)?;
        let mut state = self.db.state();
        let result = match state.locks.get_mut(&name) {
            None => SqlValue::Null,
            Some((holder, _)) if *holder != self.id => SqlValue::Int(0),
            Some((_, count)) => {
                *count -= 1;
                if *count == 0 {
                    state.locks.remove(&name);
                }
                SqlValue::Int(1)
            }
        };
        Ok(Row::new(vec![result]))
    }

    fn begin(&self) -> DbResult<()> {
        if self.db.state().failures.begin {
            return Err(DriverError::new("cannot start transaction"));
        }
        let mut pending = self.pending();
        if pending.is_some() {
            return Err(DriverError::new("transaction already in progress"));
        }
        *pending = Some(Pending::default());
        Ok(())
    }

    fn commit(&self) -> DbResult<()> {
        let pending = self
            .pending()
            .take()
            .ok_or_else(|| DriverError::new("no transaction in progress"))?;
        let mut state = self.db.state();
        if state.failures.commit {
            state.rollbacks += 1;
            return Err(DriverError::new("commit failed"));
        }
        state.ledger.extend(pending.ledger);
        state.statements.extend(pending.statements);
        state.commits += 1;
        Ok(())
    }

    fn rollback(&self) -> DbResult<()> {
        self.pending()
            .take()
            .ok_or_else(|| DriverError::new("no transaction in progress"))?;
        self.db.state().rollbacks += 1;
        Ok(())
    }

    fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(DriverError::new("connection already closed"));
        }
        let abandoned = self.pending().take().is_some();
        let mut state = self.db.state();
        state.open -= 1;
        if abandoned {
            state.rollbacks += 1;
        }
        let id = self.id;
        state.locks.retain(|_, (holder, _)| *holder != id);
        if state.failures.close {
            return Err(DriverError::new("close failed"));
        }
        Ok(())
    }
}

fn lock_name(params: &[SqlValue]) -> DbResult<String> {
    params
        .first()
        .and_then(SqlValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| DriverError::new("missing lock name parameter"))
}

struct FakeConnection {
    session: Arc<Session>,
}

#[async_trait]
impl QueryExecutor for FakeConnection {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        self.session.run(sql, params).await.map(|_| 1)
    }

    async fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.session.run(sql, &[]).await.map(|_| ())
    }

    async fn query_one(&self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>> {
        Ok(self.session.run(sql, params).await?.into_iter().next())
    }

    async fn query_all(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        self.session.run(sql, params).await
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn begin(&self) -> DbResult<Arc<dyn Transaction>> {
        self.session.begin()?;
        Ok(Arc::new(FakeTransaction {
            session: self.session.clone(),
        }))
    }

    async fn close(&self) -> DbResult<()> {
        self.session.close()
    }
}

struct FakeTransaction {
    session: Arc<Session>,
}

#[async_trait]
impl QueryExecutor for FakeTransaction {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        self.session.run(sql, params).await.map(|_| 1)
    }

    async fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.session.run(sql, &[]).await.map(|_| ())
    }

    async fn query_one(&self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>> {
        Ok(self.session.run(sql, params).await?.into_iter().next())
    }

    async fn query_all(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        self.session.run(sql, params).await
    }
}

#[async_trait]
impl Transaction for FakeTransaction {
    async fn commit(&self) -> DbResult<()> {
        self.session.commit()
    }

    async fn rollback(&self) -> DbResult<()> {
        self.session.rollback()
    }
}

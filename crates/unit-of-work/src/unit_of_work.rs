//! Shared unit of work (transaction) manager.
//!
//! Every participant of one operation scope joins the same transaction.
//! Only the last participant to complete decides the outcome: its result
//! selects commit or rollback, after which the pooled connection is
//! released. Intermediate participants never commit or roll back, so the
//! database sees one transaction wrapping every participant's statements.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::client::{QueryExecutor, Row, SqlValue, Transaction};
use crate::error::{with_cleanup, DbResult, Error, Result};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::scope::{OperationId, OperationScope};

/// Observer notified when a shared transaction has been completed.
///
/// Invoked synchronously on the completing task with the final error, if
/// any. It has no say over commit or rollback.
pub trait CompletionObserver: Send + Sync {
    fn on_complete(&self, scope: &OperationScope, error: Option<&Error>);
}

/// Observer that logs every completed unit of work.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CompletionObserver for TracingObserver {
    fn on_complete(&self, scope: &OperationScope, error: Option<&Error>) {
        match error {
            None => tracing::debug!(operation = %scope.id(), "Unit of work committed"),
            Some(e) => tracing::warn!(operation = %scope.id(), error = %e, "Unit of work rolled back"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Commit,
    Rollback,
}

/// What a participant's completion did to the shared transaction.
enum Completion {
    /// Other participants remain
    Joined,
    /// Last participant; outcome of commit/rollback plus connection release
    Finished(Result<()>),
}

struct SharedTransaction {
    tx: Arc<dyn Transaction>,
    conn: PooledConnection,
    count: usize,
}

struct FactoryState {
    pool: ConnectionPool,
    observer: Option<Arc<dyn CompletionObserver>>,
    transactions: Mutex<HashMap<OperationId, SharedTransaction>>,
}

impl FactoryState {
    async fn finish(&self, id: OperationId, decision: Decision) -> Completion {
        let mut transactions = self.transactions.lock().await;

        let count = match transactions.get(&id) {
            Some(shared) => shared.count,
            None => {
                tracing::warn!(operation = %id, "Completed a unit of work that is not active");
                return Completion::Joined;
            }
        };

        if count > 1 {
            if let Some(shared) = transactions.get_mut(&id) {
                shared.count -= 1;
            }
            return Completion::Joined;
        }

        let Some(shared) = transactions.remove(&id) else {
            return Completion::Joined;
        };

        let outcome = match decision {
            Decision::Commit => shared.tx.commit().await.map_err(Error::CommitFailed),
            Decision::Rollback => shared.tx.rollback().await.map_err(Error::RollbackFailed),
        };
        tracing::debug!(operation = %id, ?decision, ok = outcome.is_ok(), "Shared transaction finished");

        let release = shared.conn.release().await;
        Completion::Finished(with_cleanup(outcome, release))
    }
}

/// Hands out units of work keyed by operation scope.
#[derive(Clone)]
pub struct UnitOfWorkFactory {
    state: Arc<FactoryState>,
}

impl UnitOfWorkFactory {
    pub fn new(pool: ConnectionPool) -> Self {
        Self::build(pool, None)
    }

    pub fn with_observer(pool: ConnectionPool, observer: Arc<dyn CompletionObserver>) -> Self {
        Self::build(pool, Some(observer))
    }

    fn build(pool: ConnectionPool, observer: Option<Arc<dyn CompletionObserver>>) -> Self {
        Self {
            state: Arc::new(FactoryState {
                pool,
                observer,
                transactions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Join the scope's transaction, beginning it on first use.
    ///
    /// If the transaction cannot be started, the freshly acquired
    /// connection is released before the error is returned.
    pub async fn begin(&self, scope: &OperationScope) -> Result<UnitOfWork> {
        let id = scope.id();
        let mut transactions = self.state.transactions.lock().await;

        if let Some(shared) = transactions.get_mut(&id) {
            shared.count += 1;
            tracing::debug!(operation = %id, participants = shared.count, "Joined shared transaction");
            return Ok(UnitOfWork::new(self.state.clone(), scope.clone(), shared.tx.clone()));
        }

        let conn = self.state.pool.acquire(scope).await?;
        let tx = match conn.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                let release = conn.release().await;
                return with_cleanup(Err(Error::TransactionBeginFailed(e)), release);
            }
        };

        transactions.insert(
            id,
            SharedTransaction {
                tx: tx.clone(),
                conn,
                count: 1,
            },
        );
        tracing::debug!(operation = %id, "Began shared transaction");
        Ok(UnitOfWork::new(self.state.clone(), scope.clone(), tx))
    }

    /// Number of scopes with an open transaction.
    pub async fn active(&self) -> usize {
        self.state.transactions.lock().await.len()
    }

    /// Participants sharing the scope's transaction.
    pub async fn participants(&self, id: OperationId) -> Option<usize> {
        self.state
            .transactions
            .lock()
            .await
            .get(&id)
            .map(|shared| shared.count)
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.state.pool
    }
}

/// One participant's view of a (possibly shared) transaction.
///
/// Must be completed exactly once with [`UnitOfWork::complete`]. A unit of
/// work dropped without completion counts as a failed participant.
pub struct UnitOfWork {
    state: Arc<FactoryState>,
    scope: OperationScope,
    tx: Arc<dyn Transaction>,
    completed: bool,
}

impl UnitOfWork {
    fn new(state: Arc<FactoryState>, scope: OperationScope, tx: Arc<dyn Transaction>) -> Self {
        Self {
            state,
            scope,
            tx,
            completed: false,
        }
    }

    pub fn scope(&self) -> &OperationScope {
        &self.scope
    }

    /// Query client bound to the transaction.
    pub fn client(&self) -> Client<'_> {
        Client { tx: &*self.tx }
    }

    /// Finish this participant.
    ///
    /// `Ok` votes for commit and `Err` for rollback; only the last
    /// participant's vote takes effect. The caller's error is returned
    /// unchanged, joined with any rollback, commit or release failure.
    pub async fn complete<T>(mut self, result: Result<T>) -> Result<T> {
        self.completed = true;
        let decision = if result.is_ok() {
            Decision::Commit
        } else {
            Decision::Rollback
        };

        match self.state.finish(self.scope.id(), decision).await {
            Completion::Joined => result,
            Completion::Finished(outcome) => {
                let result = with_cleanup(result, outcome);
                if let Some(observer) = &self.state.observer {
                    observer.on_complete(&self.scope, result.as_ref().err());
                }
                result
            }
        }
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let id = self.scope.id();
        tracing::warn!(operation = %id, "Unit of work dropped without completion");

        let state = self.state.clone();
        let scope = self.scope.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let Completion::Finished(outcome) = state.finish(id, Decision::Rollback).await
                    else {
                        return;
                    };
                    if let Err(e) = &outcome {
                        tracing::error!(operation = %id, error = %e, "Failed to roll back dropped unit of work");
                    }
                    let result = with_cleanup(
                        Err::<(), _>(Error::aborted("unit of work dropped without completion")),
                        outcome,
                    );
                    if let Some(observer) = &state.observer {
                        observer.on_complete(&scope, result.as_ref().err());
                    }
                });
            }
            Err(_) => {
                tracing::error!(operation = %id, "No runtime to roll back dropped unit of work");
            }
        }
    }
}

/// Query client handed to participants; borrows the unit of work so it
/// cannot outlive its completion.
#[derive(Clone, Copy)]
pub struct Client<'a> {
    tx: &'a dyn Transaction,
}

#[async_trait]
impl<'a> QueryExecutor for Client<'a> {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        self.tx.execute(sql, params).await
    }

    async fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.tx.execute_batch(sql).await
    }

    async fn query_one(&self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>> {
        self.tx.query_one(sql, params).await
    }

    async fn query_all(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        self.tx.query_all(sql, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::QueryExecutorExt;
    use crate::error::{DriverError, ErrorKind};
    use crate::testing::FakeDatabase;
    use std::sync::Mutex as StdMutex;
    use tokio_test::{assert_err, assert_ok};

    fn factory_over(db: &FakeDatabase) -> UnitOfWorkFactory {
        UnitOfWorkFactory::new(ConnectionPool::new(Arc::new(db.clone())))
    }

    fn failure() -> Error {
        Error::aborted(DriverError::new("participant failed"))
    }

    #[derive(Default)]
    struct RecordingObserver {
        calls: StdMutex<Vec<Option<String>>>,
    }

    impl CompletionObserver for RecordingObserver {
        fn on_complete(&self, _scope: &OperationScope, error: Option<&Error>) {
            self.calls
                .lock()
                .unwrap()
                .push(error.map(|e| e.to_string()));
        }
    }

    #[tokio::test]
    async fn test_single_participant_commits() {
        let db = FakeDatabase::new();
        let factory = factory_over(&db);
        let scope = OperationScope::new();

        let uow = factory.begin(&scope).await.unwrap();
        assert_ok!(uow.client().execute("UPDATE accounts SET balance = 0", &[]).await);
        assert_ok!(uow.complete(Ok(())).await);

        assert_eq!(db.commits(), 1);
        assert_eq!(db.statements(), vec!["UPDATE accounts SET balance = 0"]);
        assert_eq!(factory.active().await, 0);
        assert!(factory.pool().is_empty().await);
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_commit_happens_after_last_participant() {
        let db = FakeDatabase::new();
        let factory = factory_over(&db);
        let scope = OperationScope::new();

        let outer = factory.begin(&scope).await.unwrap();
        let inner = factory.begin(&scope).await.unwrap();
        assert_eq!(db.opened_connections(), 1);
        assert_eq!(factory.participants(scope.id()).await, Some(2));

        assert_ok!(inner.client().execute("INSERT INTO audit VALUES (1)", &[]).await);
        assert_ok!(inner.complete(Ok(())).await);
        assert_eq!(db.commits(), 0);
        assert!(db.statements().is_empty());

        assert_ok!(outer.complete(Ok(())).await);
        assert_eq!(db.commits(), 1);
        assert_eq!(db.statements(), vec!["INSERT INTO audit VALUES (1)"]);
    }

    #[tokio::test]
    async fn test_concurrent_participants_single_commit() {
        let db = FakeDatabase::new();
        let factory = factory_over(&db);
        let scope = OperationScope::new();

        let joined = Arc::new(tokio::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let factory = factory.clone();
                let scope = scope.clone();
                let joined = joined.clone();
                tokio::spawn(async move {
                    let uow = factory.begin(&scope).await?;
                    joined.wait().await;
                    let sql = format!("INSERT INTO events VALUES ({})", i);
                    let result = uow
                        .client()
                        .execute(&sql, &[])
                        .await
                        .map(|_| ())
                        .map_err(|e| Error::database("insert event", e));
                    uow.complete(result).await
                })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            assert_ok!(result.unwrap());
        }

        assert_eq!(db.commits(), 1);
        assert_eq!(db.rollbacks(), 0);
        assert_eq!(db.statements().len(), 8);
        assert_eq!(db.opened_connections(), 1);
        assert_eq!(factory.active().await, 0);
    }

    #[tokio::test]
    async fn test_last_participant_error_rolls_back() {
        let db = FakeDatabase::new();
        let factory = factory_over(&db);
        let scope = OperationScope::new();

        let outer = factory.begin(&scope).await.unwrap();
        let inner = factory.begin(&scope).await.unwrap();
        assert_ok!(inner.client().execute("DELETE FROM carts", &[]).await);
        assert_ok!(inner.complete(Ok(())).await);

        let err = outer.complete::<()>(Err(failure())).await.unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::Aborted));
        assert_eq!(db.rollbacks(), 1);
        assert_eq!(db.commits(), 0);
        assert!(db.statements().is_empty());
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_intermediate_error_is_passed_through() {
        let db = FakeDatabase::new();
        let factory = factory_over(&db);
        let scope = OperationScope::new();

        let outer = factory.begin(&scope).await.unwrap();
        let inner = factory.begin(&scope).await.unwrap();

        let err = inner.complete::<()>(Err(failure())).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Aborted));
        assert_eq!(db.rollbacks(), 0);

        assert_ok!(outer.complete(Ok(())).await);
        assert_eq!(db.commits(), 1);
    }

    #[tokio::test]
    async fn test_begin_failure_releases_connection() {
        let db = FakeDatabase::new();
        let factory = factory_over(&db);
        db.fail_begin(true);

        let err = factory.begin(&OperationScope::new()).await.err().unwrap();

        assert_eq!(err.kind(), Some(ErrorKind::TransactionBeginFailed));
        assert!(factory.pool().is_empty().await);
        assert_eq!(factory.active().await, 0);
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_begin_failure_joins_release_error() {
        let db = FakeDatabase::new();
        let factory = factory_over(&db);
        db.fail_begin(true);
        db.fail_close(true);

        let err = factory.begin(&OperationScope::new()).await.err().unwrap();

        assert!(err.has(ErrorKind::TransactionBeginFailed));
        assert!(err.has(ErrorKind::ConnectionCloseFailed));
        assert!(factory.pool().is_empty().await);
    }

    #[tokio::test]
    async fn test_commit_failure_is_reported() {
        let db = FakeDatabase::new();
        let factory = factory_over(&db);
        let uow = factory.begin(&OperationScope::new()).await.unwrap();
        db.fail_commit(true);

        let err = assert_err!(uow.complete(Ok(())).await);

        assert_eq!(err.kind(), Some(ErrorKind::CommitFailed));
        assert!(factory.pool().is_empty().await);
    }

    #[tokio::test]
    async fn test_observer_sees_final_result_once() {
        let db = FakeDatabase::new();
        let observer = Arc::new(RecordingObserver::default());
        let factory = UnitOfWorkFactory::with_observer(
            ConnectionPool::new(Arc::new(db.clone())),
            observer.clone(),
        );
        let scope = OperationScope::new();

        let outer = factory.begin(&scope).await.unwrap();
        let inner = factory.begin(&scope).await.unwrap();
        assert_ok!(inner.complete(Ok(())).await);
        assert!(observer.calls.lock().unwrap().is_empty());

        assert_err!(outer.complete::<()>(Err(failure())).await);

        let calls = observer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].as_deref(),
            Some("operation aborted: participant failed")
        );
    }

    #[tokio::test]
    async fn test_reads_see_uncommitted_writes_of_the_same_scope() {
        let db = FakeDatabase::new();
        db.seed_ledger(&["001"]);
        let factory = factory_over(&db);
        let scope = OperationScope::new();

        let writer = factory.begin(&scope).await.unwrap();
        assert_ok!(
            writer
                .client()
                .execute("INSERT INTO migration_versions (version) VALUES (?)", &[SqlValue::from("002")])
                .await
        );

        let reader = factory.begin(&scope).await.unwrap();
        let versions: Vec<String> = reader
            .client()
            .select("SELECT version FROM migration_versions", &[])
            .await
            .unwrap();
        assert_eq!(versions, vec!["001", "002"]);

        assert_ok!(reader.complete(Ok(())).await);
        assert_ok!(writer.complete(Ok(())).await);
        assert_eq!(db.ledger(), vec!["001", "002"]);
    }

    #[tokio::test]
    async fn test_dropped_unit_of_work_rolls_back() {
        let db = FakeDatabase::new();
        let factory = factory_over(&db);

        let uow = factory.begin(&OperationScope::new()).await.unwrap();
        assert_ok!(uow.client().execute("UPDATE stock SET qty = 0", &[]).await);
        drop(uow);

        for _ in 0..10 {
            if factory.active().await == 0 && factory.pool().is_empty().await {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(db.rollbacks(), 1);
        assert!(db.statements().is_empty());
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_dropped_last_participant_notifies_observer() {
        let db = FakeDatabase::new();
        let observer = Arc::new(RecordingObserver::default());
        let factory = UnitOfWorkFactory::with_observer(
            ConnectionPool::new(Arc::new(db.clone())),
            observer.clone(),
        );
        let scope = OperationScope::new();

        let outer = factory.begin(&scope).await.unwrap();
        let inner = factory.begin(&scope).await.unwrap();
        assert_ok!(inner.complete(Ok(())).await);
        drop(outer);

        for _ in 0..50 {
            if !observer.calls.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let calls = observer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].as_deref(),
            Some("operation aborted: unit of work dropped without completion")
        );
        assert_eq!(db.rollbacks(), 1);
    }
}

//! Named advisory locks on the database server.
//!
//! A lock is held by a database session, so a [`Lock`] pins the pooled
//! connection of its scope until it is unlocked. Because the pool is keyed
//! by scope, a unit of work begun on the same scope runs on the session that
//! holds the lock.

use std::time::Duration;

use common::MAX_LOCK_KEY_LENGTH;

use crate::client::{QueryExecutor, SqlValue};
use crate::error::{with_cleanup, DriverError, Error, Result};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::scope::OperationScope;

/// Key namespaced by the current schema and cut to the primitive's limit.
fn lock_key_expr() -> String {
    format!(
        "SUBSTRING(CONCAT(?, '.', DATABASE()), 1, {})",
        MAX_LOCK_KEY_LENGTH
    )
}

fn acquire_sql() -> String {
    format!("SELECT GET_LOCK({}, ?)", lock_key_expr())
}

fn release_sql() -> String {
    format!("SELECT RELEASE_LOCK({})", lock_key_expr())
}

/// Creates advisory locks on scope-pooled connections.
#[derive(Clone)]
pub struct LockFactory {
    pool: ConnectionPool,
}

impl LockFactory {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Acquire `name`, waiting at most `timeout` (whole seconds).
    ///
    /// Fails with [`Error::LockTimeout`] when another session kept the lock
    /// for the whole timeout. The scope's connection is released on every
    /// failure.
    pub async fn new_lock(
        &self,
        scope: &OperationScope,
        name: &str,
        timeout: Duration,
    ) -> Result<Lock> {
        let conn = self.pool.acquire(scope).await?;

        match acquire(&conn, name, timeout).await {
            Ok(()) => {
                tracing::debug!(operation = %scope.id(), lock = %name, "Lock acquired");
                Ok(Lock {
                    name: name.to_string(),
                    timeout,
                    conn: Some(conn),
                })
            }
            Err(e) => {
                tracing::debug!(operation = %scope.id(), lock = %name, error = %e, "Lock not acquired");
                let release = conn.release().await;
                with_cleanup(Err(e), release)
            }
        }
    }

    /// Release `name` from the scope's session without a [`Lock`] handle.
    ///
    /// Same outcomes as [`Lock::unlock`].
    pub async fn release(&self, scope: &OperationScope, name: &str) -> Result<()> {
        let conn = self.pool.acquire(scope).await?;
        let result = release(&conn, name).await;
        let cleanup = conn.release().await;
        with_cleanup(result, cleanup)
    }
}

async fn acquire(conn: &PooledConnection, name: &str, timeout: Duration) -> Result<()> {
    let params = [SqlValue::from(name), SqlValue::UInt(timeout.as_secs())];
    let row = conn
        .query_one(&acquire_sql(), &params)
        .await
        .map_err(|e| Error::database("acquire lock", e))?;

    match row.as_ref().and_then(|r| r.get(0)).and_then(SqlValue::as_i64) {
        Some(1) => Ok(()),
        Some(0) => Err(Error::LockTimeout {
            name: name.to_string(),
        }),
        _ => Err(Error::database(
            "acquire lock",
            DriverError::new(format!("lock `{}` could not be requested", name)),
        )),
    }
}

async fn release(conn: &PooledConnection, name: &str) -> Result<()> {
    let row = conn
        .query_one(&release_sql(), &[SqlValue::from(name)])
        .await
        .map_err(|e| Error::database("release lock", e))?;

    match row.as_ref().and_then(|r| r.get(0)).and_then(SqlValue::as_i64) {
        Some(1) => Ok(()),
        Some(0) => Err(Error::LockNotLocked {
            name: name.to_string(),
        }),
        _ => Err(Error::LockNotFound {
            name: name.to_string(),
        }),
    }
}

/// A held advisory lock.
///
/// Unlock with [`Lock::unlock`]; a lock dropped while held is released in
/// the background.
pub struct Lock {
    name: String,
    timeout: Duration,
    conn: Option<PooledConnection>,
}

impl Lock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Release the lock, then the connection that holds it.
    ///
    /// The connection is released even when the release call fails; both
    /// errors are reported.
    pub async fn unlock(mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Err(Error::LockNotFound {
                name: self.name.clone(),
            });
        };

        let result = release(&conn, &self.name).await;
        let cleanup = conn.release().await;
        if result.is_ok() {
            tracing::debug!(lock = %self.name, "Lock released");
        }
        with_cleanup(result, cleanup)
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("held", &self.conn.is_some())
            .finish()
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let name = std::mem::take(&mut self.name);
        tracing::warn!(lock = %name, "Lock dropped while held");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = release(&conn, &name).await;
                    if let Err(e) = with_cleanup(result, conn.release().await) {
                        tracing::error!(lock = %name, error = %e, "Failed to release dropped lock");
                    }
                });
            }
            Err(_) => {
                // The connection's own drop logs the leak
                tracing::error!(lock = %name, "No runtime to release dropped lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::FakeDatabase;
    use std::sync::Arc;
    use tokio_test::assert_ok;

    fn locks_over(db: &FakeDatabase) -> (LockFactory, ConnectionPool) {
        let pool = ConnectionPool::new(Arc::new(db.clone()));
        (LockFactory::new(pool.clone()), pool)
    }

    #[test]
    fn test_key_is_namespaced_and_bounded() {
        assert_eq!(
            acquire_sql(),
            "SELECT GET_LOCK(SUBSTRING(CONCAT(?, '.', DATABASE()), 1, 64), ?)"
        );
        assert_eq!(
            release_sql(),
            "SELECT RELEASE_LOCK(SUBSTRING(CONCAT(?, '.', DATABASE()), 1, 64))"
        );
    }

    #[tokio::test]
    async fn test_lock_round_trip() {
        let db = FakeDatabase::new();
        let (locks, pool) = locks_over(&db);
        let scope = OperationScope::new();

        let lock = locks
            .new_lock(&scope, "reindex", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(lock.name(), "reindex");
        assert!(db.is_locked("reindex"));
        assert_eq!(pool.ref_count(scope.id()).await, Some(1));

        assert_ok!(lock.unlock().await);
        assert!(!db.is_locked("reindex"));
        assert!(pool.is_empty().await);
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_nested_lock_on_same_scope_is_counted() {
        let db = FakeDatabase::new();
        let (locks, pool) = locks_over(&db);
        let scope = OperationScope::new();

        let outer = locks
            .new_lock(&scope, "rebuild", Duration::from_secs(1))
            .await
            .unwrap();
        let inner = locks
            .new_lock(&scope, "rebuild", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(db.lock_count("rebuild"), 2);
        assert_eq!(pool.ref_count(scope.id()).await, Some(2));

        assert_ok!(inner.unlock().await);
        assert!(db.is_locked("rebuild"));
        let err = locks
            .new_lock(&OperationScope::new(), "rebuild", Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::LockTimeout));

        assert_ok!(outer.unlock().await);
        assert!(!db.is_locked("rebuild"));
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_release_of_unknown_lock_is_not_found() {
        let db = FakeDatabase::new();
        let (locks, pool) = locks_over(&db);

        let err = locks
            .release(&OperationScope::new(), "never-taken")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::LockNotFound));
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_second_release_after_unlock_is_not_found() {
        let db = FakeDatabase::new();
        let (locks, _) = locks_over(&db);
        let scope = OperationScope::new();

        let lock = locks
            .new_lock(&scope, "report", Duration::from_secs(1))
            .await
            .unwrap();
        assert_ok!(lock.unlock().await);

        let err = locks.release(&scope, "report").await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::LockNotFound));
    }

    #[tokio::test]
    async fn test_release_from_other_session_is_not_locked() {
        let db = FakeDatabase::new();
        let (locks, _) = locks_over(&db);

        let lock = locks
            .new_lock(&OperationScope::new(), "billing", Duration::from_secs(1))
            .await
            .unwrap();

        let err = locks
            .release(&OperationScope::new(), "billing")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::LockNotLocked));
        assert!(db.is_locked("billing"));

        assert_ok!(lock.unlock().await);
    }

    #[tokio::test]
    async fn test_contended_lock_times_out() {
        let db = FakeDatabase::new();
        let (locks, pool) = locks_over(&db);

        let held = locks
            .new_lock(&OperationScope::new(), "deploy", Duration::from_secs(1))
            .await
            .unwrap();

        let loser = OperationScope::new();
        let err = locks
            .new_lock(&loser, "deploy", Duration::ZERO)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::LockTimeout));
        assert!(err.is_retryable());
        assert_eq!(pool.ref_count(loser.id()).await, None);
        assert_eq!(pool.len().await, 1);

        assert_ok!(held.unlock().await);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_holder_unlocks() {
        let db = FakeDatabase::new();
        let (locks, _) = locks_over(&db);

        let held = locks
            .new_lock(&OperationScope::new(), "sync", Duration::from_secs(1))
            .await
            .unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .new_lock(&OperationScope::new(), "sync", Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_ok!(held.unlock().await);

        let lock = waiter.await.unwrap().unwrap();
        assert_ok!(lock.unlock().await);
    }

    #[tokio::test]
    async fn test_timeout_joins_release_error() {
        let db = FakeDatabase::new();
        let (locks, pool) = locks_over(&db);
        db.fail_close(true);

        let holder = OperationScope::new();
        let held = locks
            .new_lock(&holder, "import", Duration::from_secs(1))
            .await
            .unwrap();

        let err = locks
            .new_lock(&OperationScope::new(), "import", Duration::ZERO)
            .await
            .unwrap_err();

        assert!(err.has(ErrorKind::LockTimeout));
        assert!(err.has(ErrorKind::ConnectionCloseFailed));
        assert_eq!(pool.len().await, 1);

        db.clear_failures();
        assert_ok!(held.unlock().await);
    }

    #[tokio::test]
    async fn test_dropped_lock_is_released() {
        let db = FakeDatabase::new();
        let (locks, pool) = locks_over(&db);

        let lock = locks
            .new_lock(&OperationScope::new(), "cleanup", Duration::from_secs(1))
            .await
            .unwrap();
        drop(lock);

        for _ in 0..10 {
            if pool.is_empty().await {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(!db.is_locked("cleanup"));
        assert!(pool.is_empty().await);
    }
}

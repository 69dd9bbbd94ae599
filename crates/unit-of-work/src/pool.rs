//! Scope-keyed, reference-counted connection pool.
//!
//! Every participant of one [`OperationScope`] shares the same physical
//! connection. The connection is handed back to the driver when the last
//! participant releases it.
//!
//! All map mutations happen under one mutex, which is also held while a new
//! physical connection is opened. Acquisitions for different scopes
//! therefore serialize against each other; a per-scope "first caller
//! creates, others await" slot would lift that.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::client::{Connection, QueryExecutor, Row, SqlValue, Transaction, TransactionalClient};
use crate::error::{DbResult, Error, Result};
use crate::scope::{OperationId, OperationScope};

struct PoolEntry {
    conn: Arc<dyn Connection>,
    count: usize,
}

struct PoolState {
    client: Arc<dyn TransactionalClient>,
    entries: Mutex<HashMap<OperationId, PoolEntry>>,
}

/// Pool mapping operation scopes to shared connections.
#[derive(Clone)]
pub struct ConnectionPool {
    state: Arc<PoolState>,
}

impl ConnectionPool {
    pub fn new(client: Arc<dyn TransactionalClient>) -> Self {
        Self {
            state: Arc::new(PoolState {
                client,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Join the scope's connection, opening it on first use.
    ///
    /// Opening fails with [`Error::Cancelled`] if the scope is cancelled
    /// first; nothing is inserted into the pool on any failure.
    pub async fn acquire(&self, scope: &OperationScope) -> Result<PooledConnection> {
        let id = scope.id();
        let mut entries = self.state.entries.lock().await;

        if let Some(entry) = entries.get_mut(&id) {
            entry.count += 1;
            tracing::debug!(operation = %id, participants = entry.count, "Joined pooled connection");
            return Ok(PooledConnection::new(self.clone(), id, entry.conn.clone()));
        }

        if scope.is_cancelled() {
            return Err(Error::Cancelled(id));
        }
        let conn = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(Error::Cancelled(id)),
            opened = self.state.client.connection() => opened.map_err(Error::ConnectionOpenFailed)?,
        };

        entries.insert(
            id,
            PoolEntry {
                conn: conn.clone(),
                count: 1,
            },
        );
        tracing::debug!(operation = %id, "Opened pooled connection");
        Ok(PooledConnection::new(self.clone(), id, conn))
    }

    async fn release(&self, id: OperationId) -> Result<()> {
        let mut entries = self.state.entries.lock().await;

        let count = match entries.get(&id) {
            Some(entry) => entry.count,
            None => {
                tracing::warn!(operation = %id, "Released a connection that is not pooled");
                return Ok(());
            }
        };

        if count > 1 {
            if let Some(entry) = entries.get_mut(&id) {
                entry.count -= 1;
            }
            return Ok(());
        }

        match entries.remove(&id) {
            Some(entry) => {
                tracing::debug!(operation = %id, "Closing pooled connection");
                entry.conn.close().await.map_err(Error::ConnectionCloseFailed)
            }
            None => Ok(()),
        }
    }

    /// Number of scopes holding a connection.
    pub async fn len(&self) -> usize {
        self.state.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Participants sharing the scope's connection.
    pub async fn ref_count(&self, id: OperationId) -> Option<usize> {
        self.state.entries.lock().await.get(&id).map(|entry| entry.count)
    }
}

/// A participant's handle on a pooled connection.
///
/// [`PooledConnection::release`] is a scoped release, not a close: the
/// physical connection closes once every participant has released it.
pub struct PooledConnection {
    pool: ConnectionPool,
    scope: OperationId,
    conn: Arc<dyn Connection>,
    released: bool,
}

impl PooledConnection {
    fn new(pool: ConnectionPool, scope: OperationId, conn: Arc<dyn Connection>) -> Self {
        Self {
            pool,
            scope,
            conn,
            released: false,
        }
    }

    pub fn scope(&self) -> OperationId {
        self.scope
    }

    /// Start a transaction on the shared connection.
    pub async fn begin(&self) -> DbResult<Arc<dyn Transaction>> {
        self.conn.begin().await
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.pool.release(self.scope).await
    }
}

#[async_trait]
impl QueryExecutor for PooledConnection {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        self.conn.execute(sql, params).await
    }

    async fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.conn.execute_batch(sql).await
    }

    async fn query_one(&self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>> {
        self.conn.query_one(sql, params).await
    }

    async fn query_all(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        self.conn.query_all(sql, params).await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!(operation = %self.scope, "Pooled connection dropped without release");

        let pool = self.pool.clone();
        let scope = self.scope;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = pool.release(scope).await {
                        tracing::error!(operation = %scope, error = %e, "Failed to release connection on drop");
                    }
                });
            }
            Err(_) => {
                tracing::error!(operation = %scope, "No runtime to release dropped connection");
            }
        }
    }
}

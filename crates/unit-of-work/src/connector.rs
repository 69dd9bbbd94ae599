//! MySQL connector.
//!
//! Opens the sea-orm handle, then hands out dedicated sessions from the
//! underlying sqlx pool. Transactions are driven with plain
//! `START TRANSACTION` / `COMMIT` / `ROLLBACK` on the session so that an
//! advisory lock and a transaction taken for the same scope share one
//! session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::DatabaseConfig;
use sea_orm::{ConnectOptions, Database as SeaDatabase, DatabaseConnection};
use sqlx::mysql::{MySql, MySqlArguments, MySqlPool, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Executor, Row as _};
use tokio::sync::Mutex;

use crate::client::{Connection, QueryExecutor, Row, SqlValue, Transaction, TransactionalClient};
use crate::error::{with_cleanup, DbResult, DriverError, Error, Result};

/// Owner of the MySQL database handle.
pub struct MySqlConnector {
    db: DatabaseConnection,
}

impl MySqlConnector {
    /// Open the database handle and verify it with a ping.
    ///
    /// A failed ping closes the handle again; both errors are reported.
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        let mut options = ConnectOptions::new(config.dsn.to_url());
        options
            .max_connections(config.max_connections)
            .max_lifetime(config.connection_lifetime)
            .sqlx_logging(false);

        let db = SeaDatabase::connect(options)
            .await
            .map_err(|e| Error::ConnectionOpenFailed(e.into()))?;

        if let Err(ping_err) = db.ping().await {
            let ping_err = Error::ConnectionOpenFailed(ping_err.into());
            let close = db
                .close()
                .await
                .map_err(|e| Error::ConnectionCloseFailed(e.into()));
            return with_cleanup(Err(ping_err), close);
        }

        tracing::info!(dsn = %config.dsn, "Database connected");
        Ok(Self { db })
    }

    /// The sea-orm handle, for ORM-style access outside the coordination layer.
    pub fn database(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Client producing dedicated sessions.
    pub fn client(&self) -> Arc<dyn TransactionalClient> {
        Arc::new(MySqlClient {
            pool: self.db.get_mysql_connection_pool().clone(),
        })
    }

    /// Check database connectivity.
    pub async fn ping(&self) -> Result<()> {
        self.db
            .ping()
            .await
            .map_err(|e| Error::database("ping database", e.into()))
    }

    pub async fn close(self) -> Result<()> {
        self.db
            .close()
            .await
            .map_err(|e| Error::ConnectionCloseFailed(e.into()))
    }
}

struct MySqlClient {
    pool: MySqlPool,
}

#[async_trait]
impl TransactionalClient for MySqlClient {
    async fn connection(&self) -> DbResult<Arc<dyn Connection>> {
        let conn = self.pool.acquire().await?;
        Ok(Arc::new(MySqlSession {
            slot: Arc::new(Mutex::new(Some(conn))),
            in_transaction: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// Session slot shared by a connection and its transactions.
type Slot = Arc<Mutex<Option<PoolConnection<MySql>>>>;

fn closed() -> DriverError {
    DriverError::new("connection is closed")
}

fn bind<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &'q [SqlValue],
) -> Query<'q, MySql, MySqlArguments> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::UInt(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.as_str()),
            SqlValue::Bytes(v) => query.bind(v.as_slice()),
        };
    }
    query
}

fn decode_row(row: &MySqlRow) -> DbResult<Row> {
    (0..row.len())
        .map(|idx| decode_column(row, idx))
        .collect::<DbResult<Vec<_>>>()
        .map(Row::new)
}

fn decode_column(row: &MySqlRow, idx: usize) -> DbResult<SqlValue> {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return Ok(v.map_or(SqlValue::Null, SqlValue::Int));
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return Ok(v.map_or(SqlValue::Null, SqlValue::UInt));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return Ok(v.map_or(SqlValue::Null, SqlValue::Float));
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return Ok(v.map_or(SqlValue::Null, SqlValue::Text));
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return Ok(v.map_or(SqlValue::Null, SqlValue::Bytes));
    }
    Err(DriverError::new(format!(
        "unsupported column type at index {}",
        idx
    )))
}

async fn execute(slot: &Slot, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
    let mut guard = slot.lock().await;
    let conn = guard.as_mut().ok_or_else(closed)?;
    let result = bind(sqlx::query(sql), params).execute(&mut **conn).await?;
    Ok(result.rows_affected())
}

async fn execute_batch(slot: &Slot, sql: &str) -> DbResult<()> {
    let mut guard = slot.lock().await;
    let conn = guard.as_mut().ok_or_else(closed)?;
    (&mut **conn).execute(sql).await?;
    Ok(())
}

async fn query_one(slot: &Slot, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>> {
    let mut guard = slot.lock().await;
    let conn = guard.as_mut().ok_or_else(closed)?;
    let row = bind(sqlx::query(sql), params)
        .fetch_optional(&mut **conn)
        .await?;
    row.as_ref().map(decode_row).transpose()
}

async fn query_all(slot: &Slot, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
    let mut guard = slot.lock().await;
    let conn = guard.as_mut().ok_or_else(closed)?;
    let rows = bind(sqlx::query(sql), params).fetch_all(&mut **conn).await?;
    rows.iter().map(decode_row).collect()
}

/// A dedicated MySQL session.
///
/// The driver does not see the raw transaction statements, so the session
/// tracks an open transaction itself and cleans up before handing the
/// connection back to the driver pool.
struct MySqlSession {
    slot: Slot,
    in_transaction: Arc<AtomicBool>,
}

/// Roll back an abandoned transaction and drop any advisory locks still
/// held by the session.
async fn reset(conn: &mut PoolConnection<MySql>, in_transaction: bool) -> DbResult<()> {
    if in_transaction {
        (&mut **conn).execute("ROLLBACK").await?;
    }
    (&mut **conn).execute("DO RELEASE_ALL_LOCKS()").await?;
    Ok(())
}

#[async_trait]
impl QueryExecutor for MySqlSession {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        execute(&self.slot, sql, params).await
    }

    async fn execute_batch(&self, sql: &str) -> DbResult<()> {
        execute_batch(&self.slot, sql).await
    }

    async fn query_one(&self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>> {
        query_one(&self.slot, sql, params).await
    }

    async fn query_all(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        query_all(&self.slot, sql, params).await
    }
}

#[async_trait]
impl Connection for MySqlSession {
    async fn begin(&self) -> DbResult<Arc<dyn Transaction>> {
        execute_batch(&self.slot, "START TRANSACTION").await?;
        self.in_transaction.store(true, Ordering::Release);
        Ok(Arc::new(MySqlTransaction {
            slot: self.slot.clone(),
            in_transaction: self.in_transaction.clone(),
            finished: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> DbResult<()> {
        let mut conn = self.slot.lock().await.take().ok_or_else(closed)?;
        let in_transaction = self.in_transaction.swap(false, Ordering::AcqRel);
        if in_transaction {
            tracing::warn!("Rolling back transaction left open on a closing session");
        }

        // A session that cannot be reset is discarded instead of recycled
        if let Err(e) = reset(&mut conn, in_transaction).await {
            tracing::warn!(error = %e, "Discarding session that could not be reset");
            conn.close().await?;
        }
        Ok(())
    }
}

/// Transaction running on a [`MySqlSession`].
struct MySqlTransaction {
    slot: Slot,
    in_transaction: Arc<AtomicBool>,
    finished: AtomicBool,
}

impl MySqlTransaction {
    fn ensure_active(&self) -> DbResult<()> {
        if self.finished.load(Ordering::Acquire) {
            return Err(DriverError::new("transaction has already been completed"));
        }
        Ok(())
    }

    async fn finish(&self, statement: &str) -> DbResult<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(DriverError::new("transaction has already been completed"));
        }
        let result = execute_batch(&self.slot, statement).await;
        // Stays set on failure so close() rolls back again
        if result.is_ok() {
            self.in_transaction.store(false, Ordering::Release);
        }
        result
    }
}

#[async_trait]
impl QueryExecutor for MySqlTransaction {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        self.ensure_active()?;
        execute(&self.slot, sql, params).await
    }

    async fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.ensure_active()?;
        execute_batch(&self.slot, sql).await
    }

    async fn query_one(&self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>> {
        self.ensure_active()?;
        query_one(&self.slot, sql, params).await
    }

    async fn query_all(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        self.ensure_active()?;
        query_all(&self.slot, sql, params).await
    }
}

#[async_trait]
impl Transaction for MySqlTransaction {
    async fn commit(&self) -> DbResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(&self) -> DbResult<()> {
        self.finish("ROLLBACK").await
    }
}

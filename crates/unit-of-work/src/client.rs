//! Driver boundary: query execution, connections and transactions.
//!
//! The coordination layer only talks to the database through these traits.
//! [`crate::connector`] implements them for MySQL; the `testing` module
//! (feature `test-utils`) provides an in-memory fake.

use std::sync::Arc;

use async_trait::async_trait;

#[cfg(any(test, feature = "test-utils"))]
use mockall::automock;

use crate::error::{DbResult, DriverError};

/// A single bound parameter or decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Integer view of the value, if it has one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::UInt(v) => i64::try_from(*v).ok(),
            SqlValue::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(i64::from(v))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::UInt(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// One result row, columns in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, idx: usize) -> Option<&SqlValue> {
        self.values.get(idx)
    }

    /// Decode column `idx`.
    pub fn try_get<T: FromSqlValue>(&self, idx: usize) -> DbResult<T> {
        let value = self
            .values
            .get(idx)
            .ok_or_else(|| DriverError::new(format!("column index {} out of range", idx)))?;
        T::from_sql_value(value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }
}

/// Conversion from a single column value.
pub trait FromSqlValue: Sized {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self>;
}

fn mismatch(expected: &str, value: &SqlValue) -> DriverError {
    DriverError::new(format!("cannot decode {:?} as {}", value, expected))
}

impl FromSqlValue for i64 {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        value.as_i64().ok_or_else(|| mismatch("i64", value))
    }
}

impl FromSqlValue for u64 {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::UInt(v) => Ok(*v),
            SqlValue::Int(v) => u64::try_from(*v).map_err(|_| mismatch("u64", value)),
            _ => Err(mismatch("u64", value)),
        }
    }
}

impl FromSqlValue for bool {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Bool(v) => Ok(*v),
            other => other
                .as_i64()
                .map(|v| v != 0)
                .ok_or_else(|| mismatch("bool", value)),
        }
    }
}

impl FromSqlValue for f64 {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Float(v) => Ok(*v),
            SqlValue::Int(v) => Ok(*v as f64),
            SqlValue::UInt(v) => Ok(*v as f64),
            _ => Err(mismatch("f64", value)),
        }
    }
}

impl FromSqlValue for String {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Text(v) => Ok(v.clone()),
            SqlValue::Bytes(v) => String::from_utf8(v.clone()).map_err(|_| mismatch("String", value)),
            SqlValue::Int(v) => Ok(v.to_string()),
            SqlValue::UInt(v) => Ok(v.to_string()),
            _ => Err(mismatch("String", value)),
        }
    }
}

impl FromSqlValue for Vec<u8> {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Bytes(v) => Ok(v.clone()),
            SqlValue::Text(v) => Ok(v.clone().into_bytes()),
            _ => Err(mismatch("bytes", value)),
        }
    }
}

impl<T: FromSqlValue> FromSqlValue for Option<T> {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_sql_value(value).map(Some)
        }
    }
}

/// Conversion from a whole row (select-into target).
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> DbResult<Self>;
}

macro_rules! scalar_from_row {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromRow for $ty {
                fn from_row(row: &Row) -> DbResult<Self> {
                    row.try_get(0)
                }
            }
        )*
    };
}

scalar_from_row!(
    i64,
    u64,
    bool,
    f64,
    String,
    Vec<u8>,
    Option<i64>,
    Option<u64>,
    Option<bool>,
    Option<f64>,
    Option<String>,
);

impl<A: FromSqlValue, B: FromSqlValue> FromRow for (A, B) {
    fn from_row(row: &Row) -> DbResult<Self> {
        Ok((row.try_get(0)?, row.try_get(1)?))
    }
}

impl<A: FromSqlValue, B: FromSqlValue, C: FromSqlValue> FromRow for (A, B, C) {
    fn from_row(row: &Row) -> DbResult<Self> {
        Ok((row.try_get(0)?, row.try_get(1)?, row.try_get(2)?))
    }
}

impl FromRow for Row {
    fn from_row(row: &Row) -> DbResult<Self> {
        Ok(row.clone())
    }
}

/// Statement execution against a connection or transaction.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Execute one prepared statement, returning the affected row count.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64>;

    /// Execute unprepared SQL that may hold several statements.
    async fn execute_batch(&self, sql: &str) -> DbResult<()>;

    /// First row of the result set, if any.
    async fn query_one(&self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>>;

    async fn query_all(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>>;
}

/// Typed helpers over any [`QueryExecutor`].
#[async_trait]
pub trait QueryExecutorExt: QueryExecutor {
    /// Decode exactly one row; fails when the query matched nothing.
    async fn get<T: FromRow + Send>(&self, sql: &str, params: &[SqlValue]) -> DbResult<T> {
        let row = self
            .query_one(sql, params)
            .await?
            .ok_or_else(DriverError::no_rows)?;
        T::from_row(&row)
    }

    /// Decode every row.
    async fn select<T: FromRow + Send>(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<T>> {
        self.query_all(sql, params)
            .await?
            .iter()
            .map(T::from_row)
            .collect()
    }
}

impl<E: QueryExecutor + ?Sized> QueryExecutorExt for E {}

/// An open transaction on one physical connection.
#[async_trait]
pub trait Transaction: QueryExecutor {
    async fn commit(&self) -> DbResult<()>;

    async fn rollback(&self) -> DbResult<()>;
}

/// One physical connection (database session).
#[async_trait]
pub trait Connection: QueryExecutor {
    /// Start a transaction on this session.
    async fn begin(&self) -> DbResult<Arc<dyn Transaction>>;

    /// Hand the session back to the driver.
    async fn close(&self) -> DbResult<()>;
}

/// Source of new physical connections.
#[cfg_attr(any(test, feature = "test-utils"), automock)]
#[async_trait]
pub trait TransactionalClient: Send + Sync {
    async fn connection(&self) -> DbResult<Arc<dyn Connection>>;
}

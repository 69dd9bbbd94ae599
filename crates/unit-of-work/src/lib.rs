//! Transaction coordination over a single MySQL database.
//!
//! Concurrent participants of one logical operation share a connection and
//! a transaction keyed by their [`OperationScope`]:
//!
//! - [`ConnectionPool`]: reference-counted connection per scope
//! - [`UnitOfWorkFactory`]: shared transaction per scope, committed or
//!   rolled back by its last participant
//! - [`LockFactory`]: named advisory locks on the scope's session
//! - [`LockableUnitOfWorkFactory`]: unit of work held under a lock
//! - [`Migrator`]: exactly-once schema migrations across replicas
//!
//! [`Database`] wires all of them over one driver.

pub mod client;
pub mod connector;
pub mod database;
pub mod error;
pub mod lock;
pub mod lockable;
pub mod migrator;
pub mod pool;
pub mod scope;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod unit_of_work;

pub use client::{
    Connection, FromRow, FromSqlValue, QueryExecutor, QueryExecutorExt, Row, SqlValue,
    Transaction, TransactionalClient,
};
pub use connector::MySqlConnector;
pub use database::Database;
pub use error::{DbResult, DriverError, Error, ErrorKind, Result};
pub use lock::{Lock, LockFactory};
pub use lockable::{LockableUnitOfWork, LockableUnitOfWorkFactory};
pub use migrator::{Migration, MigrationReport, MigrationStatus, Migrator};
pub use pool::{ConnectionPool, PooledConnection};
pub use scope::{OperationId, OperationScope, ScopeCanceller};
pub use unit_of_work::{Client, CompletionObserver, TracingObserver, UnitOfWork, UnitOfWorkFactory};

#[cfg(any(test, feature = "test-utils"))]
pub use client::MockTransactionalClient;

//! Error types for the coordination layer.
//!
//! Every cleanup step (connection release, lock release) that runs after a
//! primary failure joins its own error with the primary one instead of
//! replacing it, so callers can inspect each cause independently.

use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::scope::OperationId;

/// Boxed error used for foreign failures.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Failure reported by the database driver.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DriverError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Error for `get`-style lookups that matched nothing.
    pub fn no_rows() -> Self {
        Self::new("no rows in result set")
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        Self::with_source(err.to_string(), err)
    }
}

impl From<sea_orm::DbErr> for DriverError {
    fn from(err: sea_orm::DbErr) -> Self {
        Self::with_source(err.to_string(), err)
    }
}

/// Coordination layer errors.
#[derive(Debug, Error)]
pub enum Error {
    // Connection & transaction lifecycle
    #[error("failed to open database connection: {0}")]
    ConnectionOpenFailed(#[source] DriverError),

    #[error("failed to begin transaction: {0}")]
    TransactionBeginFailed(#[source] DriverError),

    #[error("failed to commit transaction: {0}")]
    CommitFailed(#[source] DriverError),

    #[error("failed to roll back transaction: {0}")]
    RollbackFailed(#[source] DriverError),

    #[error("failed to close database connection: {0}")]
    ConnectionCloseFailed(#[source] DriverError),

    // Advisory locks
    #[error("timed out acquiring lock `{name}`")]
    LockTimeout { name: String },

    #[error("lock `{name}` is held by another session")]
    LockNotLocked { name: String },

    #[error("lock `{name}` does not exist")]
    LockNotFound { name: String },

    // Migrations
    #[error("failed to read migration source {}: {source}", path.display())]
    MigrationReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("migration {version} failed: {source}")]
    MigrationExecFailed {
        version: String,
        #[source]
        source: DriverError,
    },

    #[error("failed to record migration {version}: {source}")]
    LedgerWriteFailed {
        version: String,
        #[source]
        source: DriverError,
    },

    #[error("migration version {version} is defined more than once")]
    DuplicateMigration { version: String },

    // Generic database failure with context
    #[error("{context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: DriverError,
    },

    #[error("operation {0} was cancelled")]
    Cancelled(OperationId),

    /// Caller-side failure that forces a rollback
    #[error("operation aborted: {0}")]
    Aborted(#[source] BoxError),

    #[error("{}", DisplayAll(.0))]
    Multiple(Vec<Error>),
}

/// Discriminant of a leaf [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionOpenFailed,
    TransactionBeginFailed,
    CommitFailed,
    RollbackFailed,
    ConnectionCloseFailed,
    LockTimeout,
    LockNotLocked,
    LockNotFound,
    MigrationReadFailed,
    MigrationExecFailed,
    LedgerWriteFailed,
    DuplicateMigration,
    Database,
    Cancelled,
    Aborted,
}

impl Error {
    /// Wrap a database failure with a short description of the operation.
    pub fn database(context: &'static str, source: DriverError) -> Self {
        Error::Database { context, source }
    }

    /// Wrap a caller-side failure.
    pub fn aborted(source: impl Into<BoxError>) -> Self {
        Error::Aborted(source.into())
    }

    /// Join errors into one, flattening nested aggregates.
    ///
    /// Returns `None` when there is nothing to join and the bare error when
    /// exactly one cause remains.
    pub fn join(errors: impl IntoIterator<Item = Error>) -> Option<Error> {
        let mut causes = Vec::new();
        for err in errors {
            match err {
                Error::Multiple(inner) => causes.extend(inner),
                other => causes.push(other),
            }
        }
        match causes.len() {
            0 => None,
            1 => causes.pop(),
            _ => Some(Error::Multiple(causes)),
        }
    }

    /// Kind of a leaf error; `None` for aggregates.
    pub fn kind(&self) -> Option<ErrorKind> {
        let kind = match self {
            Error::ConnectionOpenFailed(_) => ErrorKind::ConnectionOpenFailed,
            Error::TransactionBeginFailed(_) => ErrorKind::TransactionBeginFailed,
            Error::CommitFailed(_) => ErrorKind::CommitFailed,
            Error::RollbackFailed(_) => ErrorKind::RollbackFailed,
            Error::ConnectionCloseFailed(_) => ErrorKind::ConnectionCloseFailed,
            Error::LockTimeout { .. } => ErrorKind::LockTimeout,
            Error::LockNotLocked { .. } => ErrorKind::LockNotLocked,
            Error::LockNotFound { .. } => ErrorKind::LockNotFound,
            Error::MigrationReadFailed { .. } => ErrorKind::MigrationReadFailed,
            Error::MigrationExecFailed { .. } => ErrorKind::MigrationExecFailed,
            Error::LedgerWriteFailed { .. } => ErrorKind::LedgerWriteFailed,
            Error::DuplicateMigration { .. } => ErrorKind::DuplicateMigration,
            Error::Database { .. } => ErrorKind::Database,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Aborted(_) => ErrorKind::Aborted,
            Error::Multiple(_) => return None,
        };
        Some(kind)
    }

    /// Leaf causes in the order they were joined.
    pub fn causes(&self) -> Vec<&Error> {
        match self {
            Error::Multiple(inner) => inner.iter().flat_map(Error::causes).collect(),
            leaf => vec![leaf],
        }
    }

    /// Whether any cause is of the given kind.
    pub fn has(&self, kind: ErrorKind) -> bool {
        self.causes().iter().any(|err| err.kind() == Some(kind))
    }

    /// Lock timeouts can be retried; database failures can not.
    pub fn is_retryable(&self) -> bool {
        self.has(ErrorKind::LockTimeout)
    }
}

/// Combine a primary result with the outcome of a cleanup step.
pub(crate) fn with_cleanup<T>(primary: Result<T>, cleanup: Result<()>) -> Result<T> {
    match (primary, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) | (Err(err), Ok(())) => Err(err),
        (Err(primary), Err(cleanup)) => Err(join_pair(primary, cleanup)),
    }
}

/// Join two errors, flattening nested aggregates.
pub(crate) fn join_pair(primary: Error, cleanup: Error) -> Error {
    let mut causes = Vec::new();
    for err in [primary, cleanup] {
        match err {
            Error::Multiple(inner) => causes.extend(inner),
            other => causes.push(other),
        }
    }
    Error::Multiple(causes)
}

struct DisplayAll<'a>(&'a [Error]);

impl fmt::Display for DisplayAll<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, err) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for driver calls
pub type DbResult<T> = std::result::Result<T, DriverError>;

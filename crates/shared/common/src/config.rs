//! Shared configuration structures.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CONNECTION_LIFETIME, DEFAULT_DATABASE_HOST, DEFAULT_DATABASE_NAME,
    DEFAULT_DATABASE_USER, DEFAULT_LOCK_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MIGRATIONS_DIR, DEFAULT_MIGRATION_LOCK_NAME,
};

/// MySQL data source name.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Dsn {
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Host with optional port (e.g. "db.internal:3306")
    pub host: String,
    pub database: String,
}

impl Dsn {
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            host: host.into(),
            database: database.into(),
        }
    }

    /// Connection URL understood by the MySQL driver.
    ///
    /// User and password are percent-encoded so reserved characters such as
    /// `@` or `#` survive URL parsing.
    pub fn to_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}/{}?charset=utf8mb4&collation=utf8mb4_unicode_ci",
            urlencoding::encode(&self.user),
            urlencoding::encode(&self.password),
            self.host,
            self.database
        )
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mysql://{}:***@{}/{}", self.user, self.host, self.database)
    }
}

impl fmt::Debug for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dsn")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("host", &self.host)
            .field("database", &self.database)
            .finish()
    }
}

impl Default for Dsn {
    fn default() -> Self {
        Self::new(
            DEFAULT_DATABASE_USER,
            "",
            DEFAULT_DATABASE_HOST,
            DEFAULT_DATABASE_NAME,
        )
    }
}

/// Database connection and driver pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub dsn: Dsn,
    /// Upper bound of physical connections kept by the driver
    pub max_connections: u32,
    /// Maximum lifetime of a physical connection
    pub connection_lifetime: Duration,
}

impl DatabaseConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Dsn::default();
        Self {
            dsn: Dsn {
                user: env::var("DATABASE_USER").unwrap_or(defaults.user),
                password: env::var("DATABASE_PASSWORD").unwrap_or(defaults.password),
                host: env::var("DATABASE_HOST").unwrap_or(defaults.host),
                database: env::var("DATABASE_NAME").unwrap_or(defaults.database),
            },
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            connection_lifetime: env::var("DATABASE_CONNECTION_LIFETIME_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CONNECTION_LIFETIME),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: Dsn::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_lifetime: DEFAULT_CONNECTION_LIFETIME,
        }
    }
}

/// Migration runner configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MigrationConfig {
    /// Directory holding `<version>_<description>.sql` files
    pub directory: PathBuf,
    /// Advisory lock concurrent runs contend on
    pub lock_name: String,
    pub lock_timeout: Duration,
    /// Only pick up `*.up.sql` files
    pub up_only: bool,
}

impl MigrationConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            directory: env::var("MIGRATIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_MIGRATIONS_DIR)),
            lock_name: env::var("MIGRATIONS_LOCK_NAME")
                .unwrap_or_else(|_| DEFAULT_MIGRATION_LOCK_NAME.to_string()),
            lock_timeout: env::var("MIGRATIONS_LOCK_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_LOCK_TIMEOUT),
            up_only: env::var("MIGRATIONS_UP_ONLY")
                .ok()
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_MIGRATIONS_DIR),
            lock_name: DEFAULT_MIGRATION_LOCK_NAME.to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            up_only: false,
        }
    }
}

//! Application-wide constants
//!
//! Centralized location for magic values to improve maintainability.

use std::time::Duration;

// =============================================================================
// Database
// =============================================================================

/// Default database user
pub const DEFAULT_DATABASE_USER: &str = "root";

/// Default database host (host:port)
pub const DEFAULT_DATABASE_HOST: &str = "127.0.0.1:3306";

/// Default database (schema) name
pub const DEFAULT_DATABASE_NAME: &str = "app";

/// Default upper bound of open connections held by the driver pool
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default maximum lifetime of a driver connection
pub const DEFAULT_CONNECTION_LIFETIME: Duration = Duration::from_secs(300);

// =============================================================================
// Locks & Migrations
// =============================================================================

/// Default timeout for acquiring a named advisory lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Lock name migration runs contend on
pub const DEFAULT_MIGRATION_LOCK_NAME: &str = "migrations";

/// Default directory holding migration files
pub const DEFAULT_MIGRATIONS_DIR: &str = "migrations";

/// Table recording applied migration versions
pub const MIGRATION_LEDGER_TABLE: &str = "migration_versions";

/// Maximum key length accepted by the advisory lock primitive
pub const MAX_LOCK_KEY_LENGTH: usize = 64;

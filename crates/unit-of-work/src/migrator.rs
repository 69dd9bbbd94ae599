//! Schema migration runner.
//!
//! Migrations are plain SQL files in one directory. A file's version is the
//! part of its name before the first `_` (`001_create_users.sql` → `001`),
//! and files are applied in filename order. Applied versions are recorded
//! in a ledger table.
//!
//! A run happens inside one lock-guarded unit of work: replicas starting
//! together contend for the migration lock, and whoever comes second sees
//! every version already recorded. A failing migration rolls the whole run
//! back, ledger entries included.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use common::{MigrationConfig, MIGRATION_LEDGER_TABLE};

use crate::client::{QueryExecutor, QueryExecutorExt, SqlValue};
use crate::error::{Error, Result};
use crate::lockable::LockableUnitOfWorkFactory;
use crate::scope::OperationScope;
use crate::unit_of_work::Client;

/// A migration file discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: String,
    pub path: PathBuf,
}

/// Outcome of [`Migrator::migrate_up`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Versions applied by this run, in order
    pub applied: Vec<String>,
    /// Migrations that were already recorded
    pub skipped: usize,
}

impl MigrationReport {
    pub fn is_up_to_date(&self) -> bool {
        self.applied.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: String,
    pub path: PathBuf,
    pub applied: bool,
}

/// Version of a migration file: everything before the first `_`.
pub fn version_from_filename(filename: &str) -> &str {
    filename.split('_').next().unwrap_or(filename)
}

pub struct Migrator {
    factory: LockableUnitOfWorkFactory,
    config: MigrationConfig,
}

impl Migrator {
    pub fn new(factory: LockableUnitOfWorkFactory, config: MigrationConfig) -> Self {
        Self { factory, config }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Apply every migration not yet recorded in the ledger.
    pub async fn migrate_up(&self, scope: &OperationScope) -> Result<MigrationReport> {
        tracing::info!(
            directory = %self.config.directory.display(),
            lock = %self.config.lock_name,
            "Running migrations"
        );

        let uow = self
            .factory
            .begin(scope, &self.config.lock_name, self.config.lock_timeout)
            .await?;
        let result = self.apply_pending(&uow.client()).await;
        let report = uow.complete(result).await?;

        tracing::info!(
            applied = report.applied.len(),
            skipped = report.skipped,
            "Migrations complete"
        );
        Ok(report)
    }

    /// Every migration on disk with its applied flag.
    ///
    /// Read under the migration lock so the answer is consistent with a
    /// concurrent run.
    pub async fn status(&self, scope: &OperationScope) -> Result<Vec<MigrationStatus>> {
        let uow = self
            .factory
            .begin(scope, &self.config.lock_name, self.config.lock_timeout)
            .await?;
        let result = self.read_status(&uow.client()).await;
        uow.complete(result).await
    }

    /// Migrations in the configured directory, in application order.
    ///
    /// Directories and dotfiles are skipped; with `up_only` set, only
    /// `*.up.*` files are considered. Two files with the same version are
    /// rejected.
    pub async fn list_migrations(&self) -> Result<Vec<Migration>> {
        let dir = &self.config.directory;
        let read_failed = |source| Error::MigrationReadFailed {
            path: dir.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(dir).await.map_err(read_failed)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_failed)? {
            if entry.file_type().await.map_err(read_failed)?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || (self.config.up_only && !name.contains(".up.")) {
                continue;
            }
            names.push(name);
        }
        names.sort();

        let mut seen = HashSet::new();
        let mut migrations = Vec::with_capacity(names.len());
        for name in names {
            let version = version_from_filename(&name).to_string();
            if !seen.insert(version.clone()) {
                return Err(Error::DuplicateMigration { version });
            }
            migrations.push(Migration {
                version,
                path: dir.join(&name),
            });
        }
        Ok(migrations)
    }

    async fn apply_pending(&self, client: &Client<'_>) -> Result<MigrationReport> {
        ensure_ledger(client).await?;
        let migrations = self.list_migrations().await?;
        let applied = applied_versions(client).await?;

        let mut report = MigrationReport::default();
        for migration in migrations {
            if applied.contains(&migration.version) {
                report.skipped += 1;
                continue;
            }
            apply(client, &migration).await?;
            report.applied.push(migration.version);
        }
        Ok(report)
    }

    async fn read_status(&self, client: &Client<'_>) -> Result<Vec<MigrationStatus>> {
        ensure_ledger(client).await?;
        let migrations = self.list_migrations().await?;
        let applied = applied_versions(client).await?;

        Ok(migrations
            .into_iter()
            .map(|m| MigrationStatus {
                applied: applied.contains(&m.version),
                version: m.version,
                path: m.path,
            })
            .collect())
    }
}

async fn ensure_ledger(client: &Client<'_>) -> Result<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (version VARCHAR(50) NOT NULL)",
        MIGRATION_LEDGER_TABLE
    );
    client
        .execute(&sql, &[])
        .await
        .map(|_| ())
        .map_err(|e| Error::database("create migration ledger", e))
}

async fn applied_versions(client: &Client<'_>) -> Result<HashSet<String>> {
    let sql = format!("SELECT version FROM {}", MIGRATION_LEDGER_TABLE);
    let versions: Vec<String> = client
        .select(&sql, &[])
        .await
        .map_err(|e| Error::database("list applied migrations", e))?;
    Ok(versions.into_iter().collect())
}

async fn apply(client: &Client<'_>, migration: &Migration) -> Result<()> {
    tracing::info!(version = %migration.version, path = %migration.path.display(), "Applying migration");

    let body = read_body(&migration.path).await?;
    client
        .execute_batch(&body)
        .await
        .map_err(|source| Error::MigrationExecFailed {
            version: migration.version.clone(),
            source,
        })?;

    let sql = format!("INSERT INTO {} SET version = ?", MIGRATION_LEDGER_TABLE);
    client
        .execute(&sql, &[SqlValue::from(migration.version.as_str())])
        .await
        .map_err(|source| Error::LedgerWriteFailed {
            version: migration.version.clone(),
            source,
        })?;
    Ok(())
}

async fn read_body(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| Error::MigrationReadFailed {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::lock::LockFactory;
    use crate::pool::ConnectionPool;
    use crate::testing::FakeDatabase;
    use crate::unit_of_work::UnitOfWorkFactory;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn migrator(db: &FakeDatabase, config: MigrationConfig) -> Migrator {
        let pool = ConnectionPool::new(Arc::new(db.clone()));
        let factory =
            LockableUnitOfWorkFactory::new(LockFactory::new(pool.clone()), UnitOfWorkFactory::new(pool));
        Migrator::new(factory, config)
    }

    fn write(dir: &TempDir, name: &str, body: &str) {
        fs::write(dir.path().join(name), body).unwrap();
    }

    #[test]
    fn test_version_from_filename() {
        assert_eq!(version_from_filename("001_create_users.sql"), "001");
        assert_eq!(version_from_filename("20240101120000_init.up.sql"), "20240101120000");
        assert_eq!(version_from_filename("002.sql"), "002.sql");
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_skips_directories() {
        let dir = TempDir::new().unwrap();
        write(&dir, "002_add_index.sql", "CREATE INDEX i ON t (c)");
        write(&dir, "001_init.sql", "CREATE TABLE t (c INT)");
        write(&dir, ".gitkeep", "");
        fs::create_dir(dir.path().join("003_nested")).unwrap();

        let migrator = migrator(&FakeDatabase::new(), MigrationConfig::new(dir.path()));
        let migrations = migrator.list_migrations().await.unwrap();

        let versions: Vec<_> = migrations.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(versions, vec!["001", "002"]);
        assert_eq!(migrations[0].path, dir.path().join("001_init.sql"));
    }

    #[tokio::test]
    async fn test_up_only_filters_down_files() {
        let dir = TempDir::new().unwrap();
        write(&dir, "001_init.up.sql", "CREATE TABLE t (c INT)");
        write(&dir, "001_init.down.sql", "DROP TABLE t");

        let mut config = MigrationConfig::new(dir.path());
        config.up_only = true;
        let migrations = migrator(&FakeDatabase::new(), config)
            .list_migrations()
            .await
            .unwrap();

        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].path, dir.path().join("001_init.up.sql"));
    }

    #[tokio::test]
    async fn test_duplicate_versions_are_rejected() {
        let dir = TempDir::new().unwrap();
        write(&dir, "001_init.sql", "CREATE TABLE a (c INT)");
        write(&dir, "001_other.sql", "CREATE TABLE b (c INT)");

        let err = migrator(&FakeDatabase::new(), MigrationConfig::new(dir.path()))
            .list_migrations()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::DuplicateMigration));
        assert!(err.to_string().contains("001"));
    }

    #[tokio::test]
    async fn test_missing_directory_is_a_read_failure() {
        let dir = TempDir::new().unwrap();
        let db = FakeDatabase::new();
        let migrator = migrator(&db, MigrationConfig::new(dir.path().join("absent")));

        let err = migrator.migrate_up(&OperationScope::new()).await.unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::MigrationReadFailed));
        assert_eq!(db.rollbacks(), 1);
        assert!(!db.is_locked(&migrator.config().lock_name));
    }

    #[tokio::test]
    async fn test_ledger_write_failure_names_version() {
        let dir = TempDir::new().unwrap();
        write(&dir, "001_init.sql", "CREATE TABLE t (c INT)");
        let db = FakeDatabase::new();
        db.fail_statements_containing("SET version");

        let err = migrator(&db, MigrationConfig::new(dir.path()))
            .migrate_up(&OperationScope::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::LedgerWriteFailed));
        assert!(err.to_string().contains("001"));
        assert!(db.ledger().is_empty());
    }
}

//! Migration runs against the in-memory database.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_test::assert_ok;

use common::MigrationConfig;
use unit_of_work::testing::FakeDatabase;
use unit_of_work::{Database, ErrorKind, OperationScope};

// =============================================================================
// Helpers
// =============================================================================

const INIT: &str = "CREATE TABLE users (id BIGINT PRIMARY KEY)";
const ADD_COLUMN: &str = "ALTER TABLE users ADD COLUMN email VARCHAR(255)";

fn migrations_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("001_init.sql"), INIT).unwrap();
    fs::write(dir.path().join("002_add_col.sql"), ADD_COLUMN).unwrap();
    dir
}

fn setup() -> (FakeDatabase, Database) {
    let db = FakeDatabase::new();
    let database = Database::from_client(Arc::new(db.clone()));
    (db, database)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_fresh_database_applies_all() {
    let dir = migrations_dir();
    let (db, database) = setup();
    let migrator = database.migrator(MigrationConfig::new(dir.path()));

    let report = migrator.migrate_up(&OperationScope::new()).await.unwrap();

    assert_eq!(report.applied, vec!["001", "002"]);
    assert_eq!(report.skipped, 0);
    assert_eq!(db.ledger(), vec!["001", "002"]);
    assert_eq!(db.statements(), vec![INIT, ADD_COLUMN]);
    assert_eq!(db.commits(), 1);
    assert!(!db.is_locked("migrations"));
    assert!(database.pool().is_empty().await);
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let dir = migrations_dir();
    let (db, database) = setup();
    let migrator = database.migrator(MigrationConfig::new(dir.path()));

    assert_ok!(migrator.migrate_up(&OperationScope::new()).await);
    let report = migrator.migrate_up(&OperationScope::new()).await.unwrap();

    assert!(report.is_up_to_date());
    assert_eq!(report.skipped, 2);
    assert_eq!(db.ledger(), vec!["001", "002"]);
    assert_eq!(db.statements().len(), 2);
}

#[tokio::test]
async fn test_only_new_versions_are_applied() {
    let dir = migrations_dir();
    let (db, database) = setup();
    db.seed_ledger(&["001"]);

    let report = database
        .migrator(MigrationConfig::new(dir.path()))
        .migrate_up(&OperationScope::new())
        .await
        .unwrap();

    assert_eq!(report.applied, vec!["002"]);
    assert_eq!(db.statements(), vec![ADD_COLUMN]);
    assert_eq!(db.ledger(), vec!["001", "002"]);
}

#[tokio::test]
async fn test_failed_migration_rolls_back_everything() {
    let dir = migrations_dir();
    let (db, database) = setup();
    db.fail_statements_containing("ALTER TABLE");

    let err = database
        .migrator(MigrationConfig::new(dir.path()))
        .migrate_up(&OperationScope::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), Some(ErrorKind::MigrationExecFailed));
    assert!(err.to_string().starts_with("migration 002 failed"));
    assert!(db.ledger().is_empty());
    assert!(db.statements().is_empty());
    assert_eq!(db.rollbacks(), 1);
    assert!(!db.is_locked("migrations"));
    assert!(database.pool().is_empty().await);

    // Retry after the fault is fixed applies both versions
    db.clear_failures();
    let report = database
        .migrator(MigrationConfig::new(dir.path()))
        .migrate_up(&OperationScope::new())
        .await
        .unwrap();
    assert_eq!(report.applied, vec!["001", "002"]);
}

#[tokio::test]
async fn test_concurrent_replicas_apply_once() {
    let dir = migrations_dir();
    let (db, database) = setup();

    let runs: Vec<_> = (0..2)
        .map(|_| {
            let migrator = database.migrator(MigrationConfig::new(dir.path()));
            tokio::spawn(async move { migrator.migrate_up(&OperationScope::new()).await })
        })
        .collect();

    let mut applied = Vec::new();
    for run in futures::future::join_all(runs).await {
        applied.push(run.unwrap().unwrap().applied.len());
    }
    applied.sort();

    assert_eq!(applied, vec![0, 2]);
    assert_eq!(db.ledger(), vec!["001", "002"]);
    assert_eq!(db.statements(), vec![INIT, ADD_COLUMN]);
}

#[tokio::test]
async fn test_held_lock_times_out_the_run() {
    let dir = migrations_dir();
    let (db, database) = setup();
    let holder = OperationScope::new();
    let lock = database
        .locks()
        .new_lock(&holder, "migrations", Duration::from_secs(1))
        .await
        .unwrap();

    let mut config = MigrationConfig::new(dir.path());
    config.lock_timeout = Duration::ZERO;
    let err = database
        .migrator(config)
        .migrate_up(&OperationScope::new())
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert!(db.ledger().is_empty());

    assert_ok!(lock.unlock().await);
}

#[tokio::test]
async fn test_status_reports_applied_flags() {
    let dir = migrations_dir();
    let (db, database) = setup();
    db.seed_ledger(&["001"]);

    let status = database
        .migrator(MigrationConfig::new(dir.path()))
        .status(&OperationScope::new())
        .await
        .unwrap();

    let flags: Vec<_> = status
        .iter()
        .map(|s| (s.version.as_str(), s.applied))
        .collect();
    assert_eq!(flags, vec![("001", true), ("002", false)]);
    assert!(db.statements().is_empty());
}

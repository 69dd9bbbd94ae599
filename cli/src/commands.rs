//! Command implementations.

use std::path::PathBuf;
use std::time::Duration;

use common::MigrationConfig;
use thiserror::Error;
use unit_of_work::{Database, OperationScope, QueryExecutor};

use crate::args::{ExecArgs, MigrateAction, MigrateArgs};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Database(#[from] unit_of_work::Error),
}

pub type CommandResult<T> = Result<T, CommandError>;

/// Execute the migrate command
pub async fn migrate(database: &Database, args: MigrateArgs) -> CommandResult<()> {
    let mut config = MigrationConfig::from_env();
    if let Some(dir) = args.dir {
        config.directory = dir;
    }
    let migrator = database.migrator(config);
    let scope = OperationScope::new();

    match args.action {
        MigrateAction::Up => {
            let report = migrator.migrate_up(&scope).await?;
            if report.is_up_to_date() {
                println!("Already up to date ({} applied earlier)", report.skipped);
            }
            for version in &report.applied {
                println!("{}: applied", version);
            }
        }
        MigrateAction::Status => {
            for status in migrator.status(&scope).await? {
                let status_str = if status.applied { "applied" } else { "pending" };
                println!("{}: {}", status.version, status_str);
            }
        }
    }

    Ok(())
}

/// Execute the exec command
pub async fn exec(database: &Database, args: ExecArgs) -> CommandResult<()> {
    let sql = tokio::fs::read_to_string(&args.file)
        .await
        .map_err(|source| CommandError::Read {
            path: args.file.clone(),
            source,
        })?;

    let scope = OperationScope::new();
    let lock_name = args.lock.unwrap_or_default();
    tracing::info!(file = %args.file.display(), operation = %scope.id(), lock = %lock_name, "Executing SQL file");

    let uow = database
        .lockable()
        .begin(&scope, &lock_name, Duration::from_secs(args.timeout))
        .await?;
    let result = uow
        .client()
        .execute_batch(&sql)
        .await
        .map_err(|e| unit_of_work::Error::database("execute SQL file", e));
    uow.complete(result).await?;

    println!("{}: committed", args.file.display());
    Ok(())
}

/// Execute the ping command
pub async fn ping(database: &Database) -> CommandResult<()> {
    database.ping().await?;
    println!("ok");
    Ok(())
}

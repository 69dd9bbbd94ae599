//! CLI argument definitions.
//!
//! Uses clap derive macros for type-safe argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Operator tool for the transaction coordination layer
#[derive(Parser, Debug)]
#[command(name = "uow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run database migrations
    Migrate(MigrateArgs),

    /// Run a SQL file inside one unit of work
    Exec(ExecArgs),

    /// Check database connectivity
    Ping,
}

/// Arguments for the migrate command
#[derive(Parser, Debug)]
pub struct MigrateArgs {
    /// Directory holding migration files
    #[arg(short, long, env = "MIGRATIONS_DIR")]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub action: MigrateAction,
}

/// Migration actions
#[derive(Subcommand, Debug)]
pub enum MigrateAction {
    /// Apply pending migrations
    Up,
    /// Show migration status
    Status,
}

/// Arguments for the exec command
#[derive(Parser, Debug)]
pub struct ExecArgs {
    /// SQL file to execute
    pub file: PathBuf,

    /// Hold this advisory lock while the file runs
    #[arg(short, long)]
    pub lock: Option<String>,

    /// Seconds to wait for the lock
    #[arg(short, long, default_value = "5")]
    pub timeout: u64,
}

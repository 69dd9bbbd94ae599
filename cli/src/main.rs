//! uow - command line entry point
//!
//! Connects to MySQL with settings from the environment (or a `.env` file)
//! and dispatches to the selected command.

use clap::Parser;

use common::{telemetry::init_tracing, DatabaseConfig};
use unit_of_work::Database;

mod args;
mod commands;

use args::{Cli, Commands};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing (verbose mode sets debug level)
    init_tracing(cli.verbose);

    let config = DatabaseConfig::from_env();
    tracing::debug!(dsn = %config.dsn, "Configuration loaded");

    let database = match Database::connect(&config).await {
        Ok(database) => database,
        Err(e) => {
            tracing::error!("Database connection failed: {}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Migrate(args) => commands::migrate(&database, args).await,
        Commands::Exec(args) => commands::exec(&database, args).await,
        Commands::Ping => commands::ping(&database).await,
    };

    if let Err(e) = database.close().await {
        tracing::warn!("Failed to close database: {}", e);
    }

    // Handle errors
    if let Err(e) = result {
        tracing::error!("Command failed: {}", e);
        std::process::exit(1);
    }
}

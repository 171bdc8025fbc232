//! ClickHouse Restore Tool
//!
//! Provides CLI interface for restoring local ClickHouse backups

// chrestore/src/main.rs
mod clickhouse;
mod config;
mod errors;
mod metadata;
mod restore;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use clickhouse::http::HttpClickHouse;
use config::AppConfig;
use restore::{RestoreMode, RestoreRequest, Restorer};

#[derive(Parser)]
#[command(name = "chrestore")]
#[command(about = "Restore ClickHouse tables from local backups")]
#[command(version)]
struct Cli {
    /// Path to config.json
    #[arg(short, long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore schema and data of a local backup
    Restore {
        /// Backup name; lists local backups when omitted
        #[arg(default_value = "")]
        backup_name: String,

        /// Comma-separated `db.table` globs
        #[arg(short, long = "table", default_value = "")]
        table: String,

        /// `src:dst` database renames, comma-separated or repeated
        #[arg(short = 'm', long = "restore-database-mapping")]
        restore_database_mapping: Vec<String>,

        /// Partition ids, or partition key tuples like `('2023-01-01',1)`
        #[arg(long)]
        partitions: Vec<String>,

        /// Restore schema only
        #[arg(short, long)]
        schema: bool,

        /// Restore data only
        #[arg(short, long)]
        data: bool,

        /// Drop existing objects before creating them
        #[arg(long = "rm", alias = "drop")]
        drop_table: bool,

        /// Drop tables even when other objects depend on them
        #[arg(long)]
        ignore_dependencies: bool,

        /// Restore RBAC objects only, then restart the server
        #[arg(long)]
        rbac: bool,

        /// Restore server configs only, then restart the server
        #[arg(long)]
        configs: bool,
    },
}

/// Main entry point for the restore tool
#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let cli = Cli::parse();
    dotenv::dotenv().ok();

    let mut app_config = AppConfig::load_from_json(&cli.config)
        .context(format!("Failed to load application configuration from {}", cli.config.display()))?;
    app_config.apply_env_overrides(|key| std::env::var(key).ok());
    utils::logging::init_tracing(&app_config.general.log_level, cli.log_json);

    match cli.command {
        Commands::Restore {
            backup_name,
            table,
            restore_database_mapping,
            partitions,
            schema,
            data,
            drop_table,
            ignore_dependencies,
            rbac,
            configs,
        } => {
            info!(backup = %backup_name, "🔄 Starting Restore Process...");
            let request = RestoreRequest {
                table_pattern: table,
                partitions,
                database_mapping: restore_database_mapping,
                mode: RestoreMode::from_flags(schema, data),
                drop_table,
                ignore_dependencies,
                rbac_only: rbac,
                configs_only: configs,
                ..RestoreRequest::new(backup_name)
            };

            let ch = HttpClickHouse::new(&app_config.clickhouse)
                .context("Failed to create ClickHouse HTTP client")?;
            let restorer = Restorer::new(ch, app_config);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling restore");
                    on_signal.cancel();
                }
            });

            restorer
                .restore(request, cancel)
                .await
                .context("Restore process failed")?;
        }
    }
    Ok(())
}

//! DB Bootstrap - Main entry point.
//!
//! Initializes the configured database once, prints the health payload as JSON,
//! and exits non-zero when initialization ended in an error.

use clap::Parser;
use db_bootstrap::config::Config;
use db_bootstrap::db::{DatabaseManager, SchemaDefinition};
use db_bootstrap::models::masked_dsn;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // stdout carries the health payload, so logs go to stderr.
    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn run(config: &Config) -> Result<bool, Box<dyn std::error::Error>> {
    let init_config = config.to_init_config()?;
    let schema = match &config.schema_file {
        Some(path) => SchemaDefinition::from_file(path)?,
        None => SchemaDefinition::new(),
    };

    info!(
        dsn = %masked_dsn(&init_config.dsn),
        service = %init_config.service_name,
        tables = schema.required_tables().count(),
        "Starting DB Bootstrap v{}",
        env!("CARGO_PKG_VERSION")
    );
    if schema.is_empty() {
        warn!("No schema file given; only connectivity and the lock are checked");
    }

    let manager = DatabaseManager::new(init_config, schema)?;
    let operable = tokio::select! {
        operable = manager.initialize() => operable,
        _ = tokio::signal::ctrl_c() => {
            // Dropping the attempt drops any held lock handle and init connection.
            info!("Interrupted, abandoning initialization");
            false
        }
    };

    let report = manager.health_check().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    manager.close().await;
    Ok(operable)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    match run(&config).await {
        Ok(true) => {
            info!("Bootstrap complete");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            error!("Database initialization ended in error");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "Bootstrap failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

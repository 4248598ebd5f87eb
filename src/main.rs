//! Task planning API server
//!
//! Verifies bearer tokens against an OpenID Connect issuer, generates plans
//! and keeps each user's plan history.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use taskplan_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
    store::PgStore,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Migrate) => run_migrate(&cli).await,
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Apply pending migrations
async fn run_migrate(cli: &Cli) -> ExitCode {
    let config = match Config::load_unvalidated(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let Some(url) = config.database.url.as_deref() else {
        error!("database.url (or DATABASE_URL) is required for migrate");
        return ExitCode::FAILURE;
    };

    let store = match PgStore::connect(url, &config.database).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to connect to database: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = store.migrate().await {
        error!("Migration failed: {e}");
        return ExitCode::FAILURE;
    }

    info!("Migrations applied");
    ExitCode::SUCCESS
}

async fn run_server(cli: Cli) -> ExitCode {
    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        persistent = config.database.url.is_some(),
        "Starting taskplan gateway"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}

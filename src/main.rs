//! API Gateway - authenticating reverse proxy
//!
//! Rate limiting, response caching and asynchronous traffic logging in front
//! of configured route targets.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use api_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::{Gateway, run_worker},
    keys::{generate_api_key, hash_api_key},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Handle subcommands
    match cli.command {
        Some(Command::Keygen) => run_keygen(),
        Some(Command::HashKey { ref key }) => {
            println!("{}", hash_api_key(key));
            ExitCode::SUCCESS
        }
        Some(Command::Worker) => run_standalone_worker(&cli).await,
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

/// Print a fresh client key and the hash that goes into configuration
fn run_keygen() -> ExitCode {
    let key = generate_api_key();
    println!("API key:  {key}");
    println!("Key hash: {}", hash_api_key(&key));
    println!();
    println!("Add the hash to the `clients` section of the gateway configuration.");
    println!("The key itself is shown only once.");
    ExitCode::SUCCESS
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load configuration from environment".to_string(),
    })?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    Ok(config)
}

async fn run_server(cli: &Cli) -> ExitCode {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        routes = config.routes.len(),
        backend = ?config.store.backend,
        "Starting API Gateway"
    );

    // Create and run gateway
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

async fn run_standalone_worker(cli: &Cli) -> ExitCode {
    let result = async {
        let config = load_config(cli)?;
        run_worker(config).await.context("Log worker failed")
    }
    .await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// API Gateway - authenticating reverse proxy with rate limiting, caching and traffic logging
#[derive(Parser, Debug)]
#[command(name = "api-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "API_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "API_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "API_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "API_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "API_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Run the traffic log worker without the HTTP server (Redis backend only)
    Worker,

    /// Generate a new client API key and print it with its hash
    Keygen,

    /// Print the hash of an existing API key, for the `clients` config section
    HashKey {
        /// The API key to hash
        #[arg(required = true)]
        key: String,
    },
}

//! API Gateway Library
//!
//! Authenticating reverse proxy with per-client rate limiting, response
//! caching and asynchronous traffic logging.
//!
//! # Request pipeline
//!
//! 1. **Authenticate**: API key header, hashed and looked up in the client store
//! 2. **Admit**: exact sliding-window rate limit per client (fails open)
//! 3. **Cache**: GET responses served from and stored in the response cache
//! 4. **Route**: longest path-prefix match over the active routes
//! 5. **Forward**: buffered relay to the route target, hop-by-hop headers stripped
//! 6. **Log**: traffic record submitted to a durable queue, persisted by a worker pool
//!
//! Mutating requests invalidate every cached variant of their path before
//! they are forwarded.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod forward;
pub mod gateway;
pub mod keys;
pub mod model;
pub mod queue;
pub mod rate_limit;
pub mod routing;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}

//! Configuration management

use std::{env, path::Path, time::Duration};

use chrono::{DateTime, Utc};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Client authentication and admin access
    pub auth: AuthConfig,
    /// Backing store selection
    pub store: StoreConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Cache configuration
    pub cache: CacheConfig,
    /// Outbound forwarding configuration
    pub forwarder: ForwarderConfig,
    /// Traffic log pipeline configuration
    pub log_pipeline: LogPipelineConfig,
    /// Proxied routes
    pub routes: Vec<RouteConfig>,
    /// API clients allowed through the gateway
    pub clients: Vec<ClientConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (API_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("API_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        self.store.redis_url = Self::expand_string(&re, &self.store.redis_url);
        self.log_pipeline.store.path = Self::expand_string(&re, &self.log_pipeline.store.path);
        for route in &mut self.routes {
            route.target_url = Self::expand_string(&re, &route.target_url);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Quota for a client: its own override, else the global limit
    #[must_use]
    pub fn limit_for(&self, client_override: Option<u32>) -> u32 {
        client_override.unwrap_or(self.rate_limit.limit)
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum inbound request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Request header carrying the client credential
    pub header: String,

    /// Bearer token for the administrative API.
    /// Supports: literal value, `env:VAR_NAME`, or `auto` (generates random token).
    /// When unset, the administrative API rejects every request.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: "x-api-key".to_string(),
            admin_token: None,
        }
    }
}

impl AuthConfig {
    /// Resolve the admin token (expand env vars, generate if `auto`)
    #[must_use]
    pub fn resolve_admin_token(&self) -> Option<String> {
        self.admin_token.as_ref().map(|token| {
            if token == "auto" {
                use rand::RngExt;
                let random_bytes: [u8; 32] = rand::rng().random();
                format!(
                    "gw_admin_{}",
                    base64::Engine::encode(
                        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                        random_bytes
                    )
                )
            } else if let Some(var_name) = token.strip_prefix("env:") {
                env::var(var_name).unwrap_or_else(|_| token.clone())
            } else {
                token.clone()
            }
        })
    }
}

/// Which implementation backs the shared stores and the durable queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local maps (single instance, tests)
    #[default]
    Memory,
    /// Shared Redis server (multiple gateway instances, standalone worker)
    Redis,
}

/// Backing store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store implementation
    pub backend: StoreBackend,
    /// Redis connection URL (`redis://` or `rediss://`)
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Requests admitted per client per window
    pub limit: u32,
    /// Sliding window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Cache configuration for response caching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable response caching
    pub enabled: bool,
    /// TTL for cached responses
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(60),
        }
    }
}

/// Outbound forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Timeout for the whole outbound call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum redirects followed before failing
    pub max_redirects: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_redirects: 5,
        }
    }
}

/// Log store implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogStoreKind {
    /// Append JSON lines to a file
    #[default]
    File,
    /// Keep records in memory (tests)
    Memory,
}

/// Log store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStoreConfig {
    /// Store implementation
    pub kind: LogStoreKind,
    /// Output file for the `file` store
    pub path: String,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            kind: LogStoreKind::File,
            path: "logs/requests.jsonl".to_string(),
        }
    }
}

/// Traffic log pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogPipelineConfig {
    /// Enable traffic logging
    pub enabled: bool,
    /// Durable queue name
    pub queue: String,
    /// Run the consumer inside the gateway process
    pub embedded_worker: bool,
    /// Maximum jobs processed concurrently
    pub concurrency: usize,
    /// Maximum jobs started per second
    pub max_jobs_per_second: u32,
    /// Attempts per job before it is moved to the failed set
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further attempt
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// How long failed jobs are kept for inspection
    #[serde(with = "humantime_serde")]
    pub failed_retention: Duration,
    /// Interval between sweeps of expired failed jobs
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
    /// How long a worker waits for a job before checking for shutdown
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Upper bound on a single enqueue round-trip
    #[serde(with = "humantime_serde")]
    pub submit_timeout: Duration,
    /// A reserved job not settled within this time is re-delivered (Redis queue)
    #[serde(with = "humantime_serde")]
    pub stalled_timeout: Duration,
    /// Where records are persisted
    pub store: LogStoreConfig,
}

impl Default for LogPipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue: "gateway-logs".to_string(),
            embedded_worker: true,
            concurrency: 5,
            max_jobs_per_second: 100,
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            failed_retention: Duration::from_secs(24 * 60 * 60),
            prune_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
            submit_timeout: Duration::from_secs(2),
            stalled_timeout: Duration::from_secs(30),
            store: LogStoreConfig::default(),
        }
    }
}

/// Route definition as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Route identity
    pub id: String,
    /// Path prefix (must start with `/`)
    pub path_prefix: String,
    /// Absolute target base URL
    pub target_url: String,
    /// Allowed verbs (empty = GET, POST, PUT, DELETE, PATCH)
    pub methods: Vec<String>,
    /// Whether the route is matched at all
    pub active: bool,
    /// Owning user
    pub owner: Option<String>,
    /// Forward only the path after the prefix
    pub strip_prefix: bool,
    /// Creation time (defaults to load order)
    pub created_at: Option<DateTime<Utc>>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            path_prefix: String::new(),
            target_url: String::new(),
            methods: Vec::new(),
            active: true,
            owner: None,
            strip_prefix: false,
            created_at: None,
        }
    }
}

/// API client definition as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client identity
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// SHA-256 hex digest of the client's API key
    pub key_hash: String,
    /// Whether the key is accepted
    pub active: bool,
    /// Requests per window (overrides `rate_limit.limit`)
    pub rate_limit: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            key_hash: String::new(),
            active: true,
            rate_limit: None,
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms", "24h")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "30s", "5m", "100ms", "24h" or bare seconds
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

//! Backing store contracts and the process-wide store handle
//!
//! Each pipeline stage depends on one narrow contract. Implementations:
//!
//! - [`memory`]: process-local maps, for single-instance deployments and tests
//! - [`redis`]: a shared Redis server, for multiple gateway instances
//! - [`log_file`]: append-only JSON lines for traffic records
//!
//! [`Stores`] is constructed once at startup, passed into every component and
//! closed explicitly on shutdown. Nothing reaches for a global connection.

pub mod log_file;
pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{Config, LogStoreKind, StoreBackend};
use crate::model::{ApiClient, Route};
use crate::queue::{JobQueue, memory::MemoryQueue, redis::RedisQueue};
use crate::telemetry::LogRecord;
use crate::{Error, Result};

pub use log_file::JsonlLogStore;
pub use memory::{MemoryKv, MemoryLogStore, MemoryWindows, StaticClients, StaticRoutes};
pub use self::redis::RedisClient;

/// Source of route definitions
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// All routes currently flagged active
    async fn find_active_routes(&self) -> Result<Vec<Route>>;
}

/// Source of API client identities
#[async_trait]
pub trait ClientStore: Send + Sync {
    /// Look up a client by the SHA-256 hex digest of its credential
    async fn find_by_hashed_credential(&self, hash: &str) -> Result<Option<ApiClient>>;
}

/// String-keyed store with expiry and key-space scanning (response cache)
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a value; expired and absent keys are both `None`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value that expires after `ttl`
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Enumerate live keys matching a glob pattern.
    ///
    /// `*` matches any run of characters, `?` a single character and `\`
    /// escapes the next character. See [`escape_glob`].
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;
}

/// One sliding-window admission step
#[derive(Debug, Clone)]
pub struct SlideRequest {
    /// Store key of the window
    pub key: String,
    /// Current time (ms since epoch)
    pub now_ms: i64,
    /// Window length (ms)
    pub window_ms: i64,
    /// Maximum entries admitted within the window
    pub limit: u64,
    /// Unique member recorded when admitted
    pub member: String,
    /// Expiry applied to the whole window after an admission
    pub expiry: Duration,
}

/// Result of a sliding-window admission step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlideOutcome {
    /// Whether `member` was recorded
    pub admitted: bool,
    /// Entries in the window before this step's insertion
    pub count: u64,
    /// Timestamp (ms) of the oldest surviving entry, when rejected
    pub oldest_ms: Option<i64>,
}

/// Time-ordered per-key set used by the rate limiter.
///
/// [`slide`](WindowStore::slide) must purge, count and conditionally insert
/// as one step that concurrent callers on the same key cannot interleave.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Purge entries at or before `now - window`, count the rest, and record
    /// `member` at `now` if the count is below `limit`
    async fn slide(&self, request: &SlideRequest) -> Result<SlideOutcome>;
}

/// Persistence target for traffic records
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Persist one record
    async fn create(&self, record: &LogRecord) -> Result<()>;

    /// Flush buffered output before shutdown
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Escape glob metacharacters so `value` matches only itself
#[must_use]
pub fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Store handles shared by the gateway and the log worker
#[derive(Clone)]
pub struct Stores {
    /// Route definitions
    pub routes: Arc<dyn RouteStore>,
    /// Client identities
    pub clients: Arc<dyn ClientStore>,
    /// Response cache entries
    pub cache: Arc<dyn KvStore>,
    /// Rate-limit windows
    pub windows: Arc<dyn WindowStore>,
    /// Durable queue for traffic records
    pub queue: Arc<dyn JobQueue>,
    /// Traffic record persistence
    pub logs: Arc<dyn LogStore>,
    /// Shared Redis connection, when the Redis backend is selected
    redis: Option<RedisClient>,
    /// Process-local maps that need periodic expiry sweeps
    local: Option<LocalStores>,
}

/// Concrete handles on the in-memory cache and window maps
#[derive(Clone)]
struct LocalStores {
    cache: Arc<MemoryKv>,
    windows: Arc<MemoryWindows>,
}

impl LocalStores {
    fn new() -> Self {
        Self {
            cache: Arc::new(MemoryKv::new()),
            windows: Arc::new(MemoryWindows::new()),
        }
    }
}

impl Stores {
    /// Connect every store selected by the configuration
    pub async fn connect(config: &Config) -> Result<Self> {
        let routes = Arc::new(StaticRoutes::from_config(&config.routes)?);
        let clients = Arc::new(StaticClients::from_config(&config.clients)?);
        let logs = Self::open_log_store(config).await?;

        match config.store.backend {
            StoreBackend::Memory => {
                info!("Using in-memory stores (single instance)");
                let local = LocalStores::new();
                Ok(Self {
                    routes,
                    clients,
                    cache: local.cache.clone(),
                    windows: local.windows.clone(),
                    queue: Arc::new(MemoryQueue::new(&config.log_pipeline.queue)),
                    logs,
                    redis: None,
                    local: Some(local),
                })
            }
            StoreBackend::Redis => {
                let client = RedisClient::connect(&config.store.redis_url).await?;
                client.ping().await?;
                info!(url = %redact_url(&config.store.redis_url), "Connected to Redis");
                Ok(Self {
                    routes,
                    clients,
                    cache: Arc::new(client.clone()),
                    windows: Arc::new(client.clone()),
                    queue: Arc::new(RedisQueue::new(
                        client.clone(),
                        &config.log_pipeline.queue,
                        config.log_pipeline.stalled_timeout,
                    )),
                    logs,
                    redis: Some(client),
                    local: None,
                })
            }
        }
    }

    /// Build purely in-memory stores (including the log store)
    pub fn in_memory(config: &Config) -> Result<Self> {
        let local = LocalStores::new();
        Ok(Self {
            routes: Arc::new(StaticRoutes::from_config(&config.routes)?),
            clients: Arc::new(StaticClients::from_config(&config.clients)?),
            cache: local.cache.clone(),
            windows: local.windows.clone(),
            queue: Arc::new(MemoryQueue::new(&config.log_pipeline.queue)),
            logs: Arc::new(MemoryLogStore::new()),
            redis: None,
            local: Some(local),
        })
    }

    /// Whether the queue is shared with other processes
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.redis.is_some()
    }

    /// Evict expired cache entries and rate-limit windows held in process.
    ///
    /// Redis expires keys itself, so this is a no-op on that backend.
    pub fn sweep_expired(&self) {
        if let Some(local) = &self.local {
            local.cache.evict_expired();
            local.windows.evict_expired(chrono::Utc::now().timestamp_millis());
        }
    }

    async fn open_log_store(config: &Config) -> Result<Arc<dyn LogStore>> {
        let store_config = &config.log_pipeline.store;
        match store_config.kind {
            LogStoreKind::Memory => Ok(Arc::new(MemoryLogStore::new())),
            LogStoreKind::File => {
                let store = JsonlLogStore::open(&store_config.path).await.map_err(|e| {
                    Error::Config(format!(
                        "Cannot open log store {}: {e}",
                        store_config.path
                    ))
                })?;
                Ok(Arc::new(store))
            }
        }
    }

    /// Flush and release store resources
    pub async fn close(self) {
        if let Err(e) = self.logs.close().await {
            warn!(error = %e, "Failed to flush log store on shutdown");
        }
        if self.redis.is_some() {
            debug!("Releasing Redis connection");
        }
        drop(self);
    }
}

/// Strip credentials from a connection URL for logging
fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

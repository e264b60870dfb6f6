//! Process-local store implementations

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{ClientStore, KvStore, LogStore, RouteStore, SlideOutcome, SlideRequest, WindowStore};
use crate::Result;
use crate::config::{ClientConfig, RouteConfig};
use crate::model::{ApiClient, Route};
use crate::telemetry::LogRecord;

/// Routes loaded from configuration
pub struct StaticRoutes {
    routes: Vec<Route>,
}

impl StaticRoutes {
    /// Validate route definitions; definitions without a timestamp are
    /// ordered by their position in the list
    pub fn from_config(configs: &[RouteConfig]) -> Result<Self> {
        let loaded_at = Utc::now();
        let routes = configs
            .iter()
            .zip(0i64..)
            .map(|(config, index)| {
                Route::from_config(config, loaded_at + chrono::Duration::milliseconds(index))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(routes))
    }

    /// Wrap already validated routes
    #[must_use]
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }
}

#[async_trait]
impl RouteStore for StaticRoutes {
    async fn find_active_routes(&self) -> Result<Vec<Route>> {
        Ok(self
            .routes
            .iter()
            .filter(|r| r.active)
            .cloned()
            .collect())
    }
}

/// Clients loaded from configuration, indexed by credential hash
pub struct StaticClients {
    by_hash: DashMap<String, ApiClient>,
}

impl StaticClients {
    /// Validate client definitions
    pub fn from_config(configs: &[ClientConfig]) -> Result<Self> {
        let clients = configs
            .iter()
            .map(ApiClient::from_config)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(clients))
    }

    /// Index already validated clients
    #[must_use]
    pub fn new(clients: Vec<ApiClient>) -> Self {
        let by_hash = DashMap::new();
        for client in clients {
            by_hash.insert(client.key_hash.clone(), client);
        }
        Self { by_hash }
    }
}

#[async_trait]
impl ClientStore for StaticClients {
    async fn find_by_hashed_credential(&self, hash: &str) -> Result<Option<ApiClient>> {
        Ok(self.by_hash.get(hash).map(|c| c.value().clone()))
    }
}

/// In-memory key-value store with per-key expiry
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryKv {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including not yet evicted expired ones
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries whose TTL has passed
    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, (_, expires)| *expires > now);
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.1 > now {
                return Ok(Some(entry.0.clone()));
            }
        } else {
            return Ok(None);
        }
        // Expired: evict
        self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.value().1 > now && glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }
}

/// A single client's window: `(timestamp_ms, member)` in time order
#[derive(Default)]
struct Window {
    entries: BTreeSet<(i64, String)>,
    expires_at_ms: i64,
}

/// In-memory sliding windows.
///
/// Each step runs under the map's entry lock for the key, so concurrent
/// steps for the same client are serialized.
#[derive(Default)]
pub struct MemoryWindows {
    windows: DashMap<String, Window>,
}

impl MemoryWindows {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop windows whose expiry has passed
    pub fn evict_expired(&self, now_ms: i64) {
        self.windows.retain(|_, w| w.expires_at_ms > now_ms);
    }
}

#[async_trait]
impl WindowStore for MemoryWindows {
    async fn slide(&self, request: &SlideRequest) -> Result<SlideOutcome> {
        let mut window = self.windows.entry(request.key.clone()).or_default();

        if window.expires_at_ms <= request.now_ms {
            window.entries.clear();
        }

        // Keep only entries strictly newer than the window start
        let window_start = request.now_ms - request.window_ms;
        let kept = window.entries.split_off(&(window_start + 1, String::new()));
        window.entries = kept;

        let count = window.entries.len() as u64;
        if count >= request.limit {
            return Ok(SlideOutcome {
                admitted: false,
                count,
                oldest_ms: window.entries.first().map(|(ts, _)| *ts),
            });
        }

        window
            .entries
            .insert((request.now_ms, request.member.clone()));
        let expiry_ms = i64::try_from(request.expiry.as_millis()).unwrap_or(i64::MAX / 2);
        window.expires_at_ms = request.now_ms.saturating_add(expiry_ms);

        Ok(SlideOutcome {
            admitted: true,
            count,
            oldest_ms: None,
        })
    }
}

/// In-memory traffic record store
#[derive(Default)]
pub struct MemoryLogStore {
    records: RwLock<Vec<LogRecord>>,
}

impl MemoryLogStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of persisted records
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.read().clone()
    }

    /// Number of persisted records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether nothing has been persisted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn create(&self, record: &LogRecord) -> Result<()> {
        self.records.write().push(record.clone());
        Ok(())
    }
}

/// Match `text` against a glob pattern (`*`, `?`, `\` escapes)
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    // Position after the last `*` and the text position it was tried at
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                '*' => {
                    backtrack = Some((p + 1, t));
                    p += 1;
                    continue;
                }
                '?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                '\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }
        match backtrack {
            Some((star_p, star_t)) => {
                p = star_p;
                t = star_t + 1;
                backtrack = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

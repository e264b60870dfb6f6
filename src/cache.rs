//! Response caching with TTL and invalidation
//!
//! Entries live in a [`KvStore`] under `cache:{METHOD}:{path}[?{query}]`.
//! The cache is a best-effort side channel: a failed lookup is a miss and a
//! failed write or invalidation is logged and otherwise ignored.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::http::Method;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::{KvStore, escape_glob};

/// Key namespace for cached responses
pub const KEY_PREFIX: &str = "cache:";

/// A cached upstream response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    /// Upstream status
    pub status: u16,
    /// Upstream `content-type`, if any
    pub content_type: Option<String>,
    /// Upstream body
    pub body: Bytes,
}

/// Wire form in the store
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    status: u16,
    content_type: Option<String>,
    body: String,
}

impl From<&CachedResponse> for StoredEntry {
    fn from(response: &CachedResponse) -> Self {
        Self {
            status: response.status,
            content_type: response.content_type.clone(),
            body: BASE64.encode(&response.body),
        }
    }
}

impl TryFrom<StoredEntry> for CachedResponse {
    type Error = base64::DecodeError;

    fn try_from(entry: StoredEntry) -> Result<Self, Self::Error> {
        Ok(Self {
            status: entry.status,
            content_type: entry.content_type,
            body: Bytes::from(BASE64.decode(entry.body)?),
        })
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups served from cache
    pub hits: AtomicU64,
    /// Lookups that found nothing usable
    pub misses: AtomicU64,
    /// Responses written
    pub stores: AtomicU64,
    /// Keys removed by invalidation
    pub invalidated: AtomicU64,
}

impl CacheStats {
    /// Calculate hit rate (0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    /// Whether caching is enabled
    pub enabled: bool,
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total responses stored
    pub stores: u64,
    /// Total keys invalidated
    pub invalidated: u64,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

/// Response cache over a shared key-value store
pub struct ResponseCache {
    store: Arc<dyn KvStore>,
    enabled: bool,
    ttl: Duration,
    stats: CacheStats,
}

impl ResponseCache {
    /// Create a cache writing entries with `ttl`
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, enabled: bool, ttl: Duration) -> Self {
        Self {
            store,
            enabled,
            ttl,
            stats: CacheStats::default(),
        }
    }

    /// Whether lookups and writes are performed
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// TTL applied to new entries
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Build the cache key for a request
    #[must_use]
    pub fn key(method: &Method, path: &str, query: Option<&str>) -> String {
        match query {
            Some(q) if !q.is_empty() => format!("{KEY_PREFIX}{method}:{path}?{q}"),
            _ => format!("{KEY_PREFIX}{method}:{path}"),
        }
    }

    /// Look up a cached response; absence, expiry and store faults are all a miss
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "Cache lookup failed, treating as miss");
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let decoded = serde_json::from_str::<StoredEntry>(&raw)
            .map_err(|e| e.to_string())
            .and_then(|entry| CachedResponse::try_from(entry).map_err(|e| e.to_string()));
        match decoded {
            Ok(response) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(response)
            }
            Err(e) => {
                warn!(key, error = %e, "Undecodable cache entry, treating as miss");
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a response if it is cacheable (status < 400).
    ///
    /// Returns whether the entry was written. Failures are logged here and
    /// callers are free to ignore the result.
    pub async fn put(&self, key: &str, response: &CachedResponse) -> bool {
        if response.status >= 400 {
            return false;
        }
        let raw = match serde_json::to_string(&StoredEntry::from(response)) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "Failed to encode cache entry");
                return false;
            }
        };
        match self.store.set_ex(key, &raw, self.ttl).await {
            Ok(()) => {
                self.stats.stores.fetch_add(1, Ordering::Relaxed);
                debug!(key, ttl_secs = self.ttl.as_secs(), "Cached response");
                true
            }
            Err(e) => {
                warn!(key, error = %e, "Failed to store cache entry");
                false
            }
        }
    }

    /// Remove every entry whose key starts with `prefix`, returning how many.
    ///
    /// The prefix is scoped to the cache namespace: `GET:/users` and
    /// `cache:GET:/users` select the same entries, and keys outside
    /// [`KEY_PREFIX`] are never touched.
    pub async fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let scoped = if prefix.starts_with(KEY_PREFIX) {
            prefix.to_string()
        } else {
            format!("{KEY_PREFIX}{prefix}")
        };
        let pattern = format!("{}*", escape_glob(&scoped));
        let keys = match self.store.scan(&pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(prefix, error = %e, "Cache scan failed during prefix invalidation");
                return 0;
            }
        };
        self.delete(keys, prefix).await
    }

    /// Remove entries for `path` under every method: the path itself, its
    /// query variants and everything below it. Returns how many were removed.
    pub async fn invalidate_by_path(&self, path: &str) -> usize {
        let pattern = format!("{KEY_PREFIX}*:{}*", escape_glob(path));
        let keys = match self.store.scan(&pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(path, error = %e, "Cache scan failed during path invalidation");
                return 0;
            }
        };
        let keys: Vec<String> = keys
            .into_iter()
            .filter(|key| key_covers_path(key, path))
            .collect();
        self.delete(keys, path).await
    }

    async fn delete(&self, keys: Vec<String>, scope: &str) -> usize {
        if keys.is_empty() {
            return 0;
        }
        match self.store.delete(&keys).await {
            Ok(removed) => {
                self.stats.invalidated.fetch_add(removed, Ordering::Relaxed);
                debug!(scope, removed, "Invalidated cache entries");
                usize::try_from(removed).unwrap_or(usize::MAX)
            }
            Err(e) => {
                warn!(scope, keys = keys.len(), error = %e, "Cache invalidation failed");
                0
            }
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            enabled: self.enabled,
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            stores: self.stats.stores.load(Ordering::Relaxed),
            invalidated: self.stats.invalidated.load(Ordering::Relaxed),
            hit_rate: self.stats.hit_rate(),
        }
    }
}

/// Whether a cache key belongs to `path` (any method, any query, any
/// descendant path)
fn key_covers_path(key: &str, path: &str) -> bool {
    let Some((_method, request)) = key
        .strip_prefix(KEY_PREFIX)
        .and_then(|rest| rest.split_once(':'))
    else {
        return false;
    };
    let Some(rest) = request.strip_prefix(path) else {
        return false;
    };
    rest.is_empty() || rest.starts_with('?') || rest.starts_with('/') || path.ends_with('/')
}

//! Validated domain values: routes and API clients
//!
//! Route and client definitions arrive as loosely-typed configuration
//! documents. They are validated once, here, so the request path only ever
//! sees well-formed values.

use axum::http::Method;
use chrono::{DateTime, Utc};
use url::Url;

use crate::config::{ClientConfig, RouteConfig};
use crate::{Error, Result};

/// Verbs a route permits when its definition does not list any
pub const DEFAULT_METHODS: [&str; 5] = ["GET", "POST", "PUT", "DELETE", "PATCH"];

/// Verbs a route definition may name
const KNOWN_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// A proxied route: requests under `path_prefix` go to `target_url`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Stable route identity (recorded in traffic logs)
    pub id: String,
    /// Path prefix, always starting with `/`
    pub path_prefix: String,
    /// Absolute base URL of the target service
    pub target_url: Url,
    /// Verbs this route forwards (never empty)
    pub allowed_methods: Vec<Method>,
    /// Inactive routes are never matched
    pub active: bool,
    /// Owning user, when known
    pub owner: Option<String>,
    /// Forward only the part of the path after the prefix
    pub strip_prefix: bool,
    /// Creation time, used to break ties between identical prefixes
    pub created_at: DateTime<Utc>,
}

impl Route {
    /// Validate a route definition.
    ///
    /// `created_at` is used when the definition carries no timestamp of its own.
    pub fn from_config(config: &RouteConfig, created_at: DateTime<Utc>) -> Result<Self> {
        let path_prefix = config.path_prefix.trim().to_string();
        if !path_prefix.starts_with('/') {
            return Err(Error::Validation(format!(
                "route '{}': pathPrefix must start with / (got '{path_prefix}')",
                config.id
            )));
        }

        let target_url = Url::parse(config.target_url.trim()).map_err(|e| {
            Error::Validation(format!(
                "route '{}': invalid target URL '{}': {e}",
                config.id, config.target_url
            ))
        })?;
        if !matches!(target_url.scheme(), "http" | "https") || !target_url.has_host() {
            return Err(Error::Validation(format!(
                "route '{}': target URL must be an absolute http(s) URL (got '{target_url}')",
                config.id
            )));
        }

        let allowed_methods = if config.methods.is_empty() {
            DEFAULT_METHODS.iter().map(|m| parse_method(m)).collect::<Result<Vec<_>>>()?
        } else {
            config
                .methods
                .iter()
                .map(|m| parse_method(m))
                .collect::<Result<Vec<_>>>()
                .map_err(|e| Error::Validation(format!("route '{}': {e}", config.id)))?
        };

        Ok(Self {
            id: config.id.clone(),
            path_prefix,
            target_url,
            allowed_methods,
            active: config.active,
            owner: config.owner.clone(),
            strip_prefix: config.strip_prefix,
            created_at: config.created_at.unwrap_or(created_at),
        })
    }

    /// Whether this route forwards the given verb
    #[must_use]
    pub fn allows(&self, method: &Method) -> bool {
        self.allowed_methods.contains(method)
    }

    /// Whether `path` falls under this route's prefix
    ///
    /// Matches the prefix exactly or at a `/` boundary, so `/api` covers
    /// `/api/users` but not `/apis`.
    #[must_use]
    pub fn covers(&self, path: &str) -> bool {
        match path.strip_prefix(self.path_prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || self.path_prefix.ends_with('/'),
            None => false,
        }
    }

    /// Path to append to the target URL for a request to `path`
    #[must_use]
    pub fn remaining_path(&self, path: &str) -> String {
        if !self.strip_prefix {
            return path.to_string();
        }
        match path.strip_prefix(self.path_prefix.trim_end_matches('/')) {
            Some("") | None => "/".to_string(),
            Some(rest) => rest.to_string(),
        }
    }
}

/// An API client identified by the hash of its credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiClient {
    /// Stable client identity (rate-limit key and log attribution)
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// SHA-256 hex digest of the credential; the plaintext is never kept
    pub key_hash: String,
    /// Revoked clients are rejected with 403
    pub active: bool,
    /// Per-client quota override (requests per window)
    pub rate_limit: Option<u32>,
}

impl ApiClient {
    /// Validate a client definition
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let key_hash = config.key_hash.trim().to_ascii_lowercase();
        if key_hash.len() != 64 || !key_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Validation(format!(
                "client '{}': key_hash must be a 64 character SHA-256 hex digest",
                config.id
            )));
        }
        Ok(Self {
            id: config.id.clone(),
            name: if config.name.is_empty() {
                config.id.clone()
            } else {
                config.name.clone()
            },
            key_hash,
            active: config.active,
            rate_limit: config.rate_limit,
        })
    }
}

fn parse_method(raw: &str) -> Result<Method> {
    let upper = raw.trim().to_ascii_uppercase();
    if !KNOWN_METHODS.contains(&upper.as_str()) {
        return Err(Error::Validation(format!("unsupported HTTP method '{raw}'")));
    }
    Method::from_bytes(upper.as_bytes())
        .map_err(|e| Error::Validation(format!("invalid HTTP method '{raw}': {e}")))
}

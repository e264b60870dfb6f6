//! Sliding-window rate limiting
//!
//! Exact-count sliding window per client: each admitted request is recorded
//! as a timestamped member of the client's window, members older than the
//! window are purged before counting, and a request is admitted only while
//! the count is below the limit. The purge-count-insert step runs atomically
//! in the [`WindowStore`], so concurrent requests from one client (on any
//! gateway instance sharing the store) can never over-admit.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};

use crate::store::{SlideRequest, WindowStore};

/// `X-RateLimit-Limit`
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// `X-RateLimit-Remaining`
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// `X-RateLimit-Reset`
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Quota that applied
    pub limit: u32,
    /// Requests left in the current window
    pub remaining: u32,
    /// Seconds until the window frees a slot (rejected) or fully renews (admitted)
    pub reset_seconds: u64,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
}

impl RateLimitDecision {
    fn open(limit: u32, window: Duration, checked_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_seconds: window.as_secs(),
            checked_at,
        }
    }

    /// Absolute reset time
    #[must_use]
    pub fn reset_at(&self) -> DateTime<Utc> {
        let secs = i64::try_from(self.reset_seconds).unwrap_or(i64::MAX);
        self.checked_at + chrono::Duration::seconds(secs.min(i64::from(u32::MAX)))
    }

    /// Write the `X-RateLimit-*` headers
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        let reset = self.reset_at().to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Ok(value) = HeaderValue::from_str(&reset) {
            headers.insert(X_RATELIMIT_RESET, value);
        }
    }
}

/// Per-client sliding-window rate limiter
pub struct RateLimiter {
    windows: Arc<dyn WindowStore>,
    enabled: bool,
}

impl RateLimiter {
    /// Create a limiter over `windows`
    #[must_use]
    pub fn new(windows: Arc<dyn WindowStore>, enabled: bool) -> Self {
        Self {
            windows,
            enabled,
        }
    }

    /// Whether checks are enforced
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check `client_key` against `limit` requests per `window`, recording
    /// the request when admitted.
    ///
    /// Never fails: a store fault admits the request with `remaining = limit`.
    pub async fn check_and_record(
        &self,
        client_key: &str,
        limit: u32,
        window: Duration,
    ) -> RateLimitDecision {
        self.check_and_record_at(client_key, limit, window, Utc::now()).await
    }

    /// [`check_and_record`](Self::check_and_record) at an explicit time
    pub async fn check_and_record_at(
        &self,
        client_key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        if !self.is_enabled() {
            return RateLimitDecision::open(limit, window, now);
        }

        let now_ms = now.timestamp_millis();
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX / 2);
        let request = SlideRequest {
            key: format!("ratelimit:{client_key}"),
            now_ms,
            window_ms,
            limit: u64::from(limit),
            member: format!("{now_ms}-{}", uuid::Uuid::new_v4()),
            expiry: window + Duration::from_secs(1),
        };

        let outcome = match self.windows.slide(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(client = client_key, error = %e, "Rate limit store unavailable, failing open");
                return RateLimitDecision::open(limit, window, now);
            }
        };

        if outcome.admitted {
            let used = u32::try_from(outcome.count).unwrap_or(u32::MAX);
            return RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit.saturating_sub(used).saturating_sub(1),
                reset_seconds: window.as_secs(),
                checked_at: now,
            };
        }

        let oldest = outcome.oldest_ms.unwrap_or(now_ms);
        let until_free_ms = (oldest + window_ms - now_ms).max(0);
        let reset_seconds = u64::try_from((until_free_ms + 999) / 1000).unwrap_or(0).max(1);
        debug!(
            client = client_key,
            count = outcome.count,
            limit,
            reset_seconds,
            "Rate limit exceeded"
        );
        RateLimitDecision {
            allowed: false,
            limit,
            remaining: 0,
            reset_seconds,
            checked_at: now,
        }
    }
}

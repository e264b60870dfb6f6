//! Buffered response wrapper
//!
//! The pipeline holds the complete upstream response in a
//! [`BufferedResponse`] so the cache stage can inspect status and body before
//! anything is written to the client.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;

use crate::cache::CachedResponse;
use crate::forward::UpstreamResponse;

/// `X-Cache`
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Cache disposition reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from cache
    Hit,
    /// Looked up, not found
    Miss,
    /// Not eligible for caching
    Bypass,
}

impl CacheStatus {
    /// Header value
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Bypass => "BYPASS",
        }
    }

    /// Set `X-Cache` on `headers`
    pub fn apply(self, headers: &mut HeaderMap) {
        headers.insert(X_CACHE, HeaderValue::from_static(self.as_str()));
    }
}

/// A response held in memory until the pipeline releases it
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    /// Status to send
    pub status: StatusCode,
    /// Headers to send
    pub headers: HeaderMap,
    /// Body to send
    pub body: Bytes,
}

impl BufferedResponse {
    /// Wrap a relayed upstream response
    #[must_use]
    pub fn from_upstream(upstream: UpstreamResponse) -> Self {
        Self {
            status: upstream.status,
            headers: upstream.headers,
            body: upstream.body,
        }
    }

    /// Rebuild a response from a cache entry
    #[must_use]
    pub fn from_cached(cached: CachedResponse) -> Self {
        let mut headers = HeaderMap::new();
        if let Some(value) = cached
            .content_type
            .as_deref()
            .and_then(|ct| HeaderValue::from_str(ct).ok())
        {
            headers.insert(header::CONTENT_TYPE, value);
        }
        Self {
            status: StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK),
            headers,
            body: cached.body,
        }
    }

    /// Whether the status is below 400
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.status.as_u16() < 400
    }

    /// The cache entry recording this response
    #[must_use]
    pub fn to_cache_entry(&self) -> CachedResponse {
        CachedResponse {
            status: self.status.as_u16(),
            content_type: self
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body: self.body.clone(),
        }
    }

    /// Set the `X-Cache` header
    #[must_use]
    pub fn with_cache_status(mut self, status: CacheStatus) -> Self {
        status.apply(&mut self.headers);
        self
    }
}

impl IntoResponse for BufferedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cache_entry_keeps_status_and_type() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert("x-upstream", HeaderValue::from_static("1"));
        let buffered = BufferedResponse::from_upstream(UpstreamResponse {
            status: StatusCode::CREATED,
            headers,
            body: Bytes::from_static(b"made"),
        });

        let entry = buffered.to_cache_entry();
        assert_eq!(
            entry,
            CachedResponse {
                status: 201,
                content_type: Some("text/plain".to_string()),
                body: Bytes::from_static(b"made"),
            }
        );

        let rebuilt = BufferedResponse::from_cached(entry).with_cache_status(CacheStatus::Hit);
        assert_eq!(rebuilt.status, StatusCode::CREATED);
        assert_eq!(rebuilt.headers[X_CACHE], "HIT");
        assert_eq!(rebuilt.headers[header::CONTENT_TYPE], "text/plain");
    }

    #[test]
    fn test_error_status_not_cacheable() {
        let buffered = BufferedResponse {
            status: StatusCode::NOT_FOUND,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        assert!(!buffered.is_cacheable());
    }

    #[test]
    fn test_into_response() {
        let response = BufferedResponse {
            status: StatusCode::ACCEPTED,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"ok"),
        }
        .with_cache_status(CacheStatus::Bypass)
        .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()[X_CACHE], "BYPASS");
    }
}

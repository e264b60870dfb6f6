//! Outbound forwarding to route targets
//!
//! The whole upstream response is buffered so the pipeline can inspect and
//! cache it before relaying. Dropping the returned future (for example when
//! the inbound client disconnects) cancels the outbound call.

use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::config::ForwarderConfig;
use crate::error::Rejection;
use crate::model::Route;
use crate::{Error, Result};

/// Headers that only describe a single connection and are never relayed
pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// A fully buffered upstream response
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// Upstream status, relayed verbatim
    pub status: StatusCode,
    /// Upstream headers minus hop-by-hop ones
    pub headers: HeaderMap,
    /// Upstream body
    pub body: Bytes,
}

impl UpstreamResponse {
    /// Upstream `content-type`, if it is valid text
    #[must_use]
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

/// Issues outbound calls on behalf of matched requests
#[derive(Clone)]
pub struct Forwarder {
    client: Client,
}

impl Forwarder {
    /// Build the outbound HTTP client
    pub fn new(config: &ForwarderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Forward a request to `route`.
    ///
    /// Any upstream status is a successful forward. Only the absence of a
    /// response is an error.
    pub async fn forward(
        &self,
        route: &Route,
        remaining_path: &str,
        method: &Method,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> std::result::Result<UpstreamResponse, Rejection> {
        if !route.allows(method) {
            return Err(Rejection::MethodNotAllowed);
        }

        let target = build_target_url(&route.target_url, remaining_path, query);
        let mut outbound = filter_headers(headers);
        // Recomputed by the client for the outbound body
        outbound.remove(header::CONTENT_LENGTH);

        let mut request = self.client.request(method.clone(), target.clone());
        if carries_body(method) && !body.is_empty() {
            if !outbound.contains_key(header::CONTENT_TYPE) {
                outbound.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
            }
            request = request.body(body);
        }

        debug!(route = %route.id, %method, target = %target, "Forwarding request");
        let response = request.headers(outbound).send().await.map_err(|e| {
            let rejection = classify(&e);
            warn!(route = %route.id, target = %target, error = %e, "Forwarding failed");
            rejection
        })?;

        let status = response.status();
        let mut headers = filter_headers(response.headers());
        // The relayed body is re-framed locally
        headers.remove(header::CONTENT_LENGTH);
        let body = response.bytes().await.map_err(|e| {
            warn!(route = %route.id, target = %target, error = %e, "Failed to read upstream body");
            classify(&e)
        })?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Methods whose inbound body is sent upstream
fn carries_body(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn classify(error: &reqwest::Error) -> Rejection {
    if error.is_connect() || error.is_timeout() {
        Rejection::UpstreamUnavailable
    } else {
        Rejection::BadGateway
    }
}

/// Copy `headers` without the hop-by-hop set
#[must_use]
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Target base path (without trailing slash) + `remaining_path` + the
/// inbound query, which replaces any query on the target URL
#[must_use]
pub fn build_target_url(target: &Url, remaining_path: &str, query: Option<&str>) -> Url {
    let mut url = target.clone();
    let path = format!("{}{remaining_path}", target.path().trim_end_matches('/'));
    url.set_path(if path.is_empty() { "/" } else { &path });
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.set_query(Some(q));
    }
    url
}

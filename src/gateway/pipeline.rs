//! Per-request orchestration
//!
//! Stage order: authenticate, admit, cache lookup, resolve route, forward,
//! store in cache, log. Only authentication, admission, routing and
//! forwarding change the status the client sees. Cache and log faults are
//! recovered inside their own stages.

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{self, Body},
    extract::{ConnectInfo, State},
    http::{HeaderMap, Method, Request, header, request::Parts},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::LengthLimitError;
use tracing::{debug, trace, warn};

use super::response::{BufferedResponse, CacheStatus};
use super::router::AppState;
use crate::cache::ResponseCache;
use crate::error::Rejection;
use crate::model::ApiClient;
use crate::telemetry::LogDraft;

/// Request facts captured on arrival for the traffic record
struct Arrival {
    method: Method,
    path: String,
    query: Option<String>,
    ip: Option<String>,
    user_agent: Option<String>,
    requested_at: DateTime<Utc>,
    started: Instant,
}

impl Arrival {
    fn capture(parts: &Parts) -> Self {
        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .or_else(|| forwarded_for(&parts.headers));
        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            ip,
            user_agent: parts
                .headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            requested_at: Utc::now(),
            started: Instant::now(),
        }
    }

    fn draft(&self, client: &ApiClient, route_id: Option<String>, status: u16) -> LogDraft {
        LogDraft {
            method: self.method.to_string(),
            path: self.path.clone(),
            status,
            latency_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            client_id: client.id.clone(),
            route_id,
            ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
            requested_at: self.requested_at,
        }
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Fallback handler: every path not served by the gateway itself
pub async fn handle(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let arrival = Arrival::capture(&parts);

    let client = match state.authenticator.authenticate(&parts.headers).await {
        Ok(client) => client,
        Err(failure) => {
            let response = failure.rejection.clone().into_response();
            match failure.client {
                Some(client) => {
                    state
                        .producer
                        .enqueue(arrival.draft(&client, None, response.status().as_u16()));
                }
                None => trace!(
                    method = %arrival.method,
                    path = %arrival.path,
                    reason = %failure.rejection,
                    "Unauthenticated request rejected"
                ),
            }
            return response;
        }
    };

    let limit = client.rate_limit.unwrap_or(state.default_limit);
    let decision = state
        .rate_limiter
        .check_and_record(&client.id, limit, state.window)
        .await;

    let (mut response, route_id) = if decision.allowed {
        admitted(&state, &arrival, parts, body).await
    } else {
        debug!(client = %client.id, limit, "Rate limit exceeded");
        let rejection = Rejection::AdmissionRejected {
            retry_after: decision.reset_seconds,
        };
        (rejection.into_response(), None)
    };
    decision.apply_headers(response.headers_mut());

    state
        .producer
        .enqueue(arrival.draft(&client, route_id, response.status().as_u16()));
    response
}

/// Stages after admission. Returns the response and the matched route id.
async fn admitted(
    state: &AppState,
    arrival: &Arrival,
    parts: Parts,
    body: Body,
) -> (Response, Option<String>) {
    let method = &arrival.method;
    let path = arrival.path.as_str();
    let query = arrival.query.as_deref();

    let cache_key = (*method == Method::GET && state.cache.is_enabled())
        .then(|| ResponseCache::key(method, path, query));

    if let Some(key) = &cache_key {
        if let Some(cached) = state.cache.get(key).await {
            debug!(key, "Cache hit");
            let response = BufferedResponse::from_cached(cached)
                .with_cache_status(CacheStatus::Hit)
                .into_response();
            return (response, None);
        }
    }
    let cache_status = if cache_key.is_some() {
        CacheStatus::Miss
    } else {
        CacheStatus::Bypass
    };

    let Some(matched) = state.matcher.resolve(path).await else {
        return (reject(Rejection::RouteNotFound, cache_status), None);
    };
    let route_id = Some(matched.route.id.clone());

    if !matched.route.allows(method) {
        return (reject(Rejection::MethodNotAllowed, cache_status), route_id);
    }

    let body = match read_body(body, state.max_body_size).await {
        Ok(body) => body,
        Err(rejection) => return (reject(rejection, cache_status), route_id),
    };

    if is_mutating(method) {
        state.cache.invalidate_by_path(path).await;
    }

    let upstream = match state
        .forwarder
        .forward(
            &matched.route,
            &matched.remaining_path,
            method,
            query,
            &parts.headers,
            body,
        )
        .await
    {
        Ok(upstream) => upstream,
        Err(rejection) => return (reject(rejection, cache_status), route_id),
    };

    let buffered = BufferedResponse::from_upstream(upstream);
    if let Some(key) = &cache_key {
        if buffered.is_cacheable() {
            state.cache.put(key, &buffered.to_cache_entry()).await;
        }
    }

    (buffered.with_cache_status(cache_status).into_response(), route_id)
}

/// Buffer the inbound body; only the size limit maps to 413
async fn read_body(body: Body, limit: usize) -> Result<Bytes, Rejection> {
    body::to_bytes(body, limit).await.map_err(|e| {
        let mut source: Option<&(dyn StdError + 'static)> = Some(&e);
        while let Some(cause) = source {
            if cause.is::<LengthLimitError>() {
                return Rejection::PayloadTooLarge;
            }
            source = cause.source();
        }
        warn!(error = %e, "Failed to read request body");
        Rejection::InvalidBody
    })
}

fn reject(rejection: Rejection, cache_status: CacheStatus) -> Response {
    let mut response = rejection.into_response();
    cache_status.apply(response.headers_mut());
    response
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

//! HTTP router and shared state

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    http::{HeaderName, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;

use super::admin;
use super::auth::{AdminAuth, ClientAuthenticator, admin_auth_middleware};
use super::pipeline;
use crate::Result;
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::forward::Forwarder;
use crate::queue::JobQueue;
use crate::rate_limit::RateLimiter;
use crate::routing::RouteMatcher;
use crate::store::Stores;
use crate::telemetry::LogProducer;

/// Shared application state
pub struct AppState {
    /// Client credential check
    pub authenticator: ClientAuthenticator,
    /// Operator bearer check
    pub admin: Arc<AdminAuth>,
    /// Admission control
    pub rate_limiter: RateLimiter,
    /// Quota for clients without an override
    pub default_limit: u32,
    /// Rate-limit window
    pub window: Duration,
    /// Response cache
    pub cache: ResponseCache,
    /// Route resolution
    pub matcher: RouteMatcher,
    /// Outbound calls
    pub forwarder: Forwarder,
    /// Traffic log producer
    pub producer: LogProducer,
    /// Traffic log queue (inspection only)
    pub queue: Arc<dyn JobQueue>,
    /// Maximum inbound body size (bytes)
    pub max_body_size: usize,
}

impl AppState {
    /// Wire every pipeline stage to `stores`
    pub fn new(config: &Config, stores: &Stores) -> Result<Self> {
        let admin_token = config.auth.resolve_admin_token();
        if config.auth.admin_token.as_deref() == Some("auto") {
            if let Some(token) = &admin_token {
                info!(token = %token, "Generated admin token");
            }
        }

        Ok(Self {
            authenticator: ClientAuthenticator::new(
                Arc::clone(&stores.clients),
                &config.auth.header,
            )?,
            admin: Arc::new(AdminAuth::new(admin_token)),
            rate_limiter: RateLimiter::new(
                Arc::clone(&stores.windows),
                config.rate_limit.enabled,
            ),
            default_limit: config.rate_limit.limit,
            window: config.rate_limit.window,
            cache: ResponseCache::new(
                Arc::clone(&stores.cache),
                config.cache.enabled,
                config.cache.ttl,
            ),
            matcher: RouteMatcher::new(Arc::clone(&stores.routes)),
            forwarder: Forwarder::new(&config.forwarder)?,
            producer: LogProducer::new(
                Arc::clone(&stores.queue),
                config.log_pipeline.enabled,
                config.log_pipeline.submit_timeout,
            ),
            queue: Arc::clone(&stores.queue),
            max_body_size: config.server.max_body_size,
        })
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");

    let admin_routes = Router::new()
        .route("/api/cache/clear", post(admin::clear_cache))
        .route("/api/cache/stats", get(admin::cache_stats))
        .route("/api/logs/queue", get(admin::queue_status))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.admin),
            admin_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .merge(admin_routes)
        .fallback(pipeline::handle)
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .with_state(state)
}

/// Health check handler
async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "OK",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

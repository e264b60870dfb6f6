//! Administrative endpoints (bearer-protected)

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::router::AppState;

/// Failed jobs returned by default from the queue inspection endpoint
const DEFAULT_FAILED_LIMIT: usize = 50;

#[derive(Debug, Default, Deserialize)]
struct ClearRequest {
    prefix: Option<String>,
}

/// `POST /api/cache/clear`
pub(super) async fn clear_cache(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = if body.is_empty() {
        ClearRequest::default()
    } else {
        match serde_json::from_slice::<ClearRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "message": format!("Invalid request body: {e}") })),
                )
                    .into_response();
            }
        }
    };

    let Some(prefix) = request.prefix.filter(|p| !p.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "prefix is required" })),
        )
            .into_response();
    };

    let deleted = state.cache.invalidate_by_prefix(&prefix).await;
    info!(prefix = %prefix, deleted, "Cache cleared by operator");
    Json(json!({
        "message": "Cache cleared successfully",
        "prefix": prefix,
        "deletedKeys": deleted,
    }))
    .into_response()
}

/// `GET /api/cache/stats`
pub(super) async fn cache_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.cache.stats())
}

#[derive(Debug, Deserialize)]
pub(super) struct QueueQuery {
    limit: Option<usize>,
}

/// `GET /api/logs/queue`
pub(super) async fn queue_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QueueQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_FAILED_LIMIT);
    let counts = state.queue.counts().await;
    let failed = state.queue.failed(limit).await;
    match (counts, failed) {
        (Ok(counts), Ok(failed)) => Json(json!({
            "counts": counts,
            "failed": failed,
        }))
        .into_response(),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Queue inspection failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "message": "Log queue unavailable" })),
            )
                .into_response()
        }
    }
}

//! Error types for the API gateway
//!
//! [`Error`] covers infrastructure faults (stores, queue, configuration).
//! [`Rejection`] is the client-visible outcome of a pipeline stage and
//! renders itself as an HTTP response.

use std::io;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for the API gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway infrastructure errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid route or client definition
    #[error("Validation error: {0}")]
    Validation(String),

    /// Backing store error
    #[error("Store error: {0}")]
    Store(String),

    /// Durable queue error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Operation timed out
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Client-visible rejection produced by a pipeline stage
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// No credential header on the request
    #[error("API key missing")]
    MissingCredential,

    /// Credential does not belong to any client
    #[error("Invalid API key")]
    InvalidCredential,

    /// Credential belongs to a deactivated client
    #[error("API key revoked")]
    RevokedCredential,

    /// Client store could not be consulted
    #[error("API key validation failed")]
    CredentialCheckFailed,

    /// Quota exceeded for the current window
    #[error("Rate limit exceeded")]
    AdmissionRejected {
        /// Seconds until a request would be admitted again
        retry_after: u64,
    },

    /// No active route matches the path
    #[error("Route not found")]
    RouteNotFound,

    /// Route exists but does not permit the verb
    #[error("Method not allowed")]
    MethodNotAllowed,

    /// Inbound body exceeds the configured limit
    #[error("Payload too large")]
    PayloadTooLarge,

    /// Inbound body stream broke before it was complete
    #[error("Invalid request body")]
    InvalidBody,

    /// Target refused the connection or timed out
    #[error("Bad Gateway - Target service unavailable")]
    UpstreamUnavailable,

    /// Any other transport failure with no response from the target
    #[error("Bad Gateway")]
    BadGateway,

    /// Unexpected gateway failure
    #[error("Internal gateway error")]
    Internal,
}

impl Rejection {
    /// HTTP status for this rejection
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingCredential | Self::InvalidCredential => StatusCode::UNAUTHORIZED,
            Self::RevokedCredential => StatusCode::FORBIDDEN,
            Self::AdmissionRejected { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidBody => StatusCode::BAD_REQUEST,
            Self::UpstreamUnavailable | Self::BadGateway => StatusCode::BAD_GATEWAY,
            Self::CredentialCheckFailed | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(json!({ "message": self.to_string() }))).into_response();
        if let Self::AdmissionRejected { retry_after } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

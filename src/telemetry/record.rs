//! Traffic log draft and persisted record

use axum::http::Method;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Unvalidated traffic entry emitted by the request path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDraft {
    /// Request verb
    pub method: String,
    /// Request path (without query)
    pub path: String,
    /// Status returned to the client
    pub status: u16,
    /// Time from arrival to response (ms)
    pub latency_ms: u64,
    /// Identified client
    pub client_id: String,
    /// Matched route, when resolution got that far
    pub route_id: Option<String>,
    /// Source address
    pub ip: Option<String>,
    /// `user-agent` header
    pub user_agent: Option<String>,
    /// When the request arrived
    pub requested_at: DateTime<Utc>,
}

impl LogDraft {
    /// Validate into a persistable record
    pub fn validate(self) -> Result<LogRecord> {
        if Method::from_bytes(self.method.as_bytes()).is_err() {
            return Err(Error::Validation(format!("invalid method '{}'", self.method)));
        }
        if !self.path.starts_with('/') {
            return Err(Error::Validation(format!("invalid path '{}'", self.path)));
        }
        if !(100..=599).contains(&self.status) {
            return Err(Error::Validation(format!("invalid status {}", self.status)));
        }
        if self.client_id.is_empty() {
            return Err(Error::Validation("missing client id".to_string()));
        }

        Ok(LogRecord {
            id: Uuid::new_v4(),
            method: self.method.to_ascii_uppercase(),
            path: self.path,
            status_code: self.status,
            response_time: self.latency_ms,
            client_id: self.client_id,
            route_id: self.route_id,
            ip: self.ip,
            user_agent: self.user_agent,
            timestamp: self.requested_at,
        })
    }
}

/// Persisted traffic record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Record id
    pub id: Uuid,
    /// Request verb
    pub method: String,
    /// Request path
    pub path: String,
    /// Status returned to the client
    pub status_code: u16,
    /// Latency (ms)
    pub response_time: u64,
    /// Identified client
    pub client_id: String,
    /// Matched route
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    /// Source address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// `user-agent` header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// When the request arrived
    pub timestamp: DateTime<Utc>,
}

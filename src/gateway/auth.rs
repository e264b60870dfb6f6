//! Client and operator authentication
//!
//! - Clients present an API key in a configurable header (`x-api-key` by
//!   default). Only its SHA-256 digest is looked up.
//! - Operators reach the administrative endpoints with
//!   `Authorization: Bearer <admin token>`.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::Rejection;
use crate::keys::hash_api_key;
use crate::model::ApiClient;
use crate::store::ClientStore;
use crate::{Error, Result};

/// Why a request could not be attributed to an active client
#[derive(Debug, Clone)]
pub struct AuthFailure {
    /// Client-visible outcome
    pub rejection: Rejection,
    /// The client the credential belongs to, when it was recognised
    pub client: Option<ApiClient>,
}

impl AuthFailure {
    fn anonymous(rejection: Rejection) -> Self {
        Self {
            rejection,
            client: None,
        }
    }
}

/// Resolves API keys to clients
pub struct ClientAuthenticator {
    clients: Arc<dyn ClientStore>,
    header: HeaderName,
}

impl ClientAuthenticator {
    /// Authenticate with the key carried in `header`
    pub fn new(clients: Arc<dyn ClientStore>, header: &str) -> Result<Self> {
        let header = HeaderName::from_bytes(header.trim().to_ascii_lowercase().as_bytes())
            .map_err(|e| Error::Config(format!("Invalid credential header '{header}': {e}")))?;
        Ok(Self { clients, header })
    }

    /// Header carrying the credential
    #[must_use]
    pub fn header(&self) -> &HeaderName {
        &self.header
    }

    /// Identify the active client presenting `headers`
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
    ) -> std::result::Result<ApiClient, AuthFailure> {
        let key = headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|k| !k.is_empty());

        let Some(key) = key else {
            return Err(AuthFailure::anonymous(Rejection::MissingCredential));
        };

        let client = match self.clients.find_by_hashed_credential(&hash_api_key(key)).await {
            Ok(Some(client)) => client,
            Ok(None) => return Err(AuthFailure::anonymous(Rejection::InvalidCredential)),
            Err(e) => {
                warn!(error = %e, "Client store unavailable during authentication");
                return Err(AuthFailure::anonymous(Rejection::CredentialCheckFailed));
            }
        };

        if !client.active {
            debug!(client = %client.id, "Revoked API key presented");
            return Err(AuthFailure {
                rejection: Rejection::RevokedCredential,
                client: Some(client),
            });
        }

        Ok(client)
    }
}

/// Bearer-token check for the administrative API
#[derive(Debug)]
pub struct AdminAuth {
    token: Option<String>,
}

impl AdminAuth {
    /// Accept `token`; `None` rejects every request
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    /// Whether an admin token is configured
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Check the `Authorization` header
    #[must_use]
    pub fn authorize(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.token.as_deref() else {
            return false;
        };
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.strip_prefix("Bearer ")
                    .or_else(|| v.strip_prefix("bearer "))
            });
        presented.is_some_and(|token| bool::from(token.as_bytes().ct_eq(expected.as_bytes())))
    }
}

/// Guard for administrative routes
pub async fn admin_auth_middleware(
    State(admin): State<Arc<AdminAuth>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !admin.is_enabled() {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "message": "Administrative API disabled" })),
        )
            .into_response();
    }
    if admin.authorize(request.headers()) {
        return next.run(request).await;
    }
    warn!(path = %request.uri().path(), "Rejected administrative request");
    unauthorized_response("Invalid or missing admin token")
}

/// Create a 401 Unauthorized response
fn unauthorized_response(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(json!({ "message": message })),
    )
        .into_response()
}

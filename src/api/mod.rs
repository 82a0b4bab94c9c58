//! HTTP API.
//!
//! Three routers, one concern each: vault CRUD, the OAuth flow, and
//! per-provider integration endpoints. All errors map to JSON bodies;
//! only truly unexpected failures become bare 500s.

pub mod integrations;
pub mod oauth;
pub mod secrets;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::auth::TokenError;
use crate::error::BrokerError;
use crate::integration::IntegrationManager;
use crate::oauth::OAuthBroker;
use crate::vault::{SecretStore, SecretVault};

/// Shared application state for all routers.
#[derive(Clone)]
pub struct ApiState {
    pub vault: Arc<SecretVault>,
    pub secrets: Arc<SecretStore>,
    pub manager: Arc<IntegrationManager>,
    pub broker: Arc<OAuthBroker>,
    /// Where OAuth callbacks send the browser back to.
    pub frontend_url: String,
    pub callback_base_url: String,
}

/// Assemble the full application router.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .merge(secrets::create_secret_router(state.clone()))
        .merge(oauth::create_oauth_router(state.clone()))
        .merge(integrations::create_integration_router(state))
        .layer(CorsLayer::permissive())
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reconnect: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    integration_id: Option<i64>,
}

impl ErrorResponse {
    fn plain(error: String) -> Self {
        Self {
            error,
            reconnect: None,
            provider: None,
            integration_id: None,
        }
    }
}

/// Application error for API handlers.
pub enum AppError {
    Unauthorized(String),
    BadRequest(String),
    NotFound(String),
    /// Token no longer usable; the caller should offer a reconnect
    /// action for the named provider.
    ReauthRequired {
        message: String,
        provider: Option<String>,
        integration_id: Option<i64>,
    },
    BadGateway(String),
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, ErrorResponse::plain(msg)),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorResponse::plain(msg)),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorResponse::plain(msg)),
            AppError::ReauthRequired {
                message,
                provider,
                integration_id,
            } => (
                StatusCode::CONFLICT,
                ErrorResponse {
                    error: message,
                    reconnect: Some(true),
                    provider,
                    integration_id,
                },
            ),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, ErrorResponse::plain(msg)),
            AppError::ServerError(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::plain(msg))
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        AppError::Unauthorized(format!("Invalid token: {}", e))
    }
}

impl From<BrokerError> for AppError {
    fn from(e: BrokerError) -> Self {
        let message = e.to_string();
        match e {
            BrokerError::NoOAuthConfig { .. }
            | BrokerError::InvalidState(_)
            | BrokerError::InvalidGrant(_)
            | BrokerError::ConfigMismatch(_)
            | BrokerError::Decryption(_) => AppError::BadRequest(message),
            BrokerError::NotFound(_) => AppError::NotFound(message),
            BrokerError::ReauthRequired {
                integration_id,
                service,
            } => AppError::ReauthRequired {
                message,
                provider: Some(service.as_str().to_string()),
                integration_id: Some(integration_id),
            },
            // Early revocations that escaped the manager still read as
            // "reconnect me" to the caller
            BrokerError::RefreshRevoked(_) | BrokerError::TokenRejected(_) => {
                AppError::ReauthRequired {
                    message,
                    provider: None,
                    integration_id: None,
                }
            }
            BrokerError::ProviderUnavailable(_) => AppError::BadGateway(message),
            BrokerError::Internal(_) => AppError::ServerError(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ServiceType;

    #[test]
    fn test_broker_error_status_mapping() {
        let cases: Vec<(BrokerError, StatusCode)> = vec![
            (
                BrokerError::NoOAuthConfig {
                    service: ServiceType::Slack,
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                BrokerError::InvalidGrant("reused".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                BrokerError::NotFound("missing".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                BrokerError::ReauthRequired {
                    integration_id: 1,
                    service: ServiceType::Gmail,
                },
                StatusCode::CONFLICT,
            ),
            (
                BrokerError::ProviderUnavailable("down".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                BrokerError::Internal("bug".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            let response = AppError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}

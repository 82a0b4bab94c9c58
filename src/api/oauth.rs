//! OAuth flow endpoints.
//!
//! The authorize endpoint is a normal authenticated JSON call; the
//! callback is hit by the user's browser coming back from the
//! provider, so its outcomes are communicated as a redirect to the
//! frontend with `oauth_success`/`oauth_error` query parameters.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{Json, Redirect},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{ApiState, AppError};
use crate::auth::extract_user_id;
use crate::error::BrokerError;
use crate::integration::ConnectError;
use crate::provider::ServiceType;

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Response for GET /auth/:provider/authorize
#[derive(Serialize)]
pub struct AuthorizeResponse {
    pub auth_url: String,
    pub redirect_uri: String,
}

/// Response for GET /oauth/redirect-uris
#[derive(Serialize)]
pub struct RedirectUrisResponse {
    pub google: String,
    pub github: String,
    pub slack: String,
}

/// Create OAuth API router
pub fn create_oauth_router(state: ApiState) -> Router {
    Router::new()
        .route("/auth/:provider/authorize", get(authorize))
        .route("/auth/:provider/callback", get(callback))
        .route("/oauth/redirect-uris", get(redirect_uris))
        .with_state(Arc::new(state))
}

fn parse_provider(provider: &str) -> Result<ServiceType, AppError> {
    ServiceType::from_auth_path(provider)
        .ok_or_else(|| AppError::NotFound(format!("Provider '{}' not found", provider)))
}

/// GET /auth/:provider/authorize
///
/// Returns the provider authorization URL for the caller to open.
/// Fails with 400 when no OAuth application is configured for the
/// provider (neither a user credential nor a system default).
async fn authorize(
    State(state): State<Arc<ApiState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AuthorizeResponse>, AppError> {
    let service = parse_provider(&provider)?;
    let user_id = extract_user_id(&headers)?;

    debug!(user = %user_id, provider = %service, "Authorize URL requested");

    let authorize_url = state.broker.build_authorize_url(&user_id, service)?;

    info!(user = %user_id, provider = %service, "Authorize URL issued");
    Ok(Json(AuthorizeResponse {
        auth_url: authorize_url.auth_url,
        redirect_uri: authorize_url.redirect_uri,
    }))
}

/// GET /auth/:provider/callback
///
/// Provider redirect target. Always answers with a redirect back to
/// the frontend; outcomes ride in the query string.
async fn callback(
    State(state): State<Arc<ApiState>>,
    Path(provider): Path<String>,
    Query(params): Query<OAuthCallback>,
) -> Redirect {
    let service = match ServiceType::from_auth_path(&provider) {
        Some(service) => service,
        None => return frontend_error(&state, "unknown_provider"),
    };

    // User denied consent, or the provider reported a flow error
    if let Some(provider_error) = params.error {
        warn!(
            provider = %service,
            error = %provider_error,
            description = ?params.error_description,
            "OAuth authorization failed at provider"
        );
        return frontend_error(&state, &provider_error);
    }

    let Some(code) = params.code else {
        return frontend_error(&state, "missing_code");
    };
    let Some(oauth_state) = params.state else {
        return frontend_error(&state, "invalid_state");
    };

    // Attribute the callback before any token traffic. The sealed
    // state names the provider; a mismatch means the callback URL was
    // crossed between flows.
    match state.broker.open_state(&oauth_state) {
        Ok(claims) if claims.service != service => {
            error!(
                expected = %claims.service,
                actual = %service,
                "Provider mismatch between state and callback path"
            );
            return frontend_error(&state, "invalid_state");
        }
        Ok(_) => {}
        Err(e) => {
            warn!(provider = %service, error = %e, "OAuth state rejected");
            return frontend_error(&state, "invalid_state");
        }
    }

    let (claims, config, grant) = match state.broker.exchange_code(&oauth_state, &code).await {
        Ok(result) => result,
        Err(e) => {
            warn!(provider = %service, error = %e, "Token exchange failed");
            return frontend_error(&state, exchange_error_reason(&e));
        }
    };

    match state.manager.connect(&claims, &config, grant).await {
        Ok(integration) => {
            info!(
                user = %claims.user_id,
                provider = %service,
                integration_id = integration.id,
                "OAuth flow completed"
            );
            frontend_redirect(
                &state,
                &[
                    ("oauth_success", "true".to_string()),
                    ("integration_id", integration.id.to_string()),
                ],
            )
        }
        // Credential persisted, row creation failed: the user can
        // finish the wiring manually
        Err(ConnectError::IntegrationFailed { secret_id, reason }) => {
            error!(
                user = %claims.user_id,
                provider = %service,
                secret_id,
                error = %reason,
                "Integration creation failed after credential save"
            );
            frontend_redirect(
                &state,
                &[
                    ("oauth_success", "true".to_string()),
                    ("secret_id", secret_id.to_string()),
                    ("warning", "integration_failed".to_string()),
                ],
            )
        }
        Err(e) => {
            error!(user = %claims.user_id, provider = %service, error = %e, "Connect failed");
            frontend_error(&state, "internal_error")
        }
    }
}

/// GET /oauth/redirect-uris - Informational, for display only
async fn redirect_uris(State(state): State<Arc<ApiState>>) -> Json<RedirectUrisResponse> {
    let base = state.callback_base_url.trim_end_matches('/');
    Json(RedirectUrisResponse {
        google: format!("{}/auth/google/callback", base),
        github: format!("{}/auth/github/callback", base),
        slack: format!("{}/auth/slack/callback", base),
    })
}

fn exchange_error_reason(e: &BrokerError) -> &'static str {
    match e {
        BrokerError::InvalidState(_) => "invalid_state",
        BrokerError::NoOAuthConfig { .. } | BrokerError::ConfigMismatch(_) => "config_error",
        BrokerError::ProviderUnavailable(_) => "provider_unavailable",
        _ => "token_exchange_failed",
    }
}

fn frontend_error(state: &ApiState, reason: &str) -> Redirect {
    frontend_redirect(state, &[("oauth_error", reason.to_string())])
}

fn frontend_redirect(state: &ApiState, params: &[(&str, String)]) -> Redirect {
    let query = serde_urlencoded::to_string(params).unwrap_or_default();
    let url = format!(
        "{}/?{}",
        state.frontend_url.trim_end_matches('/'),
        query
    );
    Redirect::temporary(&url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_callback_deserialization() {
        // Success case
        let query = "code=auth_code_123&state=sealed_state_456";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.code, Some("auth_code_123".to_string()));
        assert_eq!(callback.state, Some("sealed_state_456".to_string()));
        assert_eq!(callback.error, None);

        // Error case
        let query = "error=access_denied&error_description=User+cancelled";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.error, Some("access_denied".to_string()));
        assert_eq!(
            callback.error_description,
            Some("User cancelled".to_string())
        );
        assert_eq!(callback.code, None);
    }

    #[test]
    fn test_exchange_error_reasons() {
        assert_eq!(
            exchange_error_reason(&BrokerError::InvalidState("old".into())),
            "invalid_state"
        );
        assert_eq!(
            exchange_error_reason(&BrokerError::NoOAuthConfig {
                service: ServiceType::Slack
            }),
            "config_error"
        );
        assert_eq!(
            exchange_error_reason(&BrokerError::ProviderUnavailable("503".into())),
            "provider_unavailable"
        );
        assert_eq!(
            exchange_error_reason(&BrokerError::InvalidGrant("reused".into())),
            "token_exchange_failed"
        );
    }
}

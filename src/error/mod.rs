//! Error taxonomy for the vault and OAuth broker.
//!
//! Every failure a caller can act on is a typed variant here; the API
//! layer maps them to HTTP statuses. Unexpected programming errors stay
//! `anyhow` and surface as 500s.

use crate::provider::ServiceType;

/// Typed errors produced by the resolver, broker, manager, and gateways.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerError {
    /// No usable client id/secret for the provider: neither a user
    /// secret nor a system default is configured.
    NoOAuthConfig { service: ServiceType },
    /// OAuth state parameter failed integrity or freshness checks.
    InvalidState(String),
    /// Authorization code rejected (expired or reused). The user must
    /// restart the flow.
    InvalidGrant(String),
    /// Client id/secret rejected by the provider. Likely a stale user
    /// credential.
    ConfigMismatch(String),
    /// Network error, timeout, or provider 5xx. Retryable by the caller.
    ProviderUnavailable(String),
    /// Refresh token revoked or expired at the provider.
    RefreshRevoked(String),
    /// Provider rejected an access token we believed valid (early
    /// revocation). Treated the same as a revoked refresh token.
    TokenRejected(String),
    /// Ciphertext malformed or authentication tag failed. The secret is
    /// unusable.
    Decryption(String),
    /// The integration can only be fixed by the user reconnecting.
    ReauthRequired {
        integration_id: i64,
        service: ServiceType,
    },
    /// Requested record does not exist or is not owned by the caller.
    NotFound(String),
    /// Unexpected failure (storage, serialization). Surfaces as a bare
    /// 500; never user-actionable.
    Internal(String),
}

impl BrokerError {
    /// Whether this error should flip the owning integration to
    /// `needs_reauth` (the auto-heal trigger).
    pub fn is_reauth_signal(&self) -> bool {
        matches!(
            self,
            BrokerError::RefreshRevoked(_)
                | BrokerError::TokenRejected(_)
                | BrokerError::Decryption(_)
        )
    }

    /// Whether the caller may retry without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::ProviderUnavailable(_))
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::NoOAuthConfig { service } => write!(
                f,
                "No OAuth credentials configured for {}: add a credential or set the system default",
                service.as_str()
            ),
            BrokerError::InvalidState(msg) => {
                write!(f, "Invalid or expired OAuth state parameter: {}", msg)
            }
            BrokerError::InvalidGrant(msg) => {
                write!(f, "Authorization code rejected: {}", msg)
            }
            BrokerError::ConfigMismatch(msg) => {
                write!(f, "OAuth client credentials rejected by provider: {}", msg)
            }
            BrokerError::ProviderUnavailable(msg) => {
                write!(f, "Provider unavailable: {}", msg)
            }
            BrokerError::RefreshRevoked(msg) => {
                write!(f, "Refresh token revoked: {}", msg)
            }
            BrokerError::TokenRejected(msg) => {
                write!(f, "Access token rejected by provider: {}", msg)
            }
            BrokerError::Decryption(msg) => {
                write!(f, "Secret could not be decrypted: {}", msg)
            }
            BrokerError::ReauthRequired {
                integration_id,
                service,
            } => write!(
                f,
                "Integration {} ({}) requires reauthorization",
                integration_id,
                service.as_str()
            ),
            BrokerError::NotFound(msg) => write!(f, "{}", msg),
            BrokerError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}

//! OAuth client credential resolution.
//!
//! Decides, per request, which OAuth application a flow should run
//! under: a credential the user saved in the vault takes priority over
//! the process-wide default for that provider.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::provider::ServiceType;
use crate::vault::{bundle_str, is_token_bundle, SecretStore, SecretVault};

/// Where the resolved client pair came from.
#[derive(Clone, Debug, PartialEq)]
pub enum CredentialSource {
    /// A user-saved Secret (id of the winning row).
    UserSecret(i64),
    /// Process-wide environment defaults.
    SystemDefault,
}

/// A resolved OAuth application: everything the broker needs to run an
/// authorization-code or refresh flow.
#[derive(Clone, Debug)]
pub struct OAuthConfig {
    pub service: ServiceType,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub source: CredentialSource,
}

/// Process-wide default client pair for one provider.
#[derive(Clone, Debug)]
pub struct DefaultClient {
    pub client_id: String,
    pub client_secret: String,
}

/// Resolves the OAuth application to use for a (user, provider) pair.
pub struct CredentialResolver {
    secrets: Arc<SecretStore>,
    vault: Arc<SecretVault>,
    defaults: HashMap<ServiceType, DefaultClient>,
    callback_base_url: String,
}

impl CredentialResolver {
    pub fn new(
        secrets: Arc<SecretStore>,
        vault: Arc<SecretVault>,
        defaults: HashMap<ServiceType, DefaultClient>,
        callback_base_url: String,
    ) -> Self {
        Self {
            secrets,
            vault,
            defaults,
            callback_base_url,
        }
    }

    /// System default redirect URI for a provider.
    pub fn default_redirect_uri(&self, service: ServiceType) -> String {
        format!(
            "{}/auth/{}/callback",
            self.callback_base_url.trim_end_matches('/'),
            service.auth_path_name()
        )
    }

    /// Resolve the OAuth application for `user_id` and `service`.
    ///
    /// A user Secret wins when its `service_type` is in the provider
    /// family, it decrypts, it is not a broker-issued token grant, and
    /// it carries both `client_id` and `client_secret`. Ties are broken
    /// by creation time: the earliest-created matching Secret wins.
    /// Otherwise the system default applies. Neither present →
    /// [`BrokerError::NoOAuthConfig`].
    pub fn resolve(&self, user_id: &str, service: ServiceType) -> Result<OAuthConfig, BrokerError> {
        let candidates = self
            .secrets
            .find_for_service(user_id, service.family())
            .map_err(|e| {
                warn!(user = %user_id, service = %service, error = %e, "Secret lookup failed");
                BrokerError::NoOAuthConfig { service }
            })?;

        for record in &candidates {
            let bundle = match self.vault.decrypt_bundle(&record.encrypted_value) {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!(
                        secret_id = record.id,
                        error = %e,
                        "Skipping undecryptable secret during resolution"
                    );
                    continue;
                }
            };

            // Broker-issued token grants are not app credentials
            if is_token_bundle(&bundle) {
                continue;
            }

            let client_id = bundle_str(&bundle, "client_id");
            let client_secret = bundle_str(&bundle, "client_secret");
            if let (Some(client_id), Some(client_secret)) = (client_id, client_secret) {
                let redirect_uri = bundle_str(&bundle, "redirect_uri")
                    .map(str::to_string)
                    .unwrap_or_else(|| self.default_redirect_uri(service));
                debug!(
                    user = %user_id,
                    service = %service,
                    secret_id = record.id,
                    "Resolved OAuth config from user secret"
                );
                return Ok(OAuthConfig {
                    service,
                    client_id: client_id.to_string(),
                    client_secret: client_secret.to_string(),
                    redirect_uri,
                    source: CredentialSource::UserSecret(record.id),
                });
            }
        }

        if let Some(default) = self.defaults.get(&service) {
            debug!(user = %user_id, service = %service, "Resolved OAuth config from system default");
            return Ok(OAuthConfig {
                service,
                client_id: default.client_id.clone(),
                client_secret: default.client_secret.clone(),
                redirect_uri: self.default_redirect_uri(service),
                source: CredentialSource::SystemDefault,
            });
        }

        Err(BrokerError::NoOAuthConfig { service })
    }
}

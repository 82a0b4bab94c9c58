//! Integration lifecycle management.
//!
//! Owns the state machine for each user+provider pairing: creation
//! after a successful OAuth exchange, transparent token refresh, the
//! auto-heal policy when a refresh fails or was never possible, and
//! deletion.
//!
//! # Refresh serialization
//!
//! Two concurrent requests needing the same integration's token must
//! not both hit the provider's refresh endpoint (a rotating provider
//! would strand one of them). Callers racing here serialize on a
//! per-integration async mutex; the loser re-reads the bundle after
//! acquiring the lock and adopts the winner's persisted token. The
//! re-encrypted bundle is written before the lock guard drops.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Integration, IntegrationStatus, IntegrationStore};
use crate::error::BrokerError;
use crate::gateway::{GatewaySet, Paging, ProviderSummary, SyncGateway, SyncItem};
use crate::oauth::{OAuthBroker, StateClaims, TokenGrant};
use crate::provider::ServiceType;
use crate::resolver::{CredentialResolver, CredentialSource, OAuthConfig};
use crate::vault::{
    bundle_str, is_token_bundle, SecretBundle, SecretStore, SecretVault, KIND_KEY, KIND_TOKEN,
};

/// Failures of the connect path. Secret save and integration upsert
/// are reported separately so the OAuth callback can tell "nothing
/// happened" apart from "credential saved, row creation failed".
#[derive(Debug)]
pub enum ConnectError {
    Broker(BrokerError),
    IntegrationFailed { secret_id: i64, reason: String },
    Storage(String),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Broker(e) => write!(f, "{}", e),
            ConnectError::IntegrationFailed { secret_id, reason } => write!(
                f,
                "Credential {} saved but integration creation failed: {}",
                secret_id, reason
            ),
            ConnectError::Storage(msg) => write!(f, "Failed to store credentials: {}", msg),
        }
    }
}

impl std::error::Error for ConnectError {}

enum TokenState {
    Fresh(String),
    Expired,
}

/// Manages integration lifecycle records and their token bundles.
pub struct IntegrationManager {
    vault: Arc<SecretVault>,
    secrets: Arc<SecretStore>,
    integrations: Arc<IntegrationStore>,
    broker: Arc<OAuthBroker>,
    resolver: Arc<CredentialResolver>,
    gateways: Arc<GatewaySet>,
    refresh_locks: DashMap<i64, Arc<Mutex<()>>>,
    /// Tokens expiring within this margin count as expired already.
    refresh_margin: Duration,
}

impl IntegrationManager {
    pub fn new(
        vault: Arc<SecretVault>,
        secrets: Arc<SecretStore>,
        integrations: Arc<IntegrationStore>,
        broker: Arc<OAuthBroker>,
        resolver: Arc<CredentialResolver>,
        gateways: Arc<GatewaySet>,
        refresh_margin_seconds: i64,
    ) -> Self {
        Self {
            vault,
            secrets,
            integrations,
            broker,
            resolver,
            gateways,
            refresh_locks: DashMap::new(),
            refresh_margin: Duration::seconds(refresh_margin_seconds),
        }
    }

    fn gateway(&self, service: ServiceType) -> Result<&dyn SyncGateway, BrokerError> {
        self.gateways
            .for_service(service)
            .ok_or_else(|| BrokerError::NotFound(format!("No gateway for provider '{}'", service)))
    }

    /// Finish a successful OAuth exchange: store the token grant as an
    /// encrypted Secret, probe the provider identity for display
    /// fields, and upsert the integration row as `connected`.
    pub async fn connect(
        &self,
        claims: &StateClaims,
        config: &OAuthConfig,
        grant: TokenGrant,
    ) -> Result<Integration, ConnectError> {
        let service = claims.service;
        let user_id = claims.user_id.as_str();
        let gateway = self.gateway(service).map_err(ConnectError::Broker)?;

        // One lightweight identity call, display-only: a failure here
        // must not lose a perfectly good token grant.
        let identity = match gateway.fetch_identity(&grant.access_token).await {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!(user = %user_id, service = %service, error = %e,
                    "Identity probe failed during connect");
                None
            }
        };
        let display_name = identity
            .as_ref()
            .map(|i| i.display_name.clone())
            .unwrap_or_else(|| "unknown".to_string());

        let bundle = token_bundle(config, &grant);
        let blob = self
            .vault
            .encrypt_bundle(&bundle)
            .map_err(|e| ConnectError::Storage(e.to_string()))?;

        let secret_name = format!("{} - {}", service.title(), display_name);
        let secret = self
            .secrets
            .create(user_id, &secret_name, service.as_str(), &blob)
            .map_err(|e| ConnectError::Storage(e.to_string()))?;

        // A reconnect replaces the previous grant; drop the old token
        // secret so orphaned grants do not accumulate.
        if let Ok(Some(existing)) = self.integrations.find(user_id, service) {
            if let Some(old_secret_id) = existing.secret_id {
                if old_secret_id != secret.id {
                    self.delete_token_secret(user_id, old_secret_id);
                }
            }
        }

        let mut display_config = identity
            .map(|i| i.extra)
            .unwrap_or_else(|| json!({}));
        if let Value::Object(map) = &mut display_config {
            map.insert("display_name".to_string(), json!(display_name));
        }

        let integration = self
            .integrations
            .upsert(
                user_id,
                service,
                Some(secret.id),
                IntegrationStatus::Connected,
                &display_config,
            )
            .map_err(|e| ConnectError::IntegrationFailed {
                secret_id: secret.id,
                reason: e.to_string(),
            })?;

        info!(
            user = %user_id,
            service = %service,
            integration_id = integration.id,
            has_refresh_token = bundle.contains_key("refresh_token"),
            "Integration connected"
        );
        Ok(integration)
    }

    /// Create an integration from an already-stored credential (no
    /// OAuth round trip). Probes the provider when the bundle carries
    /// an access token.
    pub async fn create_from_secret(
        &self,
        user_id: &str,
        service: ServiceType,
        secret_id: i64,
    ) -> Result<Integration, BrokerError> {
        let secret = self
            .secrets
            .get(user_id, secret_id)
            .map_err(internal)?
            .ok_or_else(|| {
                BrokerError::NotFound("Credential not found or access denied".to_string())
            })?;

        let bundle = self.vault.decrypt_bundle(&secret.encrypted_value)?;

        let (status, display_config) = match bundle_str(&bundle, "access_token") {
            Some(access_token) => {
                let gateway = self.gateway(service)?;
                match gateway.fetch_identity(access_token).await {
                    Ok(identity) => {
                        let mut config = identity.extra;
                        if let Value::Object(map) = &mut config {
                            map.insert("display_name".to_string(), json!(identity.display_name));
                        }
                        (IntegrationStatus::Connected, config)
                    }
                    Err(e) => {
                        warn!(user = %user_id, service = %service, error = %e,
                            "Identity probe failed; integration left connecting");
                        (
                            IntegrationStatus::Connecting,
                            json!({ "display_name": "unknown" }),
                        )
                    }
                }
            }
            None => (
                IntegrationStatus::Connecting,
                json!({ "display_name": "unknown" }),
            ),
        };

        self.integrations
            .upsert(user_id, service, Some(secret_id), status, &display_config)
            .map_err(internal)
    }

    /// Create an integration with no credential attached yet.
    pub fn create_pending(
        &self,
        user_id: &str,
        service: ServiceType,
    ) -> Result<Integration, BrokerError> {
        self.integrations
            .upsert(
                user_id,
                service,
                None,
                IntegrationStatus::Connecting,
                &json!({ "display_name": "unknown" }),
            )
            .map_err(internal)
    }

    pub fn get(&self, user_id: &str, integration_id: i64) -> Result<Integration, BrokerError> {
        self.integrations
            .get(user_id, integration_id)
            .map_err(internal)?
            .ok_or_else(|| {
                BrokerError::NotFound(format!("Integration {} not found", integration_id))
            })
    }

    pub fn list(
        &self,
        user_id: &str,
        service: Option<ServiceType>,
    ) -> Result<Vec<Integration>, BrokerError> {
        self.integrations.list(user_id, service).map_err(internal)
    }

    /// Returns an access token currently believed valid, refreshing
    /// transparently when the stored one is expired.
    pub async fn get_valid_access_token(
        &self,
        user_id: &str,
        integration_id: i64,
    ) -> Result<String, BrokerError> {
        let integration = self.get(user_id, integration_id)?;
        self.valid_token_for(&integration).await
    }

    /// Refresh cached provider counts for an integration.
    ///
    /// Any `ReauthRequired` from the token path propagates unchanged; a
    /// provider-side early revocation during the fetch heals the same
    /// way a revoked refresh token does.
    pub async fn sync(
        &self,
        user_id: &str,
        integration_id: i64,
    ) -> Result<Integration, BrokerError> {
        let integration = self.get(user_id, integration_id)?;
        if integration.status == IntegrationStatus::NeedsReauth {
            // Terminal until the user reconnects; no refresh attempt
            return Err(self.reauth_error(&integration));
        }

        let token = self.valid_token_for(&integration).await?;
        let gateway = self.gateway(integration.service_type)?;

        let summary = match gateway.fetch_summary(&token).await {
            Ok(summary) => summary,
            Err(e) => return Err(self.heal_on_reauth_signal(&integration, e)),
        };

        self.integrations
            .merge_config(
                integration.id,
                &summary_patch(integration.service_type, &summary),
            )
            .map_err(internal)?;

        debug!(integration_id = integration.id, "Sync complete");
        self.get(user_id, integration_id)
    }

    /// List provider items (emails / repos / messages) through the
    /// gateway, using a token known to be valid at call time.
    pub async fn list_items(
        &self,
        user_id: &str,
        integration_id: i64,
        paging: &Paging,
    ) -> Result<Vec<SyncItem>, BrokerError> {
        let integration = self.get(user_id, integration_id)?;
        if integration.status == IntegrationStatus::NeedsReauth {
            return Err(self.reauth_error(&integration));
        }

        let token = self.valid_token_for(&integration).await?;
        let gateway = self.gateway(integration.service_type)?;

        gateway
            .fetch_list(&token, paging)
            .await
            .map_err(|e| self.heal_on_reauth_signal(&integration, e))
    }

    /// Delete an integration. The linked Secret is deleted only when it
    /// is a broker-issued token grant; user-supplied app credentials
    /// survive for a future reconnect.
    pub fn delete(&self, user_id: &str, integration_id: i64) -> Result<(), BrokerError> {
        let integration = self.get(user_id, integration_id)?;

        if let Some(secret_id) = integration.secret_id {
            self.delete_token_secret(user_id, secret_id);
        }

        self.integrations
            .delete(user_id, integration_id)
            .map_err(internal)?;
        self.refresh_locks.remove(&integration_id);

        info!(user = %user_id, integration_id, "Integration deleted");
        Ok(())
    }

    /// Secret-deletion hook: detach the weak back-reference from every
    /// integration pointing at `secret_id`.
    pub fn handle_secret_deleted(&self, secret_id: i64) -> Result<usize, BrokerError> {
        self.integrations.detach_secret(secret_id).map_err(internal)
    }

    async fn valid_token_for(&self, integration: &Integration) -> Result<String, BrokerError> {
        // Fast path: cached token still inside the safety margin
        if let TokenState::Fresh(token) = self.read_token(integration)? {
            self.restore_connected(integration)?;
            return Ok(token);
        }

        self.integrations
            .set_status(integration.id, IntegrationStatus::TokenExpired)
            .map_err(internal)?;

        // At-most-one concurrent refresh per integration. The guard is
        // owned so it can ride into the refresh task and outlive a
        // cancelled caller.
        let lock = self
            .refresh_locks
            .entry(integration.id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;

        // The lock winner may have refreshed and persisted already;
        // adopt its result instead of issuing another refresh call.
        let integration = self.get(&integration.user_id, integration.id)?;
        if let TokenState::Fresh(token) = self.read_token(&integration)? {
            self.restore_connected(&integration)?;
            return Ok(token);
        }

        self.refresh_locked(&integration, guard).await
    }

    /// `token_expired` is transient: once a fresh token is observed,
    /// the row goes back to `connected`.
    fn restore_connected(&self, integration: &Integration) -> Result<(), BrokerError> {
        if integration.status == IntegrationStatus::TokenExpired {
            self.integrations
                .set_status(integration.id, IntegrationStatus::Connected)
                .map_err(internal)?;
        }
        Ok(())
    }

    /// Refresh while holding the per-integration lock.
    ///
    /// The provider call and the re-encrypt-and-write run in a
    /// detached task that owns the lock guard: a caller aborting its
    /// request cannot leave the token state half-updated or release
    /// the lock early. The guard drops only after persistence.
    async fn refresh_locked(
        &self,
        integration: &Integration,
        guard: tokio::sync::OwnedMutexGuard<()>,
    ) -> Result<String, BrokerError> {
        let secret_id = match integration.secret_id {
            Some(id) => id,
            None => return Err(self.mark_needs_reauth(integration, "no token secret linked")),
        };
        let secret = self
            .secrets
            .get(&integration.user_id, secret_id)
            .map_err(internal)?
            .ok_or_else(|| self.mark_needs_reauth(integration, "token secret missing"))?;

        let mut bundle = match self.vault.decrypt_bundle(&secret.encrypted_value) {
            Ok(bundle) => bundle,
            Err(e) => return Err(self.mark_needs_reauth(integration, &e.to_string())),
        };

        let refresh_token = match bundle_str(&bundle, "refresh_token") {
            Some(token) => token.to_string(),
            // Never granted a refresh token: only reconnecting helps
            None => return Err(self.mark_needs_reauth(integration, "no refresh token stored")),
        };

        let config = self.refresh_config(integration, &bundle)?;

        let broker = self.broker.clone();
        let vault = self.vault.clone();
        let secrets = self.secrets.clone();
        let integrations = self.integrations.clone();
        let user_id = integration.user_id.clone();
        let integration_id = integration.id;
        let service = integration.service_type;

        let task = tokio::spawn(async move {
            let _guard = guard;
            match broker.refresh(&config, &refresh_token).await {
                Ok(grant) => {
                    bundle.insert("access_token".to_string(), json!(grant.access_token));
                    if let Some(rotated) = &grant.refresh_token {
                        bundle.insert("refresh_token".to_string(), json!(rotated));
                    }
                    match grant.expires_at {
                        Some(expiry) => {
                            bundle.insert("token_expiry".to_string(), json!(expiry.to_rfc3339()));
                        }
                        None => {
                            bundle.remove("token_expiry");
                        }
                    }

                    let blob = vault.encrypt_bundle(&bundle).map_err(internal)?;
                    // Persisted while the lock is held: the next reader
                    // sees the new token, never a stale or half-written
                    // one
                    secrets
                        .update(&user_id, secret_id, None, None, Some(&blob))
                        .map_err(internal)?;
                    integrations
                        .set_status(integration_id, IntegrationStatus::Connected)
                        .map_err(internal)?;

                    info!(integration_id, "Access token refreshed");
                    Ok(grant.access_token)
                }
                Err(e @ BrokerError::RefreshRevoked(_)) => {
                    warn!(integration_id, error = %e, "Refresh token revoked");
                    if let Err(status_err) =
                        integrations.set_status(integration_id, IntegrationStatus::NeedsReauth)
                    {
                        warn!(integration_id, error = %status_err, "Failed to persist needs_reauth");
                    }
                    Err(BrokerError::ReauthRequired {
                        integration_id,
                        service,
                    })
                }
                // Transient or config trouble: leave token_expired so
                // the next attempt retries instead of forcing
                // re-consent
                Err(e) => {
                    warn!(integration_id, error = %e, "Token refresh failed");
                    Err(e)
                }
            }
        });

        task.await
            .map_err(|e| BrokerError::Internal(format!("refresh task failed: {}", e)))?
    }

    /// The client pair that minted a grant refreshes it; fall back to
    /// resolution only for bundles predating that convention.
    fn refresh_config(
        &self,
        integration: &Integration,
        bundle: &SecretBundle,
    ) -> Result<OAuthConfig, BrokerError> {
        let client_id = bundle_str(bundle, "client_id");
        let client_secret = bundle_str(bundle, "client_secret");
        if let (Some(client_id), Some(client_secret)) = (client_id, client_secret) {
            let redirect_uri = bundle_str(bundle, "redirect_uri")
                .map(str::to_string)
                .unwrap_or_else(|| {
                    self.resolver
                        .default_redirect_uri(integration.service_type)
                });
            return Ok(OAuthConfig {
                service: integration.service_type,
                client_id: client_id.to_string(),
                client_secret: client_secret.to_string(),
                redirect_uri,
                source: integration
                    .secret_id
                    .map(CredentialSource::UserSecret)
                    .unwrap_or(CredentialSource::SystemDefault),
            });
        }
        self.resolver
            .resolve(&integration.user_id, integration.service_type)
    }

    fn read_token(&self, integration: &Integration) -> Result<TokenState, BrokerError> {
        let secret_id = match integration.secret_id {
            Some(id) => id,
            None => return Err(self.mark_needs_reauth(integration, "no token secret linked")),
        };
        let secret = self
            .secrets
            .get(&integration.user_id, secret_id)
            .map_err(internal)?
            .ok_or_else(|| self.mark_needs_reauth(integration, "token secret missing"))?;

        let bundle = match self.vault.decrypt_bundle(&secret.encrypted_value) {
            Ok(bundle) => bundle,
            // Corrupted/tampered secret: unusable, heal instead of crash
            Err(e) => return Err(self.mark_needs_reauth(integration, &e.to_string())),
        };

        let access_token = match bundle_str(&bundle, "access_token") {
            Some(token) => token.to_string(),
            None => return Ok(TokenState::Expired),
        };

        match bundle_str(&bundle, "token_expiry") {
            None => Ok(TokenState::Fresh(access_token)),
            Some(expiry) => match chrono::DateTime::parse_from_rfc3339(expiry) {
                Ok(expiry) if expiry.with_timezone(&Utc) - self.refresh_margin > Utc::now() => {
                    Ok(TokenState::Fresh(access_token))
                }
                Ok(_) => Ok(TokenState::Expired),
                Err(_) => Ok(TokenState::Expired),
            },
        }
    }

    fn reauth_error(&self, integration: &Integration) -> BrokerError {
        BrokerError::ReauthRequired {
            integration_id: integration.id,
            service: integration.service_type,
        }
    }

    fn mark_needs_reauth(&self, integration: &Integration, reason: &str) -> BrokerError {
        warn!(
            integration_id = integration.id,
            service = %integration.service_type,
            reason = %reason,
            "Integration needs reauthorization"
        );
        if let Err(e) = self
            .integrations
            .set_status(integration.id, IntegrationStatus::NeedsReauth)
        {
            warn!(integration_id = integration.id, error = %e, "Failed to persist needs_reauth");
        }
        self.reauth_error(integration)
    }

    fn heal_on_reauth_signal(&self, integration: &Integration, err: BrokerError) -> BrokerError {
        if err.is_reauth_signal() {
            self.mark_needs_reauth(integration, &err.to_string())
        } else {
            err
        }
    }

    /// Delete a linked secret iff it is a broker-issued token grant.
    fn delete_token_secret(&self, user_id: &str, secret_id: i64) {
        let record = match self.secrets.get(user_id, secret_id) {
            Ok(Some(record)) => record,
            _ => return,
        };
        match self.vault.decrypt_bundle(&record.encrypted_value) {
            Ok(bundle) if is_token_bundle(&bundle) => {
                if let Err(e) = self.secrets.delete(user_id, secret_id) {
                    warn!(secret_id, error = %e, "Failed to delete token secret");
                } else {
                    debug!(secret_id, "Deleted broker-issued token secret");
                }
            }
            // App credentials (or undecryptable bundles) are kept
            _ => {}
        }
    }
}

fn internal(e: impl std::fmt::Display) -> BrokerError {
    BrokerError::Internal(e.to_string())
}

/// Token bundle written after an exchange or refresh. Carries the
/// client pair that minted the grant so refreshes stay consistent with
/// it.
fn token_bundle(config: &OAuthConfig, grant: &TokenGrant) -> SecretBundle {
    let mut bundle = SecretBundle::new();
    bundle.insert(KIND_KEY.to_string(), json!(KIND_TOKEN));
    bundle.insert("access_token".to_string(), json!(grant.access_token));
    if let Some(refresh_token) = &grant.refresh_token {
        bundle.insert("refresh_token".to_string(), json!(refresh_token));
    }
    if let Some(expiry) = grant.expires_at {
        bundle.insert("token_expiry".to_string(), json!(expiry.to_rfc3339()));
    }
    bundle.insert("client_id".to_string(), json!(config.client_id));
    bundle.insert("client_secret".to_string(), json!(config.client_secret));
    bundle.insert("redirect_uri".to_string(), json!(config.redirect_uri));
    bundle
}

fn summary_patch(service: ServiceType, summary: &ProviderSummary) -> Value {
    let mut patch = serde_json::Map::new();
    match service {
        ServiceType::Gmail => {
            patch.insert("messages_total".to_string(), json!(summary.resource_count));
            if let Some(unread) = summary.unread_count {
                patch.insert("unread_count".to_string(), json!(unread));
            }
        }
        ServiceType::Github => {
            patch.insert("repo_count".to_string(), json!(summary.resource_count));
        }
        ServiceType::Slack => {
            patch.insert("channel_count".to_string(), json!(summary.resource_count));
        }
        ServiceType::Custom => {
            patch.insert("resource_count".to_string(), json!(summary.resource_count));
        }
    }
    if let Some(display_name) = &summary.display_name {
        patch.insert("display_name".to_string(), json!(display_name));
    }
    patch.insert("last_sync".to_string(), json!(Utc::now().to_rfc3339()));
    Value::Object(patch)
}

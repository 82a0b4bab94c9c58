use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use tether::api::{create_router, ApiState};
use tether::config::{load_config, EnvConfig, TetherConfig};
use tether::gateway::GatewaySet;
use tether::integration::{IntegrationManager, IntegrationStore};
use tether::oauth::{OAuthBroker, StateSealer};
use tether::provider::ProviderRegistry;
use tether::resolver::CredentialResolver;
use tether::vault::{SecretStore, SecretVault};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=info".into()),
        )
        .init();

    let config = match std::env::var("TETHER_CONFIG") {
        Ok(path) => load_config(&path).with_context(|| format!("Failed to load {}", path))?,
        Err(_) => TetherConfig::default(),
    };
    let env = EnvConfig::from_env()?;

    // Invalid or missing master key aborts startup
    let vault = Arc::new(SecretVault::new(&env.encryption_key)?);

    let secrets = Arc::new(SecretStore::new(&config.server.db_path)?);
    let integrations = Arc::new(IntegrationStore::new(&config.server.db_path)?);

    let resolver = Arc::new(CredentialResolver::new(
        secrets.clone(),
        vault.clone(),
        env.provider_defaults.clone(),
        env.callback_base_url.clone(),
    ));

    let http_timeout = std::time::Duration::from_secs(config.oauth.http_timeout_seconds);
    let broker = Arc::new(OAuthBroker::new(
        resolver.clone(),
        Arc::new(ProviderRegistry::new()),
        StateSealer::new(vault.clone(), config.oauth.state_ttl_seconds),
        http_timeout,
    )?);

    let gateways = Arc::new(GatewaySet::new(http_timeout)?);

    let manager = Arc::new(IntegrationManager::new(
        vault.clone(),
        secrets.clone(),
        integrations,
        broker.clone(),
        resolver,
        gateways,
        config.oauth.refresh_margin_seconds,
    ));

    let app = create_router(ApiState {
        vault,
        secrets,
        manager,
        broker,
        frontend_url: env.frontend_url,
        callback_base_url: env.callback_base_url,
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;

    info!(addr = %config.server.bind_addr, "Tether listening");
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

//! Process configuration.
//!
//! Tunables come from an optional TOML file with serde defaults;
//! secrets and deployment URLs come from the environment. The master
//! encryption key is required: a missing or invalid key aborts startup.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashMap;

use crate::provider::ServiceType;
use crate::resolver::DefaultClient;

/// Complete Tether configuration (TOML side).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TetherConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub oauth: OAuthSettings,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// SQLite database path (secrets and integrations tables).
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8888".to_string()
}

fn default_db_path() -> String {
    "tether.db".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
        }
    }
}

/// OAuth flow tunables
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthSettings {
    /// How long an issued state parameter stays valid (seconds).
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
    /// Bound on every outbound provider call (seconds).
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
    /// Tokens expiring within this margin count as already expired.
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_seconds: i64,
}

fn default_state_ttl() -> i64 {
    600
}

fn default_http_timeout() -> u64 {
    15
}

fn default_refresh_margin() -> i64 {
    60
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl(),
            http_timeout_seconds: default_http_timeout(),
            refresh_margin_seconds: default_refresh_margin(),
        }
    }
}

/// Load configuration from a TOML file.
pub fn load_config(path: &str) -> Result<TetherConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TetherConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Environment surface: master key, per-provider OAuth defaults, and
/// redirect targets.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Base64-encoded 32-byte master key.
    pub encryption_key: String,
    pub provider_defaults: HashMap<ServiceType, DefaultClient>,
    /// Where OAuth callbacks redirect the browser back to.
    pub frontend_url: String,
    /// Base URL this service is reachable at (redirect_uri prefix).
    pub callback_base_url: String,
}

impl EnvConfig {
    /// Read from the process environment. Fails when the master key is
    /// absent; provider defaults are optional per provider.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Testable seam: same logic, injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let encryption_key = lookup("TETHER_ENCRYPTION_KEY").ok_or_else(|| {
            anyhow!("TETHER_ENCRYPTION_KEY is not set; generate a base64-encoded 32-byte key")
        })?;

        let mut provider_defaults = HashMap::new();
        for service in [ServiceType::Gmail, ServiceType::Github, ServiceType::Slack] {
            let prefix = format!("TETHER_OAUTH_{}", service.as_str().to_uppercase());
            let client_id = lookup(&format!("{}_CLIENT_ID", prefix));
            let client_secret = lookup(&format!("{}_CLIENT_SECRET", prefix));
            if let (Some(client_id), Some(client_secret)) = (client_id, client_secret) {
                provider_defaults.insert(
                    service,
                    DefaultClient {
                        client_id,
                        client_secret,
                    },
                );
            }
        }

        Ok(Self {
            encryption_key,
            provider_defaults,
            frontend_url: lookup("FRONTEND_URL")
                .unwrap_or_else(|| "http://localhost:88".to_string()),
            callback_base_url: lookup("TETHER_CALLBACK_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8888".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TetherConfig::default();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8888");
        assert_eq!(config.server.db_path, "tether.db");
        assert_eq!(config.oauth.state_ttl_seconds, 600);
        assert_eq!(config.oauth.http_timeout_seconds, 15);
        assert_eq!(config.oauth.refresh_margin_seconds, 60);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            bind_addr = "127.0.0.1:9000"
            db_path = "/var/lib/tether/tether.db"

            [oauth]
            state_ttl_seconds = 300
            http_timeout_seconds = 10
            refresh_margin_seconds = 120
        "#;

        let config: TetherConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.oauth.state_ttl_seconds, 300);
        assert_eq!(config.oauth.refresh_margin_seconds, 120);
    }

    #[test]
    fn test_partial_config() {
        // Missing sections use defaults
        let toml = r#"
            [oauth]
            http_timeout_seconds = 5
        "#;

        let config: TetherConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.oauth.http_timeout_seconds, 5);
        assert_eq!(config.oauth.state_ttl_seconds, 600); // Default
        assert_eq!(config.server.bind_addr, "0.0.0.0:8888"); // Default
    }

    #[test]
    fn test_env_missing_master_key_is_fatal() {
        let result = EnvConfig::from_lookup(|_| None);
        assert!(result.is_err());
    }

    #[test]
    fn test_env_provider_defaults() {
        let config = EnvConfig::from_lookup(|name| match name {
            "TETHER_ENCRYPTION_KEY" => Some("key".to_string()),
            "TETHER_OAUTH_GITHUB_CLIENT_ID" => Some("gh-id".to_string()),
            "TETHER_OAUTH_GITHUB_CLIENT_SECRET" => Some("gh-secret".to_string()),
            // Gmail id without secret: incomplete pair is ignored
            "TETHER_OAUTH_GMAIL_CLIENT_ID" => Some("gm-id".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.provider_defaults.len(), 1);
        let github = config.provider_defaults.get(&ServiceType::Github).unwrap();
        assert_eq!(github.client_id, "gh-id");
        assert!(!config.provider_defaults.contains_key(&ServiceType::Gmail));
        assert_eq!(config.frontend_url, "http://localhost:88");
        assert_eq!(config.callback_base_url, "http://localhost:8888");
    }
}

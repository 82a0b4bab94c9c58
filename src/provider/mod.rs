//! Provider descriptors for the supported OAuth services.
//!
//! The three provider flows share one state machine; everything that
//! differs between them (endpoints, scopes, authorize-URL extras) lives
//! in a `ProviderDescriptor` looked up from the `ProviderRegistry`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Closed set of service types a secret or integration can belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Github,
    Gmail,
    Slack,
    /// User-defined credential bundles with no OAuth flow.
    Custom,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Github => "github",
            ServiceType::Gmail => "gmail",
            ServiceType::Slack => "slack",
            ServiceType::Custom => "custom",
        }
    }

    /// Parse a stored `service_type` value.
    pub fn parse(s: &str) -> Option<ServiceType> {
        match s.to_lowercase().as_str() {
            "github" => Some(ServiceType::Github),
            "gmail" => Some(ServiceType::Gmail),
            "slack" => Some(ServiceType::Slack),
            "custom" => Some(ServiceType::Custom),
            _ => None,
        }
    }

    /// Parse a provider name from the `/auth/:provider/...` path.
    ///
    /// `google` is accepted as an alias for the Gmail service, matching
    /// the companion frontend.
    pub fn from_auth_path(s: &str) -> Option<ServiceType> {
        match s.to_lowercase().as_str() {
            "google" | "gmail" => Some(ServiceType::Gmail),
            "github" => Some(ServiceType::Github),
            "slack" => Some(ServiceType::Slack),
            _ => None,
        }
    }

    /// Human-facing provider name, used when naming broker-issued
    /// secrets.
    pub fn title(&self) -> &'static str {
        match self {
            ServiceType::Github => "GitHub",
            ServiceType::Gmail => "Gmail",
            ServiceType::Slack => "Slack",
            ServiceType::Custom => "Custom",
        }
    }

    /// Provider name used in `/auth/{provider}/...` URLs.
    pub fn auth_path_name(&self) -> &'static str {
        match self {
            ServiceType::Gmail => "google",
            ServiceType::Github => "github",
            ServiceType::Slack => "slack",
            ServiceType::Custom => "custom",
        }
    }

    /// `service_type` values that count as belonging to this provider
    /// family when scanning a user's secrets.
    pub fn family(&self) -> &'static [&'static str] {
        match self {
            ServiceType::Gmail => &["gmail", "email"],
            ServiceType::Github => &["github"],
            ServiceType::Slack => &["slack", "messages"],
            ServiceType::Custom => &["custom"],
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OAuth endpoints and scopes for one provider.
#[derive(Clone, Debug)]
pub struct ProviderDescriptor {
    pub service: ServiceType,
    /// Authorization endpoint the user's browser is sent to.
    pub auth_url: String,
    /// Token exchange/refresh endpoint.
    pub token_url: String,
    /// Lightweight identity endpoint (display name only).
    pub userinfo_url: String,
    /// Read-only scopes sufficient for listing resources.
    pub scopes: Vec<String>,
    /// Extra query parameters for the authorize URL. Google needs
    /// `access_type=offline` and `prompt=consent` or no refresh token
    /// is granted.
    pub extra_authorize_params: Vec<(String, String)>,
}

impl ProviderDescriptor {
    /// Build the full authorization URL for this provider.
    pub fn build_authorize_url(&self, client_id: &str, redirect_uri: &str, state: &str) -> String {
        let scopes = self.scopes.join(" ");
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.auth_url,
            urlencoding::encode(client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        );
        for (key, value) in &self.extra_authorize_params {
            url.push('&');
            url.push_str(key);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }
}

/// Registry of provider descriptors.
///
/// Constructed once at startup with the real endpoints; tests override
/// endpoints to point at a mock server.
#[derive(Clone, Debug)]
pub struct ProviderRegistry {
    descriptors: HashMap<ServiceType, ProviderDescriptor>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let mut descriptors = HashMap::new();
        descriptors.insert(
            ServiceType::Github,
            ProviderDescriptor {
                service: ServiceType::Github,
                auth_url: "https://github.com/login/oauth/authorize".to_string(),
                token_url: "https://github.com/login/oauth/access_token".to_string(),
                userinfo_url: "https://api.github.com/user".to_string(),
                scopes: vec!["repo".to_string(), "read:user".to_string()],
                extra_authorize_params: vec![],
            },
        );
        descriptors.insert(
            ServiceType::Gmail,
            ProviderDescriptor {
                service: ServiceType::Gmail,
                auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
                token_url: "https://oauth2.googleapis.com/token".to_string(),
                userinfo_url: "https://www.googleapis.com/oauth2/v2/userinfo".to_string(),
                scopes: vec!["https://www.googleapis.com/auth/gmail.readonly".to_string()],
                extra_authorize_params: vec![
                    ("access_type".to_string(), "offline".to_string()),
                    ("prompt".to_string(), "consent".to_string()),
                ],
            },
        );
        descriptors.insert(
            ServiceType::Slack,
            ProviderDescriptor {
                service: ServiceType::Slack,
                auth_url: "https://slack.com/oauth/v2/authorize".to_string(),
                token_url: "https://slack.com/api/oauth.v2.access".to_string(),
                userinfo_url: "https://slack.com/api/auth.test".to_string(),
                scopes: vec![
                    "channels:read".to_string(),
                    "channels:history".to_string(),
                    "team:read".to_string(),
                ],
                extra_authorize_params: vec![],
            },
        );
        Self { descriptors }
    }

    pub fn descriptor(&self, service: ServiceType) -> Option<&ProviderDescriptor> {
        self.descriptors.get(&service)
    }

    /// Point one provider's endpoints at a different base URL.
    ///
    /// Used by tests to route token/userinfo traffic to a mock server.
    pub fn override_endpoints(
        &mut self,
        service: ServiceType,
        auth_url: &str,
        token_url: &str,
        userinfo_url: &str,
    ) {
        if let Some(descriptor) = self.descriptors.get_mut(&service) {
            descriptor.auth_url = auth_url.to_string();
            descriptor.token_url = token_url.to_string();
            descriptor.userinfo_url = userinfo_url.to_string();
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

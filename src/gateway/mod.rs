//! Uniform façade over provider data-fetch APIs.
//!
//! One [`SyncGateway`] implementation per provider family, each
//! responsible only for that provider's REST shape. No retry or
//! refresh logic lives here: the caller (IntegrationManager) supplies
//! a token known to be valid at call time. A 401 despite that token
//! means provider-side early revocation and maps to
//! [`BrokerError::TokenRejected`].

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

mod github;
mod gmail;
mod slack;

pub use github::GithubGateway;
pub use gmail::GmailGateway;
pub use slack::SlackGateway;

use crate::error::BrokerError;
use crate::provider::ServiceType;

/// Lightweight identity for display purposes (username, email address,
/// workspace name).
#[derive(Clone, Debug, Serialize)]
pub struct ProviderIdentity {
    pub display_name: String,
    /// Provider extras worth keeping in the integration config
    /// (e.g. Slack team id).
    pub extra: Value,
}

/// Representative summary of the connected resource.
#[derive(Clone, Debug, Serialize)]
pub struct ProviderSummary {
    /// Emails / repositories / channels, per provider.
    pub resource_count: u64,
    pub unread_count: Option<u64>,
    pub display_name: Option<String>,
}

/// Paging parameters for list fetches.
#[derive(Clone, Debug)]
pub struct Paging {
    pub limit: u32,
    pub page: u32,
    /// Provider-specific selector (Slack channel id, Gmail search
    /// query).
    pub filter: Option<String>,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            limit: 20,
            page: 1,
            filter: None,
        }
    }
}

/// One listed item, provider-agnostic shape.
#[derive(Clone, Debug, Serialize)]
pub struct SyncItem {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unread: Option<bool>,
    /// Provider-specific fields the frontend may render.
    pub extra: Value,
}

/// Provider data-fetch interface.
#[async_trait]
pub trait SyncGateway: Send + Sync {
    fn service(&self) -> ServiceType;

    /// One lightweight identity call, used when an integration is
    /// created to fill its display config.
    async fn fetch_identity(&self, access_token: &str) -> Result<ProviderIdentity, BrokerError>;

    /// Representative counts for the sync path.
    async fn fetch_summary(&self, access_token: &str) -> Result<ProviderSummary, BrokerError>;

    /// Paginated item listing (emails / repos / messages).
    async fn fetch_list(
        &self,
        access_token: &str,
        paging: &Paging,
    ) -> Result<Vec<SyncItem>, BrokerError>;
}

/// The configured gateways, one per OAuth provider.
pub struct GatewaySet {
    gateways: Vec<Box<dyn SyncGateway>>,
}

impl GatewaySet {
    /// Real gateways against production endpoints.
    pub fn new(http_timeout: std::time::Duration) -> anyhow::Result<Self> {
        Ok(Self {
            gateways: vec![
                Box::new(GithubGateway::new(http_timeout)?),
                Box::new(GmailGateway::new(http_timeout)?),
                Box::new(SlackGateway::new(http_timeout)?),
            ],
        })
    }

    /// Custom gateway set (tests point these at a mock server).
    pub fn from_gateways(gateways: Vec<Box<dyn SyncGateway>>) -> Self {
        Self { gateways }
    }

    pub fn for_service(&self, service: ServiceType) -> Option<&dyn SyncGateway> {
        self.gateways
            .iter()
            .find(|g| g.service() == service)
            .map(|g| g.as_ref())
    }
}

/// Map a non-2xx provider response to the taxonomy: 401 is early
/// revocation, everything else is reported as provider trouble.
pub(crate) fn check_response_status(
    service: ServiceType,
    response: &reqwest::Response,
) -> Result<(), BrokerError> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(BrokerError::TokenRejected(format!(
            "{} rejected the access token",
            service
        )));
    }
    if !status.is_success() {
        return Err(BrokerError::ProviderUnavailable(format!(
            "{} API returned {}",
            service, status
        )));
    }
    Ok(())
}

/// Wrap a transport-level failure (timeout, DNS, connection reset).
pub(crate) fn transport_error(service: ServiceType, e: reqwest::Error) -> BrokerError {
    BrokerError::ProviderUnavailable(format!("{} request failed: {}", service, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gateway_set_dispatch() {
        let set = GatewaySet::new(std::time::Duration::from_secs(5)).unwrap();
        assert!(set.for_service(ServiceType::Github).is_some());
        assert!(set.for_service(ServiceType::Gmail).is_some());
        assert!(set.for_service(ServiceType::Slack).is_some());
        assert!(set.for_service(ServiceType::Custom).is_none());
    }

    #[test]
    fn test_paging_defaults() {
        let paging = Paging::default();
        assert_eq!(paging.limit, 20);
        assert_eq!(paging.page, 1);
        assert!(paging.filter.is_none());
    }
}

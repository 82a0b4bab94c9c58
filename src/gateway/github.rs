//! GitHub REST gateway.

use async_trait::async_trait;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;

use super::{
    check_response_status, transport_error, Paging, ProviderIdentity, ProviderSummary, SyncGateway,
    SyncItem,
};
use crate::error::BrokerError;
use crate::provider::ServiceType;

const BASE_URL: &str = "https://api.github.com";

/// Authenticated GitHub user document (identity + repo counts).
#[derive(Debug, Deserialize)]
struct GithubUser {
    login: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    public_repos: u64,
    #[serde(default)]
    total_private_repos: Option<u64>,
}

/// GitHub repository (listing shape).
#[derive(Debug, Deserialize)]
struct GithubRepo {
    full_name: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    open_issues_count: u64,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    private: bool,
}

/// Gateway for the GitHub REST API.
///
/// Sets a User-Agent header (GitHub rejects requests without one).
pub struct GithubGateway {
    http: reqwest::Client,
    base_url: String,
}

impl GithubGateway {
    pub fn new(http_timeout: std::time::Duration) -> Result<Self> {
        Self::with_base_url(http_timeout, BASE_URL.to_string())
    }

    /// Custom base URL (for testing with a mock server).
    pub fn with_base_url(http_timeout: std::time::Duration, base_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("tether/1.0")
            .timeout(http_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, base_url })
    }

    async fn fetch_user(&self, access_token: &str) -> Result<GithubUser, BrokerError> {
        let url = format!("{}/user", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| transport_error(ServiceType::Github, e))?;

        check_response_status(ServiceType::Github, &response)?;
        response.json::<GithubUser>().await.map_err(|e| {
            BrokerError::ProviderUnavailable(format!("unparseable user response: {}", e))
        })
    }
}

#[async_trait]
impl SyncGateway for GithubGateway {
    fn service(&self) -> ServiceType {
        ServiceType::Github
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<ProviderIdentity, BrokerError> {
        let user = self.fetch_user(access_token).await?;
        Ok(ProviderIdentity {
            display_name: user.login.clone(),
            extra: json!({ "github_username": user.login, "name": user.name }),
        })
    }

    async fn fetch_summary(&self, access_token: &str) -> Result<ProviderSummary, BrokerError> {
        let user = self.fetch_user(access_token).await?;
        Ok(ProviderSummary {
            resource_count: user.public_repos + user.total_private_repos.unwrap_or(0),
            unread_count: None,
            display_name: Some(user.login),
        })
    }

    async fn fetch_list(
        &self,
        access_token: &str,
        paging: &Paging,
    ) -> Result<Vec<SyncItem>, BrokerError> {
        let url = format!(
            "{}/user/repos?sort=updated&per_page={}&page={}",
            self.base_url, paging.limit, paging.page
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| transport_error(ServiceType::Github, e))?;

        check_response_status(ServiceType::Github, &response)?;
        let repos = response.json::<Vec<GithubRepo>>().await.map_err(|e| {
            BrokerError::ProviderUnavailable(format!("unparseable repos response: {}", e))
        })?;

        Ok(repos
            .into_iter()
            .map(|repo| SyncItem {
                id: repo.full_name,
                title: repo.name,
                snippet: repo.description,
                timestamp: repo.updated_at,
                unread: None,
                extra: json!({
                    "language": repo.language,
                    "stars": repo.stargazers_count,
                    "open_issues": repo.open_issues_count,
                    "private": repo.private,
                }),
            })
            .collect())
    }
}

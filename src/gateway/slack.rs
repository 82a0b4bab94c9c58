//! Slack Web API gateway.
//!
//! Slack answers HTTP 200 for almost everything; real outcomes live in
//! the `{"ok": bool, "error": ...}` envelope, which is normalized into
//! the shared taxonomy here.

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

const BASE_URL: &str = "https://slack.com";

/// How many channels a cross-channel message listing will walk.
const MESSAGE_SCAN_CHANNEL_CAP: usize = 5;

#[derive(Debug, Deserialize)]
struct AuthTest {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    team: Option<String>,
    #[serde(default)]
    team_id: Option<String>,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelList {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    channels: Vec<Channel>,
}

#[derive(Debug, Deserialize)]
struct Channel {
    id: String,
    name: String,
    #[serde(default)]
    num_members: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct History {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    messages: Vec<SlackMessage>,
}

#[derive(Debug, Deserialize)]
struct SlackMessage {
    #[serde(default)]
    ts: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    user: Option<String>,
}

/// Gateway for the Slack Web API.
pub struct SlackGateway {
    http: reqwest::Client,
    base_url: String,
}

impl SlackGateway {
    pub fn new(http_timeout: std::time::Duration) -> Result<Self> {
        Self::with_base_url(http_timeout, BASE_URL.to_string())
    }

    /// Custom base URL (for testing with a mock server).
    pub fn with_base_url(http_timeout: std::time::Duration, base_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, base_url })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<T, BrokerError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| transport_error(ServiceType::Slack, e))?;

        check_response_status(ServiceType::Slack, &response)?;
        response.json::<T>().await.map_err(|e| {
            BrokerError::ProviderUnavailable(format!("unparseable Slack response: {}", e))
        })
    }

    async fn channels(&self, access_token: &str, limit: u32) -> Result<Vec<Channel>, BrokerError> {
        let url = format!(
            "{}/api/conversations.list?exclude_archived=true&limit={}",
            self.base_url, limit
        );
        let list: ChannelList = self.get_json(&url, access_token).await?;
        if !list.ok {
            return Err(envelope_error(list.error));
        }
        Ok(list.channels)
    }

    async fn history(
        &self,
        access_token: &str,
        channel_id: &str,
        limit: u32,
    ) -> Result<Vec<SlackMessage>, BrokerError> {
        let url = format!(
            "{}/api/conversations.history?channel={}&limit={}",
            self.base_url,
            urlencoding::encode(channel_id),
            limit
        );
        let history: History = self.get_json(&url, access_token).await?;
        if !history.ok {
            return Err(envelope_error(history.error));
        }
        Ok(history.messages)
    }
}

/// Map Slack's `ok:false` error codes into the taxonomy.
fn envelope_error(error: Option<String>) -> BrokerError {
    let code = error.unwrap_or_else(|| "unknown_error".to_string());
    match code.as_str() {
        "invalid_auth" | "token_revoked" | "token_expired" | "account_inactive"
        | "not_authed" => BrokerError::TokenRejected(format!("Slack reported {}", code)),
        _ => BrokerError::ProviderUnavailable(format!("Slack reported {}", code)),
    }
}

#[async_trait]
impl SyncGateway for SlackGateway {
    fn service(&self) -> ServiceType {
        ServiceType::Slack
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<ProviderIdentity, BrokerError> {
        let url = format!("{}/api/auth.test", self.base_url);
        let auth: AuthTest = self.get_json(&url, access_token).await?;
        if !auth.ok {
            return Err(envelope_error(auth.error));
        }
        let workspace = auth.team.unwrap_or_else(|| "unknown".to_string());
        Ok(ProviderIdentity {
            display_name: workspace.clone(),
            extra: json!({
                "workspace_name": workspace,
                "team_id": auth.team_id,
                "user": auth.user,
            }),
        })
    }

    async fn fetch_summary(&self, access_token: &str) -> Result<ProviderSummary, BrokerError> {
        let identity = self.fetch_identity(access_token).await?;
        let channels = self.channels(access_token, 200).await?;
        Ok(ProviderSummary {
            resource_count: channels.len() as u64,
            unread_count: None,
            display_name: Some(identity.display_name),
        })
    }

    async fn fetch_list(
        &self,
        access_token: &str,
        paging: &Paging,
    ) -> Result<Vec<SyncItem>, BrokerError> {
        // With a channel filter, read that channel's history directly.
        // Without one, walk the first few channels until the limit is
        // reached.
        let channel_ids: Vec<(String, String)> = match &paging.filter {
            Some(channel_id) => vec![(channel_id.clone(), channel_id.clone())],
            None => self
                .channels(access_token, 100)
                .await?
                .into_iter()
                .take(MESSAGE_SCAN_CHANNEL_CAP)
                .map(|c| (c.id, c.name))
                .collect(),
        };

        let mut items = Vec::new();
        for (channel_id, channel_name) in channel_ids {
            if items.len() as u32 >= paging.limit {
                break;
            }
            let remaining = paging.limit - items.len() as u32;
            let messages = self.history(access_token, &channel_id, remaining).await?;
            for message in messages {
                items.push(SyncItem {
                    id: format!("{}:{}", channel_id, message.ts),
                    title: channel_name.clone(),
                    snippet: Some(message.text),
                    timestamp: Some(message.ts),
                    unread: None,
                    extra: json!({ "channel": channel_id, "user": message.user }),
                });
            }
        }

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn gateway(base: &str) -> SlackGateway {
        SlackGateway::with_base_url(std::time::Duration::from_secs(5), base.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_identity() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/auth.test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok": true, "team": "Acme", "team_id": "T123", "user": "alice"}"#)
            .create_async()
            .await;

        let identity = gateway(&server.url()).fetch_identity("token").await.unwrap();
        assert_eq!(identity.display_name, "Acme");
        assert_eq!(identity.extra["team_id"], "T123");
    }

    #[tokio::test]
    async fn test_ok_false_revocation_maps_to_token_rejected() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/auth.test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok": false, "error": "token_revoked"}"#)
            .create_async()
            .await;

        let err = gateway(&server.url()).fetch_identity("bad").await.unwrap_err();
        assert!(matches!(err, BrokerError::TokenRejected(_)));
    }

    #[tokio::test]
    async fn test_ok_false_transient_maps_to_unavailable() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/auth.test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok": false, "error": "ratelimited"}"#)
            .create_async()
            .await;

        let err = gateway(&server.url()).fetch_identity("token").await.unwrap_err();
        assert!(matches!(err, BrokerError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn test_fetch_summary_counts_channels() {
        let mut server = Server::new_async().await;
        let _auth = server
            .mock("GET", "/api/auth.test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok": true, "team": "Acme"}"#)
            .create_async()
            .await;
        let _channels = server
            .mock(
                "GET",
                "/api/conversations.list?exclude_archived=true&limit=200",
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"ok": true, "channels": [
                    {"id": "C1", "name": "general"},
                    {"id": "C2", "name": "random"}
                ]}"#,
            )
            .create_async()
            .await;

        let summary = gateway(&server.url()).fetch_summary("token").await.unwrap();
        assert_eq!(summary.resource_count, 2);
        assert_eq!(summary.display_name.as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn test_fetch_list_with_channel_filter() {
        let mut server = Server::new_async().await;
        let _history = server
            .mock("GET", "/api/conversations.history?channel=C1&limit=20")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"ok": true, "messages": [
                    {"ts": "1722945600.000100", "text": "hello", "user": "U1"}
                ]}"#,
            )
            .create_async()
            .await;

        let paging = Paging {
            filter: Some("C1".to_string()),
            ..Paging::default()
        };
        let items = gateway(&server.url())
            .fetch_list("token", &paging)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].snippet.as_deref(), Some("hello"));
        assert_eq!(items[0].extra["channel"], "C1");
    }
}

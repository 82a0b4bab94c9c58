//! Gmail REST gateway.

use async_trait::async_trait;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::{
    check_response_status, transport_error, Paging, ProviderIdentity, ProviderSummary, SyncGateway,
    SyncItem,
};
use crate::error::BrokerError;
use crate::provider::ServiceType;

const BASE_URL: &str = "https://www.googleapis.com";

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Profile {
    #[serde(rename = "emailAddress")]
    email_address: String,
    #[serde(rename = "messagesTotal", default)]
    messages_total: u64,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
    #[serde(rename = "resultSizeEstimate", default)]
    result_size_estimate: u64,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Message {
    id: String,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(rename = "labelIds", default)]
    label_ids: Vec<String>,
    #[serde(default)]
    payload: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

impl Message {
    fn header(&self, name: &str) -> Option<&str> {
        self.payload.as_ref().and_then(|p| {
            p.headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.as_str())
        })
    }
}

/// Gateway for the Gmail API.
pub struct GmailGateway {
    http: reqwest::Client,
    base_url: String,
}

impl GmailGateway {
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
            .map_err(|e| transport_error(ServiceType::Gmail, e))?;

        check_response_status(ServiceType::Gmail, &response)?;
        response.json::<T>().await.map_err(|e| {
            BrokerError::ProviderUnavailable(format!("unparseable Gmail response: {}", e))
        })
    }
}

#[async_trait]
impl SyncGateway for GmailGateway {
    fn service(&self) -> ServiceType {
        ServiceType::Gmail
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<ProviderIdentity, BrokerError> {
        let url = format!("{}/oauth2/v2/userinfo", self.base_url);
        let info: UserInfo = self.get_json(&url, access_token).await?;
        let email = info.email.unwrap_or_else(|| "gmail".to_string());
        Ok(ProviderIdentity {
            display_name: email.clone(),
            extra: json!({ "email_address": email }),
        })
    }

    async fn fetch_summary(&self, access_token: &str) -> Result<ProviderSummary, BrokerError> {
        let profile_url = format!("{}/gmail/v1/users/me/profile", self.base_url);
        let profile: Profile = self.get_json(&profile_url, access_token).await?;

        // Unread estimate, inbox only
        let unread_url = format!(
            "{}/gmail/v1/users/me/messages?q={}&maxResults=1",
            self.base_url,
            urlencoding::encode("is:unread in:inbox")
        );
        let unread: MessageList = self.get_json(&unread_url, access_token).await?;

        Ok(ProviderSummary {
            resource_count: profile.messages_total,
            unread_count: Some(unread.result_size_estimate),
            display_name: Some(profile.email_address),
        })
    }

    async fn fetch_list(
        &self,
        access_token: &str,
        paging: &Paging,
    ) -> Result<Vec<SyncItem>, BrokerError> {
        let mut list_url = format!(
            "{}/gmail/v1/users/me/messages?maxResults={}",
            self.base_url, paging.limit
        );
        if let Some(query) = &paging.filter {
            list_url.push_str(&format!("&q={}", urlencoding::encode(query)));
        }
        let list: MessageList = self.get_json(&list_url, access_token).await?;

        let mut items = Vec::with_capacity(list.messages.len());
        for message_ref in list.messages {
            let detail_url = format!(
                "{}/gmail/v1/users/me/messages/{}?format=metadata&metadataHeaders=From&metadataHeaders=Subject&metadataHeaders=Date",
                self.base_url, message_ref.id
            );
            let message: Message = match self.get_json(&detail_url, access_token).await {
                Ok(message) => message,
                Err(e @ BrokerError::TokenRejected(_)) => return Err(e),
                Err(e) => {
                    warn!(message_id = %message_ref.id, error = %e, "Skipping unreadable message");
                    continue;
                }
            };

            let unread = message.label_ids.iter().any(|l| l == "UNREAD");
            items.push(SyncItem {
                id: message.id.clone(),
                title: message.header("Subject").unwrap_or("").to_string(),
                snippet: message.snippet.clone(),
                timestamp: message.header("Date").map(str::to_string),
                unread: Some(unread),
                extra: json!({ "from": message.header("From") }),
            });
        }

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn gateway(base: &str) -> GmailGateway {
        GmailGateway::with_base_url(std::time::Duration::from_secs(5), base.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_identity() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/oauth2/v2/userinfo")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"email": "alice@example.com"}"#)
            .create_async()
            .await;

        let identity = gateway(&server.url()).fetch_identity("token").await.unwrap();
        assert_eq!(identity.display_name, "alice@example.com");
    }

    #[tokio::test]
    async fn test_fetch_summary() {
        let mut server = Server::new_async().await;
        let _profile = server
            .mock("GET", "/gmail/v1/users/me/profile")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"emailAddress": "alice@example.com", "messagesTotal": 1234}"#)
            .create_async()
            .await;
        let _unread = server
            .mock(
                "GET",
                "/gmail/v1/users/me/messages?q=is%3Aunread%20in%3Ainbox&maxResults=1",
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"messages": [{"id": "m1"}], "resultSizeEstimate": 7}"#)
            .create_async()
            .await;

        let summary = gateway(&server.url()).fetch_summary("token").await.unwrap();
        assert_eq!(summary.resource_count, 1234);
        assert_eq!(summary.unread_count, Some(7));
        assert_eq!(summary.display_name.as_deref(), Some("alice@example.com"));
    }

    #[tokio::test]
    async fn test_fetch_list_reads_metadata() {
        let mut server = Server::new_async().await;
        let _list = server
            .mock("GET", "/gmail/v1/users/me/messages?maxResults=1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"messages": [{"id": "m1"}], "resultSizeEstimate": 1}"#)
            .create_async()
            .await;
        let _detail = server
            .mock(
                "GET",
                "/gmail/v1/users/me/messages/m1?format=metadata&metadataHeaders=From&metadataHeaders=Subject&metadataHeaders=Date",
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "id": "m1",
                    "snippet": "Hello there",
                    "labelIds": ["INBOX", "UNREAD"],
                    "payload": {"headers": [
                        {"name": "Subject", "value": "Greetings"},
                        {"name": "From", "value": "bob@example.com"},
                        {"name": "Date", "value": "Thu, 06 Aug 2026 10:00:00 +0000"}
                    ]}
                }"#,
            )
            .create_async()
            .await;

        let paging = Paging {
            limit: 1,
            ..Paging::default()
        };
        let items = gateway(&server.url())
            .fetch_list("token", &paging)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Greetings");
        assert_eq!(items[0].unread, Some(true));
        assert_eq!(items[0].extra["from"], "bob@example.com");
    }

    #[tokio::test]
    async fn test_401_maps_to_token_rejected() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/gmail/v1/users/me/profile")
            .with_status(401)
            .create_async()
            .await;

        let err = gateway(&server.url()).fetch_summary("bad").await.unwrap_err();
        assert!(matches!(err, BrokerError::TokenRejected(_)));
    }
}

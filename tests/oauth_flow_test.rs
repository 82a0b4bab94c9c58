// End-to-end OAuth flow tests: authorize URL → provider callback →
// connected integration → sync, against a mock provider.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

use tether::api::{create_router, ApiState};
use tether::gateway::{GatewaySet, GithubGateway, GmailGateway, SlackGateway};
use tether::integration::{IntegrationManager, IntegrationStore};
use tether::oauth::{OAuthBroker, StateSealer};
use tether::provider::{ProviderRegistry, ServiceType};
use tether::resolver::{CredentialResolver, DefaultClient};
use tether::vault::{SecretStore, SecretVault};

struct TestApp {
    router: Router,
    secrets: Arc<SecretStore>,
    vault: Arc<SecretVault>,
}

/// App wired to a mock provider. `defaults` controls which providers
/// have a system-wide OAuth application configured.
fn create_test_app(server_url: &str, defaults: &[ServiceType]) -> TestApp {
    let vault = Arc::new(SecretVault::new(&BASE64.encode([6u8; 32])).unwrap());
    let secrets = Arc::new(SecretStore::in_memory().unwrap());
    let integrations = Arc::new(IntegrationStore::in_memory().unwrap());

    let mut default_clients = HashMap::new();
    for service in defaults {
        default_clients.insert(
            *service,
            DefaultClient {
                client_id: "default-id".to_string(),
                client_secret: "default-secret".to_string(),
            },
        );
    }
    let resolver = Arc::new(CredentialResolver::new(
        secrets.clone(),
        vault.clone(),
        default_clients,
        "http://localhost:8888".to_string(),
    ));

    let mut registry = ProviderRegistry::new();
    for service in [ServiceType::Gmail, ServiceType::Github, ServiceType::Slack] {
        registry.override_endpoints(
            service,
            &format!("{}/authorize", server_url),
            &format!("{}/token", server_url),
            &format!("{}/userinfo", server_url),
        );
    }

    let timeout = std::time::Duration::from_secs(5);
    let broker = Arc::new(
        OAuthBroker::new(
            resolver.clone(),
            Arc::new(registry),
            StateSealer::new(vault.clone(), 600),
            timeout,
        )
        .unwrap(),
    );

    let gateways = Arc::new(GatewaySet::from_gateways(vec![
        Box::new(GithubGateway::with_base_url(timeout, server_url.to_string()).unwrap()),
        Box::new(GmailGateway::with_base_url(timeout, server_url.to_string()).unwrap()),
        Box::new(SlackGateway::with_base_url(timeout, server_url.to_string()).unwrap()),
    ]));

    let manager = Arc::new(IntegrationManager::new(
        vault.clone(),
        secrets.clone(),
        integrations,
        broker.clone(),
        resolver,
        gateways,
        60,
    ));

    let router = create_router(ApiState {
        vault: vault.clone(),
        secrets: secrets.clone(),
        manager,
        broker,
        frontend_url: "http://localhost:88".to_string(),
        callback_base_url: "http://localhost:8888".to_string(),
    });

    TestApp {
        router,
        secrets,
        vault,
    }
}

fn authed(request: axum::http::request::Builder, user: &str) -> axum::http::request::Builder {
    request.header("authorization", format!("Bearer {}", user))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Pull one query parameter out of a URL.
fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    let params: Vec<(String, String)> = serde_urlencoded::from_str(query).ok()?;
    params.into_iter().find(|(k, _)| k == name).map(|(_, v)| v)
}

/// Run the authorize step and return the sealed state parameter the
/// provider would echo back.
async fn authorize_state(app: &TestApp, user: &str, provider: &str) -> String {
    let response = app
        .router
        .clone()
        .oneshot(
            authed(
                Request::builder().uri(format!("/auth/{}/authorize", provider)),
                user,
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let auth_url = body["auth_url"].as_str().unwrap();
    query_param(auth_url, "state").expect("authorize URL carries a state parameter")
}

#[tokio::test]
async fn test_authorize_without_any_config_is_4xx() {
    // End-to-end scenario 1: no secrets, no system default for slack
    let app = create_test_app("http://localhost:1", &[]);

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::builder().uri("/auth/slack/authorize"), "user1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("slack"));

    // The slack integration list stays empty
    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::builder().uri("/messages/integrations"), "user1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_authorize_url_shape() {
    let app = create_test_app("http://localhost:1", &[ServiceType::Github]);

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::builder().uri("/auth/github/authorize"), "user1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let auth_url = body["auth_url"].as_str().unwrap();
    assert!(auth_url.contains("client_id=default-id"));
    assert!(auth_url.contains("response_type=code"));
    assert!(query_param(auth_url, "state").is_some());
    assert_eq!(
        body["redirect_uri"],
        "http://localhost:8888/auth/github/callback"
    );
}

#[tokio::test]
async fn test_unknown_provider_is_404() {
    let app = create_test_app("http://localhost:1", &[]);

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::builder().uri("/auth/calendar/authorize"), "user1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_gmail_connect_and_sync_end_to_end() {
    // End-to-end scenario 2: connect succeeds, then sync works
    // without another OAuth round trip
    let mut server = mockito::Server::new_async().await;
    let token_mock = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"access_token": "at-1", "refresh_token": "rt-1", "expires_in": 3600}"#,
        )
        .expect(1)
        .create_async()
        .await;
    let _userinfo = server
        .mock("GET", "/oauth2/v2/userinfo")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"email": "alice@example.com"}"#)
        .create_async()
        .await;
    let _profile = server
        .mock("GET", "/gmail/v1/users/me/profile")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"emailAddress": "alice@example.com", "messagesTotal": 321}"#)
        .create_async()
        .await;
    let _unread = server
        .mock(
            "GET",
            "/gmail/v1/users/me/messages?q=is%3Aunread%20in%3Ainbox&maxResults=1",
        )
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"resultSizeEstimate": 4}"#)
        .create_async()
        .await;

    let app = create_test_app(&server.url(), &[ServiceType::Gmail]);
    let state = authorize_state(&app, "user1", "google").await;

    // Provider redirects the browser back with code + state
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/auth/google/callback?code=auth-code&state={}",
                    urlencoding::encode(&state)
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(location.starts_with("http://localhost:88/?"));
    assert_eq!(query_param(&location, "oauth_success").as_deref(), Some("true"));
    let integration_id = query_param(&location, "integration_id").unwrap();

    // Integration is connected with display config from the identity call
    let response = app
        .router
        .clone()
        .oneshot(
            authed(
                Request::builder().uri(format!("/email/integrations/{}", integration_id)),
                "user1",
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let integration = body_json(response).await;
    assert_eq!(integration["status"], "connected");
    assert_eq!(integration["config"]["email_address"], "alice@example.com");
    let first_updated_at = integration["updated_at"].as_str().unwrap().to_string();

    // A token secret exists, encrypted, named after the account
    let stored = app.secrets.list_for_user("user1").unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].name, "Gmail - alice@example.com");
    assert!(!stored[0].encrypted_value.contains("at-1"));
    let bundle = app.vault.decrypt_bundle(&stored[0].encrypted_value).unwrap();
    assert_eq!(bundle["kind"], "token");
    assert_eq!(bundle["access_token"], "at-1");
    assert_eq!(bundle["refresh_token"], "rt-1");

    // Sync updates counts and updated_at without touching /token again
    let response = app
        .router
        .clone()
        .oneshot(
            authed(
                Request::builder()
                    .method("POST")
                    .uri(format!("/email/integrations/{}/sync", integration_id)),
                "user1",
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let synced = body_json(response).await;
    assert_eq!(synced["status"], "connected");
    assert_eq!(synced["config"]["unread_count"], 4);
    assert_eq!(synced["config"]["messages_total"], 321);
    assert!(synced["updated_at"].as_str().unwrap() >= first_updated_at.as_str());

    token_mock.assert_async().await;
}

#[tokio::test]
async fn test_callback_with_provider_error_redirects_with_reason() {
    let app = create_test_app("http://localhost:1", &[ServiceType::Gmail]);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/auth/google/callback?error=access_denied&error_description=User+cancelled")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(
        query_param(location, "oauth_error").as_deref(),
        Some("access_denied")
    );
}

#[tokio::test]
async fn test_callback_with_forged_state_rejected() {
    let app = create_test_app("http://localhost:1", &[ServiceType::Gmail]);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/auth/google/callback?code=auth-code&state=forged-state")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(
        query_param(location, "oauth_error").as_deref(),
        Some("invalid_state")
    );
}

#[tokio::test]
async fn test_callback_provider_mismatch_rejected() {
    let app = create_test_app("http://localhost:1", &[ServiceType::Gmail, ServiceType::Github]);
    // State sealed for google, callback hit on github
    let state = authorize_state(&app, "user1", "google").await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/auth/github/callback?code=auth-code&state={}",
                    urlencoding::encode(&state)
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(
        query_param(location, "oauth_error").as_deref(),
        Some("invalid_state")
    );
}

#[tokio::test]
async fn test_callback_exchange_failure_redirects() {
    let mut server = mockito::Server::new_async().await;
    let _token = server
        .mock("POST", "/token")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": "invalid_grant", "error_description": "expired"}"#)
        .create_async()
        .await;

    let app = create_test_app(&server.url(), &[ServiceType::Gmail]);
    let state = authorize_state(&app, "user1", "google").await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/auth/google/callback?code=stale&state={}",
                    urlencoding::encode(&state)
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(
        query_param(location, "oauth_error").as_deref(),
        Some("token_exchange_failed")
    );

    // No integration row was created
    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::builder().uri("/email/integrations"), "user1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_user_secret_drives_authorize_url() {
    // Resolver priority surfaces end-to-end: the user's own OAuth app
    // wins over the system default
    let app = create_test_app("http://localhost:1", &[ServiceType::Github]);

    let mut bundle = tether::vault::SecretBundle::new();
    bundle.insert("client_id".to_string(), serde_json::json!("user-app-id"));
    bundle.insert(
        "client_secret".to_string(),
        serde_json::json!("user-app-secret"),
    );
    let blob = app.vault.encrypt_bundle(&bundle).unwrap();
    app.secrets
        .create("user1", "My GitHub app", "github", &blob)
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::builder().uri("/auth/github/authorize"), "user1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    let auth_url = body["auth_url"].as_str().unwrap();
    assert!(auth_url.contains("client_id=user-app-id"));
}

#[tokio::test]
async fn test_redirect_uris_endpoint() {
    let app = create_test_app("http://localhost:1", &[]);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/oauth/redirect-uris")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["google"], "http://localhost:8888/auth/google/callback");
    assert_eq!(body["github"], "http://localhost:8888/auth/github/callback");
    assert_eq!(body["slack"], "http://localhost:8888/auth/slack/callback");
}

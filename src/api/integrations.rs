//! Per-provider integration endpoints.
//!
//! The companion frontend addresses providers by data domain:
//! `/email` (Gmail), `/github` (GitHub), `/messages` (Slack). Each
//! family gets the same five routes; handlers delegate to shared
//! logic parameterized by service type.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use super::{ApiState, AppError};
use crate::auth::extract_user_id;
use crate::gateway::{Paging, SyncItem};
use crate::integration::Integration;
use crate::provider::ServiceType;

/// Request body for POST /{family}/integrations
#[derive(Deserialize)]
pub struct CreateIntegrationRequest {
    /// Existing Secret to attach. Absent creates a pending row.
    pub credential_id: Option<i64>,
}

/// Query parameters for item listings
#[derive(Deserialize, Default)]
pub struct ItemsQuery {
    pub limit: Option<u32>,
    pub page: Option<u32>,
    /// Slack channel filter.
    pub channel_id: Option<String>,
    /// Gmail search query.
    pub q: Option<String>,
}

impl ItemsQuery {
    fn into_paging(self) -> Paging {
        Paging {
            limit: self.limit.unwrap_or(20).clamp(1, 100),
            page: self.page.unwrap_or(1).max(1),
            filter: self.channel_id.or(self.q),
        }
    }
}

/// Create the integration API router for all provider families.
pub fn create_integration_router(state: ApiState) -> Router {
    Router::new()
        .route("/email/integrations", get(list_email).post(create_email))
        .route(
            "/email/integrations/:id",
            get(get_email).delete(delete_email),
        )
        .route("/email/integrations/:id/sync", post(sync_email))
        .route("/email/integrations/:id/emails", get(items_email))
        .route("/github/integrations", get(list_github).post(create_github))
        .route(
            "/github/integrations/:id",
            get(get_github).delete(delete_github),
        )
        .route("/github/integrations/:id/sync", post(sync_github))
        .route("/github/integrations/:id/repos", get(items_github))
        .route(
            "/messages/integrations",
            get(list_slack).post(create_slack),
        )
        .route(
            "/messages/integrations/:id",
            get(get_slack).delete(delete_slack),
        )
        .route("/messages/integrations/:id/sync", post(sync_slack))
        .route("/messages/integrations/:id/messages", get(items_slack))
        .with_state(Arc::new(state))
}

// Shared handler logic, parameterized by provider

async fn list_integrations(
    state: Arc<ApiState>,
    headers: HeaderMap,
    service: ServiceType,
) -> Result<Json<Vec<Integration>>, AppError> {
    let user_id = extract_user_id(&headers)?;
    debug!(user = %user_id, service = %service, "Listing integrations");
    Ok(Json(state.manager.list(&user_id, Some(service))?))
}

async fn create_integration(
    state: Arc<ApiState>,
    headers: HeaderMap,
    service: ServiceType,
    body: CreateIntegrationRequest,
) -> Result<(StatusCode, Json<Integration>), AppError> {
    let user_id = extract_user_id(&headers)?;

    let integration = match body.credential_id {
        Some(credential_id) => {
            state
                .manager
                .create_from_secret(&user_id, service, credential_id)
                .await?
        }
        None => state.manager.create_pending(&user_id, service)?,
    };

    info!(
        user = %user_id,
        service = %service,
        integration_id = integration.id,
        status = %integration.status,
        "Integration created"
    );
    Ok((StatusCode::CREATED, Json(integration)))
}

async fn get_integration(
    state: Arc<ApiState>,
    headers: HeaderMap,
    service: ServiceType,
    id: i64,
) -> Result<Json<Integration>, AppError> {
    let user_id = extract_user_id(&headers)?;
    let integration = state.manager.get(&user_id, id)?;
    if integration.service_type != service {
        return Err(AppError::NotFound(format!("Integration {} not found", id)));
    }
    Ok(Json(integration))
}

async fn delete_integration(
    state: Arc<ApiState>,
    headers: HeaderMap,
    service: ServiceType,
    id: i64,
) -> Result<Json<serde_json::Value>, AppError> {
    let user_id = extract_user_id(&headers)?;
    let integration = state.manager.get(&user_id, id)?;
    if integration.service_type != service {
        return Err(AppError::NotFound(format!("Integration {} not found", id)));
    }

    state.manager.delete(&user_id, id)?;
    Ok(Json(
        serde_json::json!({ "message": "Integration deleted successfully" }),
    ))
}

async fn sync_integration(
    state: Arc<ApiState>,
    headers: HeaderMap,
    service: ServiceType,
    id: i64,
) -> Result<Json<Integration>, AppError> {
    let user_id = extract_user_id(&headers)?;
    let integration = state.manager.get(&user_id, id)?;
    if integration.service_type != service {
        return Err(AppError::NotFound(format!("Integration {} not found", id)));
    }

    Ok(Json(state.manager.sync(&user_id, id).await?))
}

async fn list_items(
    state: Arc<ApiState>,
    headers: HeaderMap,
    service: ServiceType,
    id: i64,
    query: ItemsQuery,
) -> Result<Json<Vec<SyncItem>>, AppError> {
    let user_id = extract_user_id(&headers)?;
    let integration = state.manager.get(&user_id, id)?;
    if integration.service_type != service {
        return Err(AppError::NotFound(format!("Integration {} not found", id)));
    }

    let paging = query.into_paging();
    Ok(Json(state.manager.list_items(&user_id, id, &paging).await?))
}

// /email — Gmail

async fn list_email(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Integration>>, AppError> {
    list_integrations(state, headers, ServiceType::Gmail).await
}

async fn create_email(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<CreateIntegrationRequest>,
) -> Result<(StatusCode, Json<Integration>), AppError> {
    create_integration(state, headers, ServiceType::Gmail, body).await
}

async fn get_email(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Integration>, AppError> {
    get_integration(state, headers, ServiceType::Gmail, id).await
}

async fn delete_email(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    delete_integration(state, headers, ServiceType::Gmail, id).await
}

async fn sync_email(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Integration>, AppError> {
    sync_integration(state, headers, ServiceType::Gmail, id).await
}

async fn items_email(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<ItemsQuery>,
) -> Result<Json<Vec<SyncItem>>, AppError> {
    list_items(state, headers, ServiceType::Gmail, id, query).await
}

// /github — GitHub

async fn list_github(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Integration>>, AppError> {
    list_integrations(state, headers, ServiceType::Github).await
}

async fn create_github(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<CreateIntegrationRequest>,
) -> Result<(StatusCode, Json<Integration>), AppError> {
    create_integration(state, headers, ServiceType::Github, body).await
}

async fn get_github(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Integration>, AppError> {
    get_integration(state, headers, ServiceType::Github, id).await
}

async fn delete_github(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    delete_integration(state, headers, ServiceType::Github, id).await
}

async fn sync_github(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Integration>, AppError> {
    sync_integration(state, headers, ServiceType::Github, id).await
}

async fn items_github(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<ItemsQuery>,
) -> Result<Json<Vec<SyncItem>>, AppError> {
    list_items(state, headers, ServiceType::Github, id, query).await
}

// /messages — Slack

async fn list_slack(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Integration>>, AppError> {
    list_integrations(state, headers, ServiceType::Slack).await
}

async fn create_slack(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<CreateIntegrationRequest>,
) -> Result<(StatusCode, Json<Integration>), AppError> {
    create_integration(state, headers, ServiceType::Slack, body).await
}

async fn get_slack(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Integration>, AppError> {
    get_integration(state, headers, ServiceType::Slack, id).await
}

async fn delete_slack(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    delete_integration(state, headers, ServiceType::Slack, id).await
}

async fn sync_slack(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Integration>, AppError> {
    sync_integration(state, headers, ServiceType::Slack, id).await
}

async fn items_slack(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<ItemsQuery>,
) -> Result<Json<Vec<SyncItem>>, AppError> {
    list_items(state, headers, ServiceType::Slack, id, query).await
}

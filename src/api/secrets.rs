//! Vault CRUD endpoints.
//!
//! Secrets are write-only through the normal surface: list and get
//! return metadata, never ciphertext or plaintext. The one exception
//! is `/secrets/get-decryptable`, which the credential-form UI uses to
//! prefill saved fields.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ApiState, AppError};
use crate::auth::extract_user_id;
use crate::vault::{SecretBundle, SecretRecord};

/// `service_type` values a secret may carry: the closed provider set
/// plus the family aliases the resolver understands.
const ALLOWED_SERVICE_TYPES: &[&str] = &["github", "gmail", "email", "slack", "messages", "custom"];

/// Secret metadata; ciphertext is never serialized.
#[derive(Serialize, Debug)]
pub struct SecretResponse {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub service_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SecretRecord> for SecretResponse {
    fn from(record: SecretRecord) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id,
            name: record.name,
            service_type: record.service_type,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Request body for POST /secrets
#[derive(Deserialize)]
pub struct CreateSecretRequest {
    pub name: String,
    pub service_type: String,
    /// Sensitive fields, encrypted together as one bundle.
    pub fields: SecretBundle,
}

/// Request body for PUT /secrets/:id (all fields optional)
#[derive(Deserialize)]
pub struct UpdateSecretRequest {
    pub name: Option<String>,
    pub service_type: Option<String>,
    pub fields: Option<SecretBundle>,
}

/// One row of GET /secrets/get-decryptable
#[derive(Serialize)]
pub struct DecryptableSecret {
    pub id: i64,
    pub name: String,
    pub service_type: String,
    /// `None` with an error marker when the row no longer decrypts.
    pub fields: Option<SecretBundle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Create secret API router
pub fn create_secret_router(state: ApiState) -> Router {
    Router::new()
        .route("/secrets", get(list_secrets).post(create_secret))
        .route("/secrets/get-decryptable", get(get_decryptable))
        .route(
            "/secrets/:id",
            axum::routing::put(update_secret).delete(delete_secret),
        )
        .with_state(Arc::new(state))
}

fn validate_service_type(service_type: &str) -> Result<(), AppError> {
    if ALLOWED_SERVICE_TYPES.contains(&service_type.to_lowercase().as_str()) {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "Unknown service_type '{}'",
            service_type
        )))
    }
}

/// GET /secrets - List the caller's secrets (metadata only)
async fn list_secrets(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<SecretResponse>>, AppError> {
    let user_id = extract_user_id(&headers)?;

    let secrets = state
        .secrets
        .list_for_user(&user_id)
        .map_err(|e| AppError::ServerError(format!("Failed to list secrets: {}", e)))?;

    Ok(Json(secrets.into_iter().map(SecretResponse::from).collect()))
}

/// POST /secrets - Store a new encrypted credential bundle
async fn create_secret(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<CreateSecretRequest>,
) -> Result<(StatusCode, Json<SecretResponse>), AppError> {
    let user_id = extract_user_id(&headers)?;
    validate_service_type(&body.service_type)?;

    let blob = state
        .vault
        .encrypt_bundle(&body.fields)
        .map_err(|e| AppError::ServerError(format!("Failed to encrypt secret: {}", e)))?;

    let record = state
        .secrets
        .create(&user_id, &body.name, &body.service_type, &blob)
        .map_err(|e| AppError::ServerError(format!("Failed to store secret: {}", e)))?;

    info!(user = %user_id, secret_id = record.id, service = %record.service_type, "Secret created");
    Ok((StatusCode::CREATED, Json(SecretResponse::from(record))))
}

/// PUT /secrets/:id - Update name, service_type, and/or fields
async fn update_secret(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<UpdateSecretRequest>,
) -> Result<Json<SecretResponse>, AppError> {
    let user_id = extract_user_id(&headers)?;
    if let Some(service_type) = &body.service_type {
        validate_service_type(service_type)?;
    }

    let blob = match &body.fields {
        Some(fields) => Some(
            state
                .vault
                .encrypt_bundle(fields)
                .map_err(|e| AppError::ServerError(format!("Failed to encrypt secret: {}", e)))?,
        ),
        None => None,
    };

    let record = state
        .secrets
        .update(
            &user_id,
            id,
            body.name.as_deref(),
            body.service_type.as_deref(),
            blob.as_deref(),
        )
        .map_err(|e| AppError::ServerError(format!("Failed to update secret: {}", e)))?
        .ok_or_else(|| AppError::NotFound("Secret not found or unauthorized".to_string()))?;

    debug!(user = %user_id, secret_id = id, "Secret updated");
    Ok(Json(SecretResponse::from(record)))
}

/// DELETE /secrets/:id
///
/// Integrations referencing the secret keep a defined state: their
/// back-reference is nulled and their status becomes `error`.
async fn delete_secret(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user_id = extract_user_id(&headers)?;

    let deleted = state
        .secrets
        .delete(&user_id, id)
        .map_err(|e| AppError::ServerError(format!("Failed to delete secret: {}", e)))?;

    if !deleted {
        return Err(AppError::NotFound(
            "Secret not found or unauthorized".to_string(),
        ));
    }

    let detached = state.manager.handle_secret_deleted(id).map_err(AppError::from)?;
    info!(user = %user_id, secret_id = id, detached, "Secret deleted");

    Ok(Json(
        serde_json::json!({ "message": "Secret deleted successfully" }),
    ))
}

/// GET /secrets/get-decryptable - Secrets with their decrypted fields
///
/// Rows that fail to decrypt are returned with `fields: null` and an
/// error marker so the caller can see which credential to replace.
async fn get_decryptable(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<DecryptableSecret>>, AppError> {
    let user_id = extract_user_id(&headers)?;

    let secrets = state
        .secrets
        .list_for_user(&user_id)
        .map_err(|e| AppError::ServerError(format!("Failed to list secrets: {}", e)))?;

    let decryptable = secrets
        .into_iter()
        .map(|record| match state.vault.decrypt_bundle(&record.encrypted_value) {
            Ok(fields) => DecryptableSecret {
                id: record.id,
                name: record.name,
                service_type: record.service_type,
                fields: Some(fields),
                error: None,
            },
            Err(e) => {
                warn!(secret_id = record.id, error = %e, "Secret no longer decrypts");
                DecryptableSecret {
                    id: record.id,
                    name: record.name,
                    service_type: record.service_type,
                    fields: None,
                    error: Some("decryption_failed".to_string()),
                }
            }
        })
        .collect();

    Ok(Json(decryptable))
}

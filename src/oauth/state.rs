//! Tamper-evident OAuth state parameter.
//!
//! The callback must be attributed to a user and provider without a
//! server-side session lookup, so the claims are sealed into the state
//! parameter itself with the vault cipher. The AES-GCM tag gives
//! tamper evidence; `issued_at` bounds the replay window.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::provider::ServiceType;
use crate::vault::SecretVault;

/// Claims carried by a sealed state parameter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateClaims {
    pub user_id: String,
    pub service: ServiceType,
    /// Random per-flow id, so two concurrent flows never share a state.
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
}

/// Seals and opens state parameters under the vault key.
#[derive(Clone)]
pub struct StateSealer {
    vault: Arc<SecretVault>,
    ttl: Duration,
}

impl StateSealer {
    /// `ttl_seconds` bounds how long an issued state stays valid
    /// (default deployment value: 600).
    pub fn new(vault: Arc<SecretVault>, ttl_seconds: i64) -> Self {
        Self {
            vault,
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Seal claims for `user_id` and `service` into an opaque string.
    pub fn seal(&self, user_id: &str, service: ServiceType) -> anyhow::Result<String> {
        let claims = StateClaims {
            user_id: user_id.to_string(),
            service,
            nonce: Uuid::new_v4().to_string(),
            issued_at: Utc::now(),
        };
        let plaintext = serde_json::to_vec(&claims)?;
        self.vault.seal_bytes(&plaintext)
    }

    /// Open a state parameter, verifying integrity and freshness.
    pub fn open(&self, state: &str) -> Result<StateClaims, BrokerError> {
        let plaintext = self
            .vault
            .open_bytes(state)
            .map_err(|_| BrokerError::InvalidState("integrity check failed".to_string()))?;

        let claims: StateClaims = serde_json::from_slice(&plaintext)
            .map_err(|e| BrokerError::InvalidState(format!("malformed claims: {}", e)))?;

        if Utc::now() - claims.issued_at > self.ttl {
            return Err(BrokerError::InvalidState("state expired".to_string()));
        }

        Ok(claims)
    }
}

//! Integration lifecycle records.
//!
//! An integration links a user, a provider, and the tokens needed to
//! act on their behalf. Status transitions follow a fixed machine:
//!
//! ```text
//! (no row) → connecting → connected ⇄ token_expired
//!                             │            │
//!                             └────────────┴──→ needs_reauth
//! ```
//!
//! `needs_reauth` is terminal until the user reconnects; `error` marks
//! a row whose secret was deleted out from under it. Any state can
//! return to "no row" via explicit deletion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod store;

pub mod manager;

pub use manager::{ConnectError, IntegrationManager};
pub use store::IntegrationStore;

use crate::provider::ServiceType;

/// Lifecycle state of an integration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    /// Row exists but no usable token yet (manual creation without a
    /// probe-able credential).
    Connecting,
    /// Tokens present and believed valid.
    Connected,
    /// Access token expired; transient, auto-recovered by refresh.
    TokenExpired,
    /// Refresh impossible; only a user reconnect fixes this.
    NeedsReauth,
    /// Linked secret was deleted; the back-reference is gone.
    Error,
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationStatus::Connecting => "connecting",
            IntegrationStatus::Connected => "connected",
            IntegrationStatus::TokenExpired => "token_expired",
            IntegrationStatus::NeedsReauth => "needs_reauth",
            IntegrationStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<IntegrationStatus> {
        match s {
            "connecting" => Some(IntegrationStatus::Connecting),
            "connected" => Some(IntegrationStatus::Connected),
            "token_expired" => Some(IntegrationStatus::TokenExpired),
            "needs_reauth" => Some(IntegrationStatus::NeedsReauth),
            "error" => Some(IntegrationStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One integration row.
///
/// `secret_id` is a weak back-reference to the Secret holding live
/// tokens, never ownership: deleting the Secret nulls it and flips the
/// status to [`IntegrationStatus::Error`].
#[derive(Clone, Debug, Serialize)]
pub struct Integration {
    pub id: i64,
    pub user_id: String,
    pub service_type: ServiceType,
    pub secret_id: Option<i64>,
    pub status: IntegrationStatus,
    /// Provider display metadata (workspace name, username, counts).
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

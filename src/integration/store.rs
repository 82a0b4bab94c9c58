//! Integration persistence backed by SQLite.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

use super::{Integration, IntegrationStatus};
use crate::provider::ServiceType;

/// Integration storage.
///
/// # Schema
/// ```sql
/// CREATE TABLE integrations (
///     id INTEGER PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     service_type TEXT NOT NULL,
///     secret_id INTEGER,           -- weak reference, may be NULL
///     status TEXT NOT NULL,
///     config TEXT,                 -- JSON, provider display metadata
///     created_at TEXT NOT NULL,    -- ISO 8601
///     updated_at TEXT NOT NULL,    -- ISO 8601
///     UNIQUE(user_id, service_type)
/// );
/// ```
///
/// The unique constraint enforces the supported cardinality: one
/// active integration per (user, service).
pub struct IntegrationStore {
    conn: Mutex<Connection>,
}

impl IntegrationStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open database")?;
        Self::with_connection(conn)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS integrations (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                service_type TEXT NOT NULL,
                secret_id INTEGER,
                status TEXT NOT NULL,
                config TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, service_type)
            )
            "#,
            [],
        )
        .context("Failed to create integrations table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_integrations_user ON integrations(user_id)",
            [],
        )
        .context("Failed to create index")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates or replaces the integration for (user, service).
    pub fn upsert(
        &self,
        user_id: &str,
        service: ServiceType,
        secret_id: Option<i64>,
        status: IntegrationStatus,
        config: &Value,
    ) -> Result<Integration> {
        let now = Utc::now().to_rfc3339();
        let config_json = serde_json::to_string(config).context("Failed to serialize config")?;
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                r#"
                INSERT INTO integrations (user_id, service_type, secret_id, status, config, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(user_id, service_type) DO UPDATE SET
                    secret_id = excluded.secret_id,
                    status = excluded.status,
                    config = excluded.config,
                    updated_at = excluded.updated_at
                "#,
                params![
                    user_id,
                    service.as_str(),
                    secret_id,
                    status.as_str(),
                    config_json,
                    now,
                    now,
                ],
            )
            .context("Failed to upsert integration")?;
        }
        self.find(user_id, service)?
            .ok_or_else(|| anyhow!("Upserted integration not found"))
    }

    /// Fetches one integration, scoped to its owner.
    pub fn get(&self, user_id: &str, id: i64) -> Result<Option<Integration>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, service_type, secret_id, status, config, created_at, updated_at
                 FROM integrations WHERE id = ?1 AND user_id = ?2",
            )
            .context("Failed to prepare query")?;
        let mut rows = stmt
            .query(params![id, user_id])
            .context("Failed to execute query")?;

        match rows.next().context("Failed to read row")? {
            Some(row) => Ok(Some(row_to_integration(row)?)),
            None => Ok(None),
        }
    }

    /// Fetches the integration for (user, service), if any.
    pub fn find(&self, user_id: &str, service: ServiceType) -> Result<Option<Integration>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, service_type, secret_id, status, config, created_at, updated_at
                 FROM integrations WHERE user_id = ?1 AND service_type = ?2",
            )
            .context("Failed to prepare query")?;
        let mut rows = stmt
            .query(params![user_id, service.as_str()])
            .context("Failed to execute query")?;

        match rows.next().context("Failed to read row")? {
            Some(row) => Ok(Some(row_to_integration(row)?)),
            None => Ok(None),
        }
    }

    /// Lists a user's integrations, optionally filtered to one service.
    pub fn list(&self, user_id: &str, service: Option<ServiceType>) -> Result<Vec<Integration>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, service_type, secret_id, status, config, created_at, updated_at
                 FROM integrations WHERE user_id = ?1 AND (?2 IS NULL OR service_type = ?2)
                 ORDER BY created_at ASC, id ASC",
            )
            .context("Failed to prepare query")?;

        let service_str = service.map(|s| s.as_str());
        let integrations = stmt
            .query_map(params![user_id, service_str], row_to_integration_rusqlite)
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        Ok(integrations)
    }

    /// Updates status (and `updated_at`).
    pub fn set_status(&self, id: i64, status: IntegrationStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE integrations SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), now],
            )
            .context("Failed to update integration status")?;
        Ok(())
    }

    /// Re-points the secret back-reference.
    pub fn set_secret(&self, id: i64, secret_id: Option<i64>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE integrations SET secret_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, secret_id, now],
            )
            .context("Failed to update integration secret")?;
        Ok(())
    }

    /// Shallow-merges `patch` into the stored config object and bumps
    /// `updated_at`.
    pub fn merge_config(&self, id: i64, patch: &Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let current: Option<String> = conn
            .query_row(
                "SELECT config FROM integrations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to read integration config")?;

        let mut config: Value = current
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_else(|| Value::Object(Default::default()));

        if let (Value::Object(config_map), Value::Object(patch_map)) = (&mut config, patch) {
            for (key, value) in patch_map {
                config_map.insert(key.clone(), value.clone());
            }
        }

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE integrations SET config = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, serde_json::to_string(&config)?, now],
        )
        .context("Failed to write integration config")?;
        Ok(())
    }

    /// Deletes an integration. Returns `false` when no owned row
    /// matched.
    pub fn delete(&self, user_id: &str, id: i64) -> Result<bool> {
        let rows_affected = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM integrations WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .context("Failed to delete integration")?;
        Ok(rows_affected > 0)
    }

    /// Secret-deletion hook: every integration referencing `secret_id`
    /// loses the reference and moves to `error` — a defined state,
    /// never a dangling pointer.
    pub fn detach_secret(&self, secret_id: i64) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let rows_affected = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE integrations SET secret_id = NULL, status = ?2, updated_at = ?3
                 WHERE secret_id = ?1",
                params![secret_id, IntegrationStatus::Error.as_str(), now],
            )
            .context("Failed to detach secret from integrations")?;
        Ok(rows_affected)
    }
}

fn row_to_integration(row: &rusqlite::Row<'_>) -> Result<Integration> {
    row_to_integration_rusqlite(row).context("Failed to map integration row")
}

fn row_to_integration_rusqlite(row: &rusqlite::Row<'_>) -> rusqlite::Result<Integration> {
    let service_type: String = row.get(2)?;
    let status: String = row.get(4)?;
    let config: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;

    Ok(Integration {
        id: row.get(0)?,
        user_id: row.get(1)?,
        service_type: ServiceType::parse(&service_type).ok_or_else(|| {
            invalid_text(2, format!("unknown service_type '{}'", service_type))
        })?,
        secret_id: row.get(3)?,
        status: IntegrationStatus::parse(&status)
            .ok_or_else(|| invalid_text(4, format!("unknown status '{}'", status)))?,
        config: config
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(Value::Null),
        created_at: parse_ts(&created_at, 6)?,
        updated_at: parse_ts(&updated_at, 7)?,
    })
}

fn invalid_text(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn parse_ts(value: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

//! Secret persistence backed by SQLite.
//!
//! Rows hold ciphertext only; encryption and decryption happen in
//! [`SecretVault`](super::SecretVault) before data reaches this store.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

/// One secret row. `encrypted_value` is an opaque ciphertext blob.
#[derive(Clone, Debug)]
pub struct SecretRecord {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub service_type: String,
    pub encrypted_value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Secret storage.
///
/// # Schema
/// ```sql
/// CREATE TABLE secrets (
///     id INTEGER PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     name TEXT NOT NULL,
///     service_type TEXT NOT NULL,
///     encrypted_value TEXT NOT NULL,  -- base64(nonce || ciphertext)
///     created_at TEXT NOT NULL,       -- ISO 8601
///     updated_at TEXT NOT NULL        -- ISO 8601
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in Mutex for safe concurrent access
/// - SQLite itself is thread-safe with serialized mode
pub struct SecretStore {
    conn: Mutex<Connection>,
}

impl SecretStore {
    /// Creates or opens a secret store at `db_path`.
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
            CREATE TABLE IF NOT EXISTS secrets (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                service_type TEXT NOT NULL,
                encrypted_value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create secrets table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_secrets_user ON secrets(user_id)",
            [],
        )
        .context("Failed to create index")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a new secret and returns the stored row.
    pub fn create(
        &self,
        user_id: &str,
        name: &str,
        service_type: &str,
        encrypted_value: &str,
    ) -> Result<SecretRecord> {
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO secrets (user_id, name, service_type, encrypted_value, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                user_id,
                name,
                service_type,
                encrypted_value,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .context("Failed to insert secret")?;

        let id = conn.last_insert_rowid();
        Ok(SecretRecord {
            id,
            user_id: user_id.to_string(),
            name: name.to_string(),
            service_type: service_type.to_string(),
            encrypted_value: encrypted_value.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Fetches one secret, scoped to its owner.
    pub fn get(&self, user_id: &str, id: i64) -> Result<Option<SecretRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, name, service_type, encrypted_value, created_at, updated_at
                 FROM secrets WHERE id = ?1 AND user_id = ?2",
            )
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![id, user_id])
            .context("Failed to execute query")?;

        match rows.next().context("Failed to read row")? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    /// Lists all of a user's secrets, oldest first.
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<SecretRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, name, service_type, encrypted_value, created_at, updated_at
                 FROM secrets WHERE user_id = ?1 ORDER BY created_at ASC, id ASC",
            )
            .context("Failed to prepare query")?;

        let records = stmt
            .query_map(params![user_id], |row| {
                row_to_record_rusqlite(row)
            })
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        Ok(records)
    }

    /// Lists a user's secrets whose `service_type` is one of `families`,
    /// earliest created first. The ordering is the documented tie-break
    /// for credential resolution.
    pub fn find_for_service(&self, user_id: &str, families: &[&str]) -> Result<Vec<SecretRecord>> {
        // rusqlite has no array binding; the family list is a short,
        // code-controlled set so the placeholders are built inline.
        let placeholders = families
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, user_id, name, service_type, encrypted_value, created_at, updated_at
             FROM secrets WHERE user_id = ?1 AND LOWER(service_type) IN ({})
             ORDER BY created_at ASC, id ASC",
            placeholders
        );

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql).context("Failed to prepare query")?;

        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&user_id];
        for family in families {
            values.push(family);
        }

        let records = stmt
            .query_map(values.as_slice(), |row| row_to_record_rusqlite(row))
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        Ok(records)
    }

    /// Updates name / service_type / ciphertext; `None` leaves the
    /// column untouched. Returns the updated row, or `None` when the
    /// secret does not exist or is not owned by `user_id`.
    pub fn update(
        &self,
        user_id: &str,
        id: i64,
        name: Option<&str>,
        service_type: Option<&str>,
        encrypted_value: Option<&str>,
    ) -> Result<Option<SecretRecord>> {
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.conn.lock().unwrap();
            let changed = conn
                .execute(
                    r#"
                    UPDATE secrets SET
                        name = COALESCE(?3, name),
                        service_type = COALESCE(?4, service_type),
                        encrypted_value = COALESCE(?5, encrypted_value),
                        updated_at = ?6
                    WHERE id = ?1 AND user_id = ?2
                    "#,
                    params![id, user_id, name, service_type, encrypted_value, now],
                )
                .context("Failed to update secret")?;
            if changed == 0 {
                return Ok(None);
            }
        }
        self.get(user_id, id)
    }

    /// Deletes a secret. Returns `false` when no owned row matched.
    pub fn delete(&self, user_id: &str, id: i64) -> Result<bool> {
        let rows_affected = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM secrets WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .context("Failed to delete secret")?;

        Ok(rows_affected > 0)
    }

    /// Deletes every secret a user owns. Registration-cascade hook.
    pub fn delete_for_user(&self, user_id: &str) -> Result<usize> {
        let rows_affected = self
            .conn
            .lock()
            .unwrap()
            .execute("DELETE FROM secrets WHERE user_id = ?1", params![user_id])
            .context("Failed to delete user secrets")?;

        Ok(rows_affected)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<SecretRecord> {
    row_to_record_rusqlite(row).context("Failed to map secret row")
}

fn row_to_record_rusqlite(row: &rusqlite::Row<'_>) -> rusqlite::Result<SecretRecord> {
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(SecretRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        service_type: row.get(3)?,
        encrypted_value: row.get(4)?,
        created_at: parse_ts(&created_at, 5)?,
        updated_at: parse_ts(&updated_at, 6)?,
    })
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

//! Embedded SQLite file backend.
//!
//! The terminal fallback of backend selection: it has no external
//! dependency, so opening it only fails when the local disk is unusable.
//!
//! # Layout
//!
//! ```text
//! {data_dir}/
//!   credgate.db        -- credentials + config tables
//! ```
//!
//! The engine does not tolerate unlimited concurrent writers, so the backend
//! holds a single connection behind an [`ExclusiveHandle`].

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::sql::{self, ConfigRow, CredentialRow};
use super::{Backend, BackendKind, StoreError};
use crate::model::{ConfigEntry, Credential, CredentialId};
use crate::pool::{ExclusiveHandle, PoolSettings, bounded};

/// Name of the database file inside the data directory.
pub const DATABASE_FILE_NAME: &str = "credgate.db";

const KIND: BackendKind = BackendKind::File;
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS credentials (
        id TEXT PRIMARY KEY NOT NULL,
        provider TEXT NOT NULL,
        access_token TEXT NOT NULL,
        refresh_token TEXT NOT NULL,
        refresh_digest TEXT NOT NULL UNIQUE,
        client_id TEXT NOT NULL,
        client_secret TEXT NOT NULL,
        expiry TEXT,
        status TEXT NOT NULL,
        metadata TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL,
        sensitivity TEXT NOT NULL DEFAULT 'public',
        updated_at TEXT NOT NULL
    )
    "#,
];

const CREDENTIAL_COLUMNS: &str =
    "id, provider, access_token, refresh_token, client_id, client_secret, expiry, status, metadata";

/// SQLite-backed storage in a local directory.
pub struct FileBackend {
    path: PathBuf,
    handle: ExclusiveHandle<SqliteConnection>,
    timeout: Duration,
}

impl FileBackend {
    /// Open (creating if needed) the database under `data_dir`.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(data_dir, PoolSettings::file()).await
    }

    pub async fn open_with(
        data_dir: impl AsRef<Path>,
        settings: PoolSettings,
    ) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir).map_err(|e| {
            StoreError::connection(KIND, format!("cannot create {}: {e}", data_dir.display()))
        })?;
        let path = data_dir.join(DATABASE_FILE_NAME);

        let mut conn = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .busy_timeout(SQLITE_BUSY_TIMEOUT)
            .journal_mode(SqliteJournalMode::Wal)
            .connect()
            .await
            .map_err(|e| StoreError::connection(KIND, e))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&mut conn)
                .await
                .map_err(|e| StoreError::connection(KIND, e))?;
        }

        info!(path = %path.display(), "file backend opened");

        Ok(Self {
            path,
            handle: ExclusiveHandle::new(conn, KIND, settings.acquire_timeout),
            timeout: settings.operation_timeout,
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("path", &self.path)
            .finish()
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn get_credential(&self, id: &CredentialId) -> Result<Credential, StoreError> {
        let mut conn = self.handle.acquire().await?;
        let row = bounded(KIND, "get_credential", self.timeout, async {
            sqlx::query_as::<_, CredentialRow>(&format!(
                "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE id = ?"
            ))
            .bind(id.as_str())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| sql::read_error(KIND, e))
        })
        .await?;
        row.ok_or_else(|| StoreError::credential_not_found(id))?
            .try_into()
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        let mut conn = self.handle.acquire().await?;
        let rows = bounded(KIND, "list_credentials", self.timeout, async {
            sqlx::query_as::<_, CredentialRow>(&format!(
                "SELECT {CREDENTIAL_COLUMNS} FROM credentials"
            ))
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| sql::read_error(KIND, e))
        })
        .await?;
        rows.into_iter().map(Credential::try_from).collect()
    }

    async fn put_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        let digest = credential.refresh_digest();
        let metadata = serde_json::to_string(&credential.metadata)?;
        let mut conn = self.handle.acquire().await?;

        bounded(KIND, "put_credential", self.timeout, async {
            let existing: Option<(String,)> = sqlx::query_as(
                "SELECT id FROM credentials WHERE refresh_digest = ? AND id <> ?",
            )
            .bind(&digest)
            .bind(credential.id.as_str())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| sql::read_error(KIND, e))?;

            if let Some((other,)) = existing {
                return Err(StoreError::duplicate_refresh_token(&credential.id, &other));
            }

            sqlx::query(
                r#"
                INSERT INTO credentials (
                    id, provider, access_token, refresh_token, refresh_digest,
                    client_id, client_secret, expiry, status, metadata, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    provider = excluded.provider,
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    refresh_digest = excluded.refresh_digest,
                    client_id = excluded.client_id,
                    client_secret = excluded.client_secret,
                    expiry = excluded.expiry,
                    status = excluded.status,
                    metadata = excluded.metadata,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(credential.id.as_str())
            .bind(credential.provider.as_str())
            .bind(credential.access_token.expose())
            .bind(credential.refresh_token.expose())
            .bind(&digest)
            .bind(&credential.client_id)
            .bind(credential.client_secret.expose())
            .bind(credential.expiry.map(sql::encode_timestamp))
            .bind(credential.status.as_str())
            .bind(&metadata)
            .bind(sql::encode_timestamp(Utc::now()))
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                if sql::is_unique_violation(&e) {
                    StoreError::duplicate_refresh_token(&credential.id, "another credential")
                } else {
                    sql::write_error(KIND, e)
                }
            })?;
            Ok(())
        })
        .await?;

        debug!(credential_id = %credential.id, "stored credential");
        Ok(())
    }

    async fn delete_credential(&self, id: &CredentialId) -> Result<(), StoreError> {
        let mut conn = self.handle.acquire().await?;
        let result = bounded(KIND, "delete_credential", self.timeout, async {
            sqlx::query("DELETE FROM credentials WHERE id = ?")
                .bind(id.as_str())
                .execute(&mut *conn)
                .await
                .map_err(|e| sql::write_error(KIND, e))
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::credential_not_found(id));
        }
        Ok(())
    }

    async fn get_config(&self, key: &str) -> Result<ConfigEntry, StoreError> {
        let mut conn = self.handle.acquire().await?;
        let row = bounded(KIND, "get_config", self.timeout, async {
            sqlx::query_as::<_, ConfigRow>(
                "SELECT key, value, sensitivity FROM config WHERE key = ?",
            )
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| sql::read_error(KIND, e))
        })
        .await?;
        row.ok_or_else(|| StoreError::config_not_found(key))?
            .try_into()
    }

    async fn set_config(&self, entry: &ConfigEntry) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(&entry.value)?;
        let mut conn = self.handle.acquire().await?;
        bounded(KIND, "set_config", self.timeout, async {
            sqlx::query(
                r#"
                INSERT INTO config (key, value, sensitivity, updated_at) VALUES (?, ?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    sensitivity = excluded.sensitivity,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&entry.key)
            .bind(&encoded)
            .bind(entry.sensitivity.as_str())
            .bind(sql::encode_timestamp(Utc::now()))
            .execute(&mut *conn)
            .await
            .map_err(|e| sql::write_error(KIND, e))
        })
        .await?;
        Ok(())
    }

    async fn list_config(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        let mut conn = self.handle.acquire().await?;
        let rows = bounded(KIND, "list_config", self.timeout, async {
            sqlx::query_as::<_, ConfigRow>("SELECT key, value, sensitivity FROM config")
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| sql::read_error(KIND, e))
        })
        .await?;
        rows.into_iter().map(ConfigEntry::try_from).collect()
    }

    async fn delete_config(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.handle.acquire().await?;
        let result = bounded(KIND, "delete_config", self.timeout, async {
            sqlx::query("DELETE FROM config WHERE key = ?")
                .bind(key)
                .execute(&mut *conn)
                .await
                .map_err(|e| sql::write_error(KIND, e))
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::config_not_found(key));
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        match self.handle.acquire().await {
            Ok(mut conn) => conn.ping().await.is_ok(),
            Err(_) => false,
        }
    }
}

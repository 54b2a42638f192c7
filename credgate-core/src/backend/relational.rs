//! PostgreSQL backend.
//!
//! Connections come from a sqlx pool bounded by [`PoolSettings::relational`].
//! Each operation checks a connection out and the pool guard returns it on
//! every exit path, including errors and timeouts.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info};

use super::sql::{self, ConfigRow, CredentialRow};
use super::{Backend, BackendKind, StoreError};
use crate::model::{ConfigEntry, Credential, CredentialId};
use crate::pool::{PoolSettings, bounded};

const KIND: BackendKind = BackendKind::Relational;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS credgate_credentials (
        id TEXT PRIMARY KEY,
        provider TEXT NOT NULL,
        access_token TEXT NOT NULL,
        refresh_token TEXT NOT NULL,
        refresh_digest TEXT NOT NULL UNIQUE,
        client_id TEXT NOT NULL,
        client_secret TEXT NOT NULL,
        expiry TEXT,
        status TEXT NOT NULL,
        metadata TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credgate_config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        sensitivity TEXT NOT NULL DEFAULT 'public',
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_credgate_credentials_status ON credgate_credentials(status)",
];

const CREDENTIAL_COLUMNS: &str =
    "id, provider, access_token, refresh_token, client_id, client_secret, expiry, status, metadata";

/// PostgreSQL-backed storage.
pub struct RelationalBackend {
    pool: PgPool,
    timeout: Duration,
}

impl RelationalBackend {
    /// Connect to `dsn` and create the schema if needed.
    pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
        Self::connect_with(dsn, PoolSettings::relational()).await
    }

    pub async fn connect_with(dsn: &str, settings: PoolSettings) -> Result<Self, StoreError> {
        settings
            .validate()
            .map_err(|e| StoreError::connection(KIND, e))?;

        let mut options = PgPoolOptions::new()
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout)
            .test_before_acquire(true);
        if let Some(max) = settings.max_connections {
            options = options.max_connections(max);
        }

        let pool = options
            .connect(dsn)
            .await
            .map_err(|e| StoreError::connection(KIND, e))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| StoreError::connection(KIND, e))?;
        }

        info!(
            min_connections = settings.min_connections,
            max_connections = settings.max_connections,
            "relational backend connected"
        );

        Ok(Self {
            pool,
            timeout: settings.operation_timeout,
        })
    }

    /// Total and idle connections currently held by the pool.
    pub fn pool_stats(&self) -> (u32, usize) {
        (self.pool.size(), self.pool.num_idle())
    }
}

impl std::fmt::Debug for RelationalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalBackend")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

#[async_trait]
impl Backend for RelationalBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn get_credential(&self, id: &CredentialId) -> Result<Credential, StoreError> {
        let row = bounded(KIND, "get_credential", self.timeout, async {
            let mut conn = self.pool.acquire().await.map_err(|e| sql::read_error(KIND, e))?;
            sqlx::query_as::<_, CredentialRow>(&format!(
                "SELECT {CREDENTIAL_COLUMNS} FROM credgate_credentials WHERE id = $1"
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
        let rows = bounded(KIND, "list_credentials", self.timeout, async {
            let mut conn = self.pool.acquire().await.map_err(|e| sql::read_error(KIND, e))?;
            sqlx::query_as::<_, CredentialRow>(&format!(
                "SELECT {CREDENTIAL_COLUMNS} FROM credgate_credentials"
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

        bounded(KIND, "put_credential", self.timeout, async {
            let mut conn = self.pool.acquire().await.map_err(|e| sql::write_error(KIND, e))?;

            let existing: Option<(String,)> = sqlx::query_as(
                "SELECT id FROM credgate_credentials WHERE refresh_digest = $1 AND id <> $2",
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
                INSERT INTO credgate_credentials (
                    id, provider, access_token, refresh_token, refresh_digest,
                    client_id, client_secret, expiry, status, metadata, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (id) DO UPDATE SET
                    provider = EXCLUDED.provider,
                    access_token = EXCLUDED.access_token,
                    refresh_token = EXCLUDED.refresh_token,
                    refresh_digest = EXCLUDED.refresh_digest,
                    client_id = EXCLUDED.client_id,
                    client_secret = EXCLUDED.client_secret,
                    expiry = EXCLUDED.expiry,
                    status = EXCLUDED.status,
                    metadata = EXCLUDED.metadata,
                    updated_at = EXCLUDED.updated_at
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
            .bind(Utc::now())
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
        let result = bounded(KIND, "delete_credential", self.timeout, async {
            let mut conn = self.pool.acquire().await.map_err(|e| sql::write_error(KIND, e))?;
            sqlx::query("DELETE FROM credgate_credentials WHERE id = $1")
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
        let row = bounded(KIND, "get_config", self.timeout, async {
            let mut conn = self.pool.acquire().await.map_err(|e| sql::read_error(KIND, e))?;
            sqlx::query_as::<_, ConfigRow>(
                "SELECT key, value, sensitivity FROM credgate_config WHERE key = $1",
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
        bounded(KIND, "set_config", self.timeout, async {
            let mut conn = self.pool.acquire().await.map_err(|e| sql::write_error(KIND, e))?;
            sqlx::query(
                r#"
                INSERT INTO credgate_config (key, value, sensitivity, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (key) DO UPDATE SET
                    value = EXCLUDED.value,
                    sensitivity = EXCLUDED.sensitivity,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&entry.key)
            .bind(&encoded)
            .bind(entry.sensitivity.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| sql::write_error(KIND, e))
        })
        .await?;
        Ok(())
    }

    async fn list_config(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        let rows = bounded(KIND, "list_config", self.timeout, async {
            let mut conn = self.pool.acquire().await.map_err(|e| sql::read_error(KIND, e))?;
            sqlx::query_as::<_, ConfigRow>("SELECT key, value, sensitivity FROM credgate_config")
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| sql::read_error(KIND, e))
        })
        .await?;
        rows.into_iter().map(ConfigEntry::try_from).collect()
    }

    async fn delete_config(&self, key: &str) -> Result<(), StoreError> {
        let result = bounded(KIND, "delete_config", self.timeout, async {
            let mut conn = self.pool.acquire().await.map_err(|e| sql::write_error(KIND, e))?;
            sqlx::query("DELETE FROM credgate_config WHERE key = $1")
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
        let probe = bounded(KIND, "health_check", self.timeout, async {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(|e| sql::read_error(KIND, e))
        });
        probe.await.is_ok()
    }
}

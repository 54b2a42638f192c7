//! Valkey / Redis backend.
//!
//! # Key Layout
//!
//! - `credgate:creds` - hash, credential id -> credential JSON
//! - `credgate:refresh_index` - hash, refresh token SHA-256 -> credential id
//! - `credgate:config` - hash, config key -> `{ value, sensitivity }` JSON
//!
//! Credential writes run as one Lua script so the refresh index claim and
//! the record write are atomic.
//!
//! A single multiplexed connection is reused for every operation. An
//! operation that sees a dropped connection reconnects once before
//! surfacing [`StoreError::Connection`]; every call is bounded by
//! [`KEY_VALUE_TIMEOUT`].

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use super::{Backend, BackendKind, StoreError};
use crate::model::{ConfigEntry, Credential, CredentialId, Sensitivity};
use crate::pool::{KEY_VALUE_TIMEOUT, OpenConnection, ReconnectingConnection};

const KIND: BackendKind = BackendKind::KeyValue;

const CREDENTIALS_KEY: &str = "credgate:creds";
const REFRESH_INDEX_KEY: &str = "credgate:refresh_index";
const CONFIG_KEY: &str = "credgate:config";

/// Attempts before a credential write that keeps losing races gives up.
const PUT_ATTEMPTS: usize = 5;

/// KEYS: credentials hash, refresh index hash.
/// ARGV: id, digest, encoded credential, previously read record ("" if none),
/// digest to release ("" if none).
///
/// Replies `{"ok"}`, `{"conflict", owner}`, or `{"stale"}` when the record
/// changed since it was read.
const PUT_CREDENTIAL_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if (current or '') ~= ARGV[4] then
    return {'stale'}
end
local owner = redis.call('HGET', KEYS[2], ARGV[2])
if owner and owner ~= ARGV[1] then
    return {'conflict', owner}
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
redis.call('HSET', KEYS[2], ARGV[2], ARGV[1])
if ARGV[5] ~= '' and ARGV[5] ~= ARGV[2] and redis.call('HGET', KEYS[2], ARGV[5]) == ARGV[1] then
    redis.call('HDEL', KEYS[2], ARGV[5])
end
return {'ok'}
"#;

#[derive(Serialize, Deserialize)]
struct StoredConfig {
    value: serde_json::Value,
    #[serde(default)]
    sensitivity: Sensitivity,
}

fn decode_config(key: String, raw: &str) -> Result<ConfigEntry, StoreError> {
    let stored: StoredConfig = serde_json::from_str(raw)?;
    Ok(ConfigEntry::new(key, stored.value).with_sensitivity(stored.sensitivity))
}

fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

fn read_error(e: RedisError) -> StoreError {
    if is_connection_error(&e) {
        StoreError::connection(KIND, e)
    } else {
        StoreError::Corrupt {
            message: e.to_string(),
        }
    }
}

fn write_error(e: RedisError) -> StoreError {
    if is_connection_error(&e) {
        StoreError::connection(KIND, e)
    } else {
        StoreError::write(KIND, e)
    }
}

struct RedisOpener {
    client: redis::Client,
}

#[async_trait]
impl OpenConnection for RedisOpener {
    type Conn = MultiplexedConnection;

    async fn open(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::connection(KIND, e))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::connection(KIND, e))?;
        Ok(conn)
    }
}

/// Valkey/Redis-backed storage.
pub struct KeyValueBackend {
    conn: ReconnectingConnection<RedisOpener>,
}

impl KeyValueBackend {
    /// Connect to `url` (`redis://` or `valkey://` style) and verify with PING.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let url = normalize_url(url);
        let client = redis::Client::open(url.as_str()).map_err(|e| StoreError::connection(KIND, e))?;
        let conn =
            ReconnectingConnection::connect(RedisOpener { client }, KIND, KEY_VALUE_TIMEOUT).await?;
        info!("key-value backend connected");
        Ok(Self { conn })
    }
}

/// The redis client only understands `redis://` and `rediss://`.
fn normalize_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("valkeys://") {
        format!("rediss://{rest}")
    } else if let Some(rest) = url.strip_prefix("valkey://") {
        format!("redis://{rest}")
    } else {
        url.to_string()
    }
}

impl std::fmt::Debug for KeyValueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl Backend for KeyValueBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn get_credential(&self, id: &CredentialId) -> Result<Credential, StoreError> {
        let raw: Option<String> = self
            .conn
            .run("get_credential", |mut conn| async move {
                conn.hget(CREDENTIALS_KEY, id.as_str()).await.map_err(read_error)
            })
            .await?;
        let raw = raw.ok_or_else(|| StoreError::credential_not_found(id))?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        let all: HashMap<String, String> = self
            .conn
            .run("list_credentials", |mut conn| async move {
                conn.hgetall(CREDENTIALS_KEY).await.map_err(read_error)
            })
            .await?;
        all.values()
            .map(|raw| serde_json::from_str(raw).map_err(StoreError::from))
            .collect()
    }

    async fn put_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        let digest = credential.refresh_digest();
        let encoded = serde_json::to_string(credential)?;
        let id = credential.id.as_str();

        for _ in 0..PUT_ATTEMPTS {
            let previous: Option<String> = self
                .conn
                .run("put_credential", |mut conn| async move {
                    conn.hget(CREDENTIALS_KEY, id).await.map_err(read_error)
                })
                .await?;
            let stale_digest = previous
                .as_deref()
                .and_then(|raw| serde_json::from_str::<Credential>(raw).ok())
                .map(|c| c.refresh_digest())
                .unwrap_or_default();
            let previous = previous.unwrap_or_default();

            let reply: Vec<String> = self
                .conn
                .run("put_credential", |mut conn| {
                    let (digest, encoded) = (digest.clone(), encoded.clone());
                    let (previous, stale_digest) = (previous.clone(), stale_digest.clone());
                    async move {
                        let script = redis::Script::new(PUT_CREDENTIAL_SCRIPT);
                        let mut invocation = script.key(CREDENTIALS_KEY);
                        invocation
                            .key(REFRESH_INDEX_KEY)
                            .arg(id)
                            .arg(digest)
                            .arg(encoded)
                            .arg(previous)
                            .arg(stale_digest);
                        invocation.invoke_async(&mut conn).await.map_err(write_error)
                    }
                })
                .await?;

            match reply.first().map(String::as_str) {
                Some("ok") => {
                    debug!(credential_id = %credential.id, "stored credential");
                    return Ok(());
                }
                Some("conflict") => {
                    let other = reply.get(1).map(String::as_str).unwrap_or("another credential");
                    return Err(StoreError::duplicate_refresh_token(&credential.id, other));
                }
                Some("stale") => {
                    debug!(credential_id = %credential.id, "credential changed concurrently, retrying");
                }
                _ => {
                    return Err(StoreError::write(KIND, "unexpected reply from put script"));
                }
            }
        }

        Err(StoreError::write(
            KIND,
            format!("credential {id} kept changing during write"),
        ))
    }

    async fn delete_credential(&self, id: &CredentialId) -> Result<(), StoreError> {
        let existing = self.get_credential(id).await?;
        let digest = existing.refresh_digest();

        self.conn
            .run("delete_credential", |mut conn| {
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .hdel(CREDENTIALS_KEY, id.as_str())
                    .ignore()
                    .hdel(REFRESH_INDEX_KEY, &digest)
                    .ignore();
                async move { pipe.query_async::<()>(&mut conn).await.map_err(write_error) }
            })
            .await
    }

    async fn get_config(&self, key: &str) -> Result<ConfigEntry, StoreError> {
        let raw: Option<String> = self
            .conn
            .run("get_config", |mut conn| async move {
                conn.hget(CONFIG_KEY, key).await.map_err(read_error)
            })
            .await?;
        let raw = raw.ok_or_else(|| StoreError::config_not_found(key))?;
        decode_config(key.to_string(), &raw)
    }

    async fn set_config(&self, entry: &ConfigEntry) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(&StoredConfig {
            value: entry.value.clone(),
            sensitivity: entry.sensitivity,
        })?;
        let key = entry.key.as_str();
        self.conn
            .run("set_config", |mut conn| {
                let encoded = encoded.clone();
                async move {
                    conn.hset::<_, _, _, ()>(CONFIG_KEY, key, encoded)
                        .await
                        .map_err(write_error)
                }
            })
            .await
    }

    async fn list_config(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        let all: HashMap<String, String> = self
            .conn
            .run("list_config", |mut conn| async move {
                conn.hgetall(CONFIG_KEY).await.map_err(read_error)
            })
            .await?;
        all.into_iter()
            .map(|(key, raw)| decode_config(key, &raw))
            .collect()
    }

    async fn delete_config(&self, key: &str) -> Result<(), StoreError> {
        let removed: i64 = self
            .conn
            .run("delete_config", |mut conn| async move {
                conn.hdel(CONFIG_KEY, key).await.map_err(write_error)
            })
            .await?;
        if removed == 0 {
            return Err(StoreError::config_not_found(key));
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.conn
            .run("health_check", |mut conn| async move {
                redis::cmd("PING")
                    .query_async::<String>(&mut conn)
                    .await
                    .map_err(read_error)
            })
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_valkey_scheme() {
        assert_eq!(normalize_url("valkey://host:6379/0"), "redis://host:6379/0");
        assert_eq!(normalize_url("valkeys://host:6380"), "rediss://host:6380");
        assert_eq!(normalize_url("redis://localhost"), "redis://localhost");
    }

    #[test]
    fn test_stored_config_keeps_declared_tier() {
        let entry = decode_config(
            "proxy".to_string(),
            r#"{"value":"http://user:pw@proxy:8080","sensitivity":"secret"}"#,
        )
        .unwrap();
        assert!(entry.is_secret());

        let entry = decode_config("api_password".to_string(), r#"{"value":"pw"}"#).unwrap();
        assert!(entry.is_secret());
    }

    /// Needs a disposable server in `VALKEY_URL`.
    #[tokio::test]
    async fn test_concurrent_writers_cannot_share_refresh_token() {
        let Ok(url) = std::env::var("VALKEY_URL") else {
            return;
        };
        let backend = std::sync::Arc::new(KeyValueBackend::connect(&url).await.unwrap());
        let refresh = format!("1//shared-{}", uuid::Uuid::new_v4());
        let ids: Vec<String> = (0..8).map(|i| format!("race-{i}-{}", uuid::Uuid::new_v4())).collect();

        let tasks: Vec<_> = ids
            .iter()
            .map(|id| {
                let backend = backend.clone();
                let credential = Credential::new(
                    id.as_str(),
                    crate::model::Provider::GeminiCli,
                    refresh.as_str(),
                    "client",
                    "secret",
                );
                tokio::spawn(async move { backend.put_credential(&credential).await })
            })
            .collect();

        let mut stored = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => stored += 1,
                Err(e) => assert!(matches!(e, StoreError::Conflict { .. })),
            }
        }
        for id in &ids {
            let _ = backend.delete_credential(&CredentialId::new(id.as_str())).await;
        }
        assert_eq!(stored, 1);
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Port 1 is reserved and never runs a redis server.
        let result = KeyValueBackend::connect("redis://127.0.0.1:1/").await;
        assert!(matches!(result, Err(StoreError::Connection { .. })));
    }
}

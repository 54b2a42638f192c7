//! MongoDB backend.
//!
//! Collections live in the database named by the URI (default `credgate`):
//! - `credentials` - `{ _id, refresh_digest (unique), credential }`
//! - `config` - `{ _id, value, sensitivity }`, value stored as JSON text so
//!   every JSON type round-trips verbatim
//!
//! The driver pools connections itself; sizing is left at its default.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{Backend, BackendKind, StoreError};
use crate::model::{ConfigEntry, Credential, CredentialId, Sensitivity};
use crate::pool::{PoolSettings, bounded};

const KIND: BackendKind = BackendKind::Document;
const DEFAULT_DATABASE: &str = "credgate";
const DUPLICATE_KEY_CODE: i32 = 11000;

#[derive(Debug, Serialize, Deserialize)]
struct CredentialDocument {
    #[serde(rename = "_id")]
    id: String,
    refresh_digest: String,
    credential: Credential,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConfigDocument {
    #[serde(rename = "_id")]
    key: String,
    value: String,
    #[serde(default)]
    sensitivity: Sensitivity,
}

impl TryFrom<ConfigDocument> for ConfigEntry {
    type Error = StoreError;

    fn try_from(document: ConfigDocument) -> Result<Self, Self::Error> {
        let value = serde_json::from_str(&document.value)?;
        Ok(ConfigEntry::new(document.key, value).with_sensitivity(document.sensitivity))
    }
}

fn is_connection_error(e: &MongoError) -> bool {
    matches!(
        e.kind.as_ref(),
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. }
    )
}

fn is_duplicate_key(e: &MongoError) -> bool {
    matches!(
        e.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY_CODE
    )
}

fn read_error(e: MongoError) -> StoreError {
    if is_connection_error(&e) {
        StoreError::connection(KIND, e)
    } else {
        StoreError::Corrupt {
            message: e.to_string(),
        }
    }
}

fn write_error(e: MongoError) -> StoreError {
    if is_connection_error(&e) {
        StoreError::connection(KIND, e)
    } else {
        StoreError::write(KIND, e)
    }
}

/// MongoDB-backed storage.
pub struct DocumentBackend {
    client: Client,
    credentials: Collection<CredentialDocument>,
    config: Collection<ConfigDocument>,
    timeout: Duration,
}

impl DocumentBackend {
    /// Connect to `uri`, ping the server and ensure indexes.
    pub async fn connect(uri: &str) -> Result<Self, StoreError> {
        Self::connect_with(uri, PoolSettings::document()).await
    }

    pub async fn connect_with(uri: &str, settings: PoolSettings) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(|e| StoreError::connection(KIND, e))?;
        options.app_name = Some("credgate".to_string());
        options.server_selection_timeout = Some(settings.acquire_timeout);
        options.connect_timeout = Some(settings.acquire_timeout);
        if let Some(max) = settings.max_connections {
            options.max_pool_size = Some(max);
        }

        let client = Client::with_options(options).map_err(|e| StoreError::connection(KIND, e))?;
        let db = client
            .default_database()
            .unwrap_or_else(|| client.database(DEFAULT_DATABASE));

        bounded(KIND, "connect", settings.acquire_timeout, async {
            db.run_command(doc! { "ping": 1 })
                .await
                .map_err(|e| StoreError::connection(KIND, e))
        })
        .await?;

        let credentials = db.collection::<CredentialDocument>("credentials");
        let index = IndexModel::builder()
            .keys(doc! { "refresh_digest": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        credentials
            .create_index(index)
            .await
            .map_err(|e| StoreError::connection(KIND, e))?;

        info!(database = %db.name(), "document backend connected");

        Ok(Self {
            config: db.collection::<ConfigDocument>("config"),
            credentials,
            client,
            timeout: settings.operation_timeout,
        })
    }
}

impl std::fmt::Debug for DocumentBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentBackend")
            .field("collection", &self.credentials.name())
            .finish()
    }
}

#[async_trait]
impl Backend for DocumentBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn get_credential(&self, id: &CredentialId) -> Result<Credential, StoreError> {
        let found = bounded(KIND, "get_credential", self.timeout, async {
            self.credentials
                .find_one(doc! { "_id": id.as_str() })
                .await
                .map_err(read_error)
        })
        .await?;
        found
            .map(|d| d.credential)
            .ok_or_else(|| StoreError::credential_not_found(id))
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        let docs: Vec<CredentialDocument> = bounded(KIND, "list_credentials", self.timeout, async {
            let cursor = self.credentials.find(doc! {}).await.map_err(read_error)?;
            cursor.try_collect().await.map_err(read_error)
        })
        .await?;
        Ok(docs.into_iter().map(|d| d.credential).collect())
    }

    async fn put_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        let digest = credential.refresh_digest();
        let id = credential.id.as_str();

        bounded(KIND, "put_credential", self.timeout, async {
            let owner = self
                .credentials
                .find_one(doc! { "refresh_digest": digest.as_str(), "_id": { "$ne": id } })
                .await
                .map_err(read_error)?;
            if let Some(other) = owner {
                return Err(StoreError::duplicate_refresh_token(&credential.id, &other.id));
            }

            let document = CredentialDocument {
                id: id.to_string(),
                refresh_digest: digest.clone(),
                credential: credential.clone(),
            };
            self.credentials
                .replace_one(doc! { "_id": id }, &document)
                .upsert(true)
                .await
                .map_err(|e| {
                    if is_duplicate_key(&e) {
                        StoreError::duplicate_refresh_token(&credential.id, "another credential")
                    } else {
                        write_error(e)
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
            self.credentials
                .delete_one(doc! { "_id": id.as_str() })
                .await
                .map_err(write_error)
        })
        .await?;
        if result.deleted_count == 0 {
            return Err(StoreError::credential_not_found(id));
        }
        Ok(())
    }

    async fn get_config(&self, key: &str) -> Result<ConfigEntry, StoreError> {
        let found = bounded(KIND, "get_config", self.timeout, async {
            self.config
                .find_one(doc! { "_id": key })
                .await
                .map_err(read_error)
        })
        .await?;
        found.ok_or_else(|| StoreError::config_not_found(key))?.try_into()
    }

    async fn set_config(&self, entry: &ConfigEntry) -> Result<(), StoreError> {
        let document = ConfigDocument {
            key: entry.key.clone(),
            value: serde_json::to_string(&entry.value)?,
            sensitivity: entry.sensitivity,
        };
        bounded(KIND, "set_config", self.timeout, async {
            self.config
                .replace_one(doc! { "_id": entry.key.as_str() }, &document)
                .upsert(true)
                .await
                .map_err(write_error)
        })
        .await?;
        Ok(())
    }

    async fn list_config(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        let docs: Vec<ConfigDocument> = bounded(KIND, "list_config", self.timeout, async {
            let cursor = self.config.find(doc! {}).await.map_err(read_error)?;
            cursor.try_collect().await.map_err(read_error)
        })
        .await?;
        docs.into_iter().map(ConfigEntry::try_from).collect()
    }

    async fn delete_config(&self, key: &str) -> Result<(), StoreError> {
        let result = bounded(KIND, "delete_config", self.timeout, async {
            self.config
                .delete_one(doc! { "_id": key })
                .await
                .map_err(write_error)
        })
        .await?;
        if result.deleted_count == 0 {
            return Err(StoreError::config_not_found(key));
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let db = self
            .client
            .default_database()
            .unwrap_or_else(|| self.client.database(DEFAULT_DATABASE));
        bounded(KIND, "health_check", self.timeout, async {
            db.run_command(doc! { "ping": 1 }).await.map_err(read_error)
        })
        .await
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_document_without_tier_uses_key_tier() {
        let document = ConfigDocument {
            key: "panel_password".to_string(),
            value: "\"pw\"".to_string(),
            sensitivity: Sensitivity::default(),
        };
        assert!(ConfigEntry::try_from(document).unwrap().is_secret());

        let document = ConfigDocument {
            key: "proxy".to_string(),
            value: "\"http://proxy:8080\"".to_string(),
            sensitivity: Sensitivity::Secret,
        };
        assert!(ConfigEntry::try_from(document).unwrap().is_secret());
    }
}

//! In-memory backend implementation.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{Backend, BackendKind, StoreError};
use crate::model::{ConfigEntry, Credential, CredentialId};

#[derive(Default)]
struct MemoryData {
    credentials: HashMap<CredentialId, Credential>,
    config: BTreeMap<String, ConfigEntry>,
}

/// In-memory backend for testing and development.
///
/// This backend is not persistent; data is lost when the process exits.
///
/// # Thread Safety
///
/// This implementation uses interior mutability via `RwLock` and is
/// safe to share across threads.
pub struct MemoryBackend {
    data: RwLock<MemoryData>,
}

impl MemoryBackend {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(MemoryData::default()),
        }
    }

    /// Create a memory backend with initial credentials.
    pub fn with_credentials(credentials: impl IntoIterator<Item = Credential>) -> Self {
        let credentials = credentials
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        Self {
            data: RwLock::new(MemoryData {
                credentials,
                config: BTreeMap::new(),
            }),
        }
    }

    fn poisoned(e: impl std::fmt::Display) -> StoreError {
        StoreError::write(BackendKind::Memory, format!("lock poisoned: {e}"))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (creds, config) = self
            .data
            .read()
            .map(|d| (d.credentials.len(), d.config.len()))
            .unwrap_or((0, 0));
        f.debug_struct("MemoryBackend")
            .field("credentials_count", &creds)
            .field("config_count", &config)
            .finish()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn get_credential(&self, id: &CredentialId) -> Result<Credential, StoreError> {
        let data = self.data.read().map_err(Self::poisoned)?;
        data.credentials
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::credential_not_found(id))
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        let data = self.data.read().map_err(Self::poisoned)?;
        Ok(data.credentials.values().cloned().collect())
    }

    async fn put_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(Self::poisoned)?;
        if let Some(existing) = data
            .credentials
            .values()
            .find(|c| c.id != credential.id && c.refresh_token == credential.refresh_token)
        {
            return Err(StoreError::duplicate_refresh_token(
                &credential.id,
                existing.id.as_str(),
            ));
        }
        data.credentials
            .insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    async fn delete_credential(&self, id: &CredentialId) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(Self::poisoned)?;
        data.credentials
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::credential_not_found(id))
    }

    async fn get_config(&self, key: &str) -> Result<ConfigEntry, StoreError> {
        let data = self.data.read().map_err(Self::poisoned)?;
        data.config
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::config_not_found(key))
    }

    async fn set_config(&self, entry: &ConfigEntry) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(Self::poisoned)?;
        data.config.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn list_config(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        let data = self.data.read().map_err(Self::poisoned)?;
        Ok(data.config.values().cloned().collect())
    }

    async fn delete_config(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(Self::poisoned)?;
        data.config
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::config_not_found(key))
    }

    async fn health_check(&self) -> bool {
        self.data.read().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Provider;
    use serde_json::json;

    fn cred(id: &str, refresh: &str) -> Credential {
        Credential::new(id, Provider::GeminiCli, refresh, "client-id", "client-secret")
    }

    #[tokio::test]
    async fn test_memory_backend_put_get() {
        let backend = MemoryBackend::new();
        let c = cred("a", "r-a");

        backend.put_credential(&c).await.unwrap();
        let retrieved = backend.get_credential(&c.id).await.unwrap();

        assert_eq!(retrieved, c);
    }

    #[tokio::test]
    async fn test_memory_backend_get_nonexistent() {
        let backend = MemoryBackend::new();
        let result = backend.get_credential(&"missing".into()).await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_memory_backend_duplicate_refresh_token() {
        let backend = MemoryBackend::new();
        backend.put_credential(&cred("a", "same")).await.unwrap();

        let result = backend.put_credential(&cred("b", "same")).await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));

        // Overwriting the same id with the same token is fine.
        backend.put_credential(&cred("a", "same")).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_backend_delete() {
        let backend = MemoryBackend::new();
        let c = cred("a", "r-a");
        backend.put_credential(&c).await.unwrap();
        backend.delete_credential(&c.id).await.unwrap();

        assert!(backend.get_credential(&c.id).await.is_err());
        assert!(matches!(
            backend.delete_credential(&c.id).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_backend_config() {
        let backend = MemoryBackend::new();
        backend
            .set_config(&ConfigEntry::new("calls_per_rotation", json!(100)))
            .await
            .unwrap();
        backend
            .set_config(&ConfigEntry::new("log_level", json!("info")))
            .await
            .unwrap();

        assert_eq!(
            backend.get_config("calls_per_rotation").await.unwrap().value,
            json!(100)
        );
        assert_eq!(backend.list_config().await.unwrap().len(), 2);

        backend.delete_config("log_level").await.unwrap();
        assert!(backend.get_config("log_level").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_backend_batch_put_reports_failures() {
        let backend = MemoryBackend::new();
        backend.put_credential(&cred("existing", "dup")).await.unwrap();

        let outcome = backend
            .batch_put_credentials(&[cred("x", "r-x"), cred("y", "dup"), cred("z", "r-z")])
            .await
            .unwrap();

        assert_eq!(outcome.written, 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0.as_str(), "y");
    }
}

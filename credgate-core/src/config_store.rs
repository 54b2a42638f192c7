//! Typed config access over the active backend.

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};

use crate::backend::{BackendKind, StoreError};
use crate::credential_store::{DEFAULT_WRITE_BACKOFF, retry_write};
use crate::model::{ConfigEntry, Sensitivity};
use crate::redact::fingerprint_value;
use crate::selector::BackendHandle;

/// Config key/value CRUD delegated to whichever backend is active.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    handle: BackendHandle,
    write_backoff: Duration,
}

impl ConfigStore {
    pub fn new(handle: BackendHandle) -> Self {
        Self {
            handle,
            write_backoff: DEFAULT_WRITE_BACKOFF,
        }
    }

    pub fn with_write_backoff(mut self, backoff: Duration) -> Self {
        self.write_backoff = backoff;
        self
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.handle.kind()
    }

    pub async fn get(&self, key: &str) -> Result<ConfigEntry, StoreError> {
        self.handle.current().get_config(key).await
    }

    /// Store `value` under `key` with at least the declared `sensitivity`.
    ///
    /// Keys that name a secret are stored as [`Sensitivity::Secret`] whatever
    /// the caller declares.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        sensitivity: Sensitivity,
    ) -> Result<ConfigEntry, StoreError> {
        let entry = ConfigEntry::new(key, value).with_sensitivity(sensitivity);
        if entry.is_secret() {
            trace!(key, value = %fingerprint_value(&entry.value), "setting secret config entry");
        } else {
            trace!(key, value = %entry.value, "setting config entry");
        }

        let backend = self.handle.current();
        retry_write("set_config", self.write_backoff, || backend.set_config(&entry)).await?;

        debug!(key, sensitivity = %entry.sensitivity, "config entry stored");
        Ok(entry)
    }

    /// All entries, ordered by key.
    pub async fn list(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        let mut entries = self.handle.current().list_config().await?;
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let backend = self.handle.current();
        retry_write("delete_config", self.write_backoff, || backend.delete_config(key)).await?;
        debug!(key, "config entry deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> ConfigStore {
        ConfigStore::new(BackendHandle::new(Arc::new(MemoryBackend::new())))
    }

    #[tokio::test]
    async fn test_set_classifies_entries() {
        let store = store();
        let entry = store
            .set("panel_password", json!("pw"), Sensitivity::Public)
            .await
            .unwrap();
        assert_eq!(entry.sensitivity, Sensitivity::Secret);

        let entry = store
            .set("calls_per_rotation", json!(10), Sensitivity::Public)
            .await
            .unwrap();
        assert_eq!(entry.sensitivity, Sensitivity::Public);
    }

    #[tokio::test]
    async fn test_unknown_key_declared_secret_stays_secret() {
        let store = store();
        store
            .set("gemini_api_keys", json!(["AIza-1", "AIza-2"]), Sensitivity::Secret)
            .await
            .unwrap();

        assert!(store.get("gemini_api_keys").await.unwrap().is_secret());
        assert!(store.list().await.unwrap()[0].is_secret());

        // Rewriting without a declaration does not downgrade a secret key name.
        let entry = store
            .set("api_password", json!("pw"), Sensitivity::Public)
            .await
            .unwrap();
        assert!(entry.is_secret());
    }

    #[tokio::test]
    async fn test_structured_values_round_trip() {
        let store = store();
        let value = json!({"models": ["a", "b"], "enabled": true, "limit": 3.5});
        store
            .set("routing", value.clone(), Sensitivity::Public)
            .await
            .unwrap();
        assert_eq!(store.get("routing").await.unwrap().value, value);
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let store = store();
        store.set("b", json!(1), Sensitivity::Public).await.unwrap();
        store.set("a", json!(2), Sensitivity::Public).await.unwrap();
        let keys: Vec<_> = store.list().await.unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = store();
        assert!(matches!(
            store.delete("nope").await,
            Err(StoreError::NotFound { .. })
        ));
        store.set("x", json!("y"), Sensitivity::Public).await.unwrap();
        store.delete("x").await.unwrap();
        assert!(store.get("x").await.is_err());
    }
}

//! Integration tests for the migration utility.

use std::sync::Arc;

use async_trait::async_trait;
use credgate_core::{
    Backend, BackendKind, ConfigEntry, Credential, CredentialId, FileBackend, MemoryBackend,
    Provider, StoreError, migrate,
};
use serde_json::json;
use tempfile::TempDir;

fn credential(i: usize) -> Credential {
    Credential::new(
        format!("cred-{i:03}"),
        if i % 2 == 0 {
            Provider::GeminiCli
        } else {
            Provider::Antigravity
        },
        format!("1//refresh-{i}"),
        "client.apps.example.com",
        "client-secret",
    )
    .with_metadata("index", i.to_string())
}

async fn seeded_file_backend(temp_dir: &TempDir, count: usize) -> FileBackend {
    let backend = FileBackend::open(temp_dir.path().join("source")).await.unwrap();
    let credentials: Vec<_> = (0..count).map(credential).collect();
    let outcome = backend.batch_put_credentials(&credentials).await.unwrap();
    assert!(outcome.is_complete());
    for entry in [
        ConfigEntry::new("log_level", json!("info")),
        ConfigEntry::new("panel_password", json!("pw")),
    ] {
        backend.set_config(&entry).await.unwrap();
    }
    backend
}

/// Wraps a backend and rejects writes for one credential id.
struct RejectingBackend {
    inner: Arc<dyn Backend>,
    reject: CredentialId,
}

#[async_trait]
impl Backend for RejectingBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn get_credential(&self, id: &CredentialId) -> Result<Credential, StoreError> {
        self.inner.get_credential(id).await
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        self.inner.list_credentials().await
    }

    async fn put_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        if credential.id == self.reject {
            return Err(StoreError::write(self.kind(), "disk quota exceeded"));
        }
        self.inner.put_credential(credential).await
    }

    async fn delete_credential(&self, id: &CredentialId) -> Result<(), StoreError> {
        self.inner.delete_credential(id).await
    }

    async fn get_config(&self, key: &str) -> Result<ConfigEntry, StoreError> {
        self.inner.get_config(key).await
    }

    async fn set_config(&self, entry: &ConfigEntry) -> Result<(), StoreError> {
        self.inner.set_config(entry).await
    }

    async fn list_config(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        self.inner.list_config().await
    }

    async fn delete_config(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete_config(key).await
    }

    async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }
}

#[tokio::test]
async fn test_migrate_hundred_credentials_between_files() {
    let temp_dir = TempDir::new().unwrap();
    let source = seeded_file_backend(&temp_dir, 100).await;
    let destination = FileBackend::open(temp_dir.path().join("destination")).await.unwrap();

    let report = migrate(&source, &destination).await.unwrap();

    assert_eq!(report.credentials_read, 100);
    assert_eq!(report.credentials_written, 100);
    assert_eq!(report.config_written, 2);
    assert!(report.is_complete());

    let migrated = destination.list_credentials().await.unwrap();
    assert_eq!(migrated.len(), 100);
    for i in 0..100 {
        let id = CredentialId::new(format!("cred-{i:03}"));
        assert_eq!(destination.get_credential(&id).await.unwrap(), credential(i));
    }
    let password = destination.get_config("panel_password").await.unwrap();
    assert_eq!(password.value, json!("pw"));
    assert!(password.is_secret());
}

#[tokio::test]
async fn test_single_failure_is_reported_not_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let source = seeded_file_backend(&temp_dir, 100).await;
    let destination = RejectingBackend {
        inner: Arc::new(MemoryBackend::new()),
        reject: CredentialId::new("cred-042"),
    };

    let report = migrate(&source, &destination).await.unwrap();

    assert_eq!(report.credentials_written, 99);
    assert_eq!(report.failure_count(), 1);
    assert_eq!(report.credential_failures[0].key, "cred-042");
    assert_eq!(destination.list_credentials().await.unwrap().len(), 99);
    assert_eq!(report.source, BackendKind::File);
    assert_eq!(report.destination, BackendKind::Memory);
}

#[tokio::test]
async fn test_migrating_twice_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let source = seeded_file_backend(&temp_dir, 10).await;
    let destination = MemoryBackend::new();

    migrate(&source, &destination).await.unwrap();
    let second = migrate(&source, &destination).await.unwrap();

    assert!(second.is_complete());
    assert_eq!(destination.list_credentials().await.unwrap().len(), 10);
}

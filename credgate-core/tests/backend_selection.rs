//! Integration tests for backend selection:
//! - Parameter-driven priority
//! - Fall-through on failed probes
//! - Determinism across repeated runs
//! - The real File driver as terminal fallback

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use credgate_core::{
    Backend, BackendConnector, BackendEnv, BackendKind, BackendSelector, ConfigEntry, ConfigStore,
    Credential, CredentialId, DriverConnector, FileBackend, ProbeOutcome, SelectionState,
    Sensitivity, StoreError,
};
use parking_lot::Mutex;
use tempfile::TempDir;

/// Backend that only reports its kind.
struct StubBackend(BackendKind);

#[async_trait]
impl Backend for StubBackend {
    fn kind(&self) -> BackendKind {
        self.0
    }

    async fn get_credential(&self, id: &CredentialId) -> Result<Credential, StoreError> {
        Err(StoreError::credential_not_found(id))
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        Ok(Vec::new())
    }

    async fn put_credential(&self, _credential: &Credential) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete_credential(&self, id: &CredentialId) -> Result<(), StoreError> {
        Err(StoreError::credential_not_found(id))
    }

    async fn get_config(&self, key: &str) -> Result<ConfigEntry, StoreError> {
        Err(StoreError::config_not_found(key))
    }

    async fn set_config(&self, _entry: &ConfigEntry) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_config(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        Ok(Vec::new())
    }

    async fn delete_config(&self, key: &str) -> Result<(), StoreError> {
        Err(StoreError::config_not_found(key))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Connector that records probe order and fails the configured kinds.
#[derive(Default)]
struct ScriptedConnector {
    failing: HashSet<BackendKind>,
    probed: Mutex<Vec<BackendKind>>,
}

impl ScriptedConnector {
    fn failing(kinds: &[BackendKind]) -> Arc<Self> {
        Arc::new(Self {
            failing: kinds.iter().copied().collect(),
            probed: Mutex::new(Vec::new()),
        })
    }

    fn probed(&self) -> Vec<BackendKind> {
        self.probed.lock().clone()
    }
}

#[async_trait]
impl BackendConnector for ScriptedConnector {
    async fn connect(
        &self,
        kind: BackendKind,
        _env: &BackendEnv,
    ) -> Result<Arc<dyn Backend>, StoreError> {
        self.probed.lock().push(kind);
        if self.failing.contains(&kind) {
            return Err(StoreError::connection(kind, "connection refused"));
        }
        Ok(Arc::new(StubBackend(kind)))
    }
}

fn env() -> BackendEnv {
    BackendEnv::file_only("unused")
}

#[tokio::test]
async fn test_only_postgres_selects_relational() {
    for _ in 0..3 {
        let connector = ScriptedConnector::failing(&[]);
        let selector = BackendSelector::new(env().with_postgres_dsn("postgres://db/x"), connector.clone());

        let handle = selector.select().await.unwrap();
        assert_eq!(handle.kind(), BackendKind::Relational);
        assert_eq!(connector.probed(), vec![BackendKind::Relational]);
    }
}

#[tokio::test]
async fn test_no_parameters_selects_file() {
    let connector = ScriptedConnector::failing(&[]);
    let selector = BackendSelector::new(env(), connector.clone());

    let handle = selector.select().await.unwrap();
    assert_eq!(handle.kind(), BackendKind::File);
    assert_eq!(connector.probed(), vec![BackendKind::File]);

    let report = selector.last_report().unwrap();
    for kind in [BackendKind::KeyValue, BackendKind::Relational, BackendKind::Document] {
        assert_eq!(report.outcome(kind), Some(&ProbeOutcome::Skipped));
    }
}

#[tokio::test]
async fn test_failed_probe_tries_next_candidate() {
    let connector = ScriptedConnector::failing(&[BackendKind::KeyValue]);
    let selector = BackendSelector::new(
        env()
            .with_key_value_url("redis://cache")
            .with_postgres_dsn("postgres://db/x")
            .with_mongodb_uri("mongodb://docs"),
        connector.clone(),
    );

    let handle = selector.select().await.unwrap();
    assert_eq!(handle.kind(), BackendKind::Relational);
    assert_eq!(
        connector.probed(),
        vec![BackendKind::KeyValue, BackendKind::Relational]
    );
    assert_eq!(selector.state(), SelectionState::Selected(BackendKind::Relational));
}

#[tokio::test]
async fn test_all_external_failures_fall_back_to_file() {
    let connector = ScriptedConnector::failing(&[
        BackendKind::KeyValue,
        BackendKind::Relational,
        BackendKind::Document,
    ]);
    let selector = BackendSelector::new(
        env()
            .with_key_value_url("redis://cache")
            .with_postgres_dsn("postgres://db/x")
            .with_mongodb_uri("mongodb://docs"),
        connector.clone(),
    );

    let handle = selector.select().await.unwrap();
    assert_eq!(handle.kind(), BackendKind::File);

    let report = selector.last_report().unwrap();
    assert_eq!(report.failures().count(), 3);
    assert_eq!(report.selected, BackendKind::File);
}

#[tokio::test]
async fn test_reprobe_moves_existing_stores() {
    let temp_dir = TempDir::new().unwrap();
    let selector = BackendSelector::new(
        BackendEnv::file_only(temp_dir.path()),
        Arc::new(DriverConnector::new()),
    );
    let handle = selector.select().await.unwrap();
    let config = ConfigStore::new(handle);
    config
        .set("log_level", serde_json::json!("info"), Sensitivity::Public)
        .await
        .unwrap();

    let report = selector.reprobe().await.unwrap();
    assert_eq!(report.selected, BackendKind::File);
    assert_eq!(
        config.get("log_level").await.unwrap().value,
        serde_json::json!("info")
    );
}

#[tokio::test]
async fn test_real_file_driver_is_fallback() {
    let temp_dir = TempDir::new().unwrap();
    // Port 1 never runs a redis server, so the probe fails fast.
    let env = BackendEnv::file_only(temp_dir.path()).with_key_value_url("redis://127.0.0.1:1/");
    let selector = BackendSelector::from_env(env);

    let handle = selector.select().await.unwrap();
    assert_eq!(handle.kind(), BackendKind::File);
    assert!(temp_dir.path().join(credgate_core::backend::DATABASE_FILE_NAME).exists());

    let report = selector.last_report().unwrap();
    assert!(matches!(
        report.outcome(BackendKind::KeyValue),
        Some(ProbeOutcome::Failed(_))
    ));
}

#[tokio::test]
async fn test_file_open_failure_is_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let blocker = temp_dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file in the way").unwrap();

    let selector = BackendSelector::from_env(BackendEnv::file_only(&blocker));
    assert!(selector.select().await.is_err());
    assert!(FileBackend::open(&blocker).await.is_err());
}

//! Startup selection of the single active backend.
//!
//! Candidates are probed in [`BackendKind::PRIORITY`] order. A candidate whose
//! connection parameter is absent is skipped, a failed connect moves on to the
//! next one, and the File backend closes the list so selection always ends in
//! [`SelectionState::Selected`] unless the local disk itself is unusable.
//!
//! Selection runs once. [`BackendSelector::reprobe`] is the only way to swap
//! the active backend afterwards.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendKind, FileBackend, StoreError};
use crate::pool::PoolSettings;

/// Default directory for the File backend, relative to the working directory.
pub const DEFAULT_DATA_DIR: &str = "credgate-data";

/// Connection parameters for every candidate, captured once.
#[derive(Clone, Default)]
pub struct BackendEnv {
    pub key_value_url: Option<String>,
    pub postgres_dsn: Option<String>,
    pub mongodb_uri: Option<String>,
    pub data_dir: PathBuf,
}

impl BackendEnv {
    /// Read `VALKEY_URL`/`REDIS_URL`, `POSTGRES_DSN` and `MONGODB_URI`.
    pub fn from_env(data_dir: impl Into<PathBuf>) -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            key_value_url: read("VALKEY_URL").or_else(|| read("REDIS_URL")),
            postgres_dsn: read("POSTGRES_DSN"),
            mongodb_uri: read("MONGODB_URI"),
            data_dir: data_dir.into(),
        }
    }

    /// Only the File backend, rooted at `data_dir`.
    pub fn file_only(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_key_value_url(mut self, url: impl Into<String>) -> Self {
        self.key_value_url = Some(url.into());
        self
    }

    pub fn with_postgres_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.postgres_dsn = Some(dsn.into());
        self
    }

    pub fn with_mongodb_uri(mut self, uri: impl Into<String>) -> Self {
        self.mongodb_uri = Some(uri.into());
        self
    }

    /// The connection parameter for an external candidate.
    pub fn parameter(&self, kind: BackendKind) -> Option<&str> {
        let value = match kind {
            BackendKind::KeyValue => self.key_value_url.as_deref(),
            BackendKind::Relational => self.postgres_dsn.as_deref(),
            BackendKind::Document => self.mongodb_uri.as_deref(),
            BackendKind::File | BackendKind::Memory => None,
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

// Connection strings carry passwords, so only presence is shown.
impl fmt::Debug for BackendEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEnv")
            .field("key_value_url", &self.key_value_url.is_some())
            .field("postgres_dsn", &self.postgres_dsn.is_some())
            .field("mongodb_uri", &self.mongodb_uri.is_some())
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

/// Builds a connected backend for a candidate.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(
        &self,
        kind: BackendKind,
        env: &BackendEnv,
    ) -> Result<Arc<dyn Backend>, StoreError>;
}

/// Connects the real drivers compiled into this build.
#[derive(Debug, Clone)]
pub struct DriverConnector {
    operation_timeout: Duration,
}

impl DriverConnector {
    pub fn new() -> Self {
        Self {
            operation_timeout: crate::pool::OPERATION_TIMEOUT_CAP,
        }
    }

    /// Cap for non key-value operations; clamped to the pool-wide cap.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    fn missing_parameter(kind: BackendKind) -> StoreError {
        StoreError::connection(kind, "no connection parameter set")
    }
}

impl Default for DriverConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
fn not_compiled(kind: BackendKind, feature: &str) -> StoreError {
    StoreError::connection(kind, format!("built without the `{feature}` feature"))
}

#[cfg(feature = "keyvalue")]
async fn connect_key_value(url: &str) -> Result<Arc<dyn Backend>, StoreError> {
    Ok(Arc::new(crate::backend::KeyValueBackend::connect(url).await?))
}

#[cfg(not(feature = "keyvalue"))]
async fn connect_key_value(_url: &str) -> Result<Arc<dyn Backend>, StoreError> {
    Err(not_compiled(BackendKind::KeyValue, "keyvalue"))
}

#[cfg(feature = "relational")]
async fn connect_relational(dsn: &str, settings: PoolSettings) -> Result<Arc<dyn Backend>, StoreError> {
    Ok(Arc::new(
        crate::backend::RelationalBackend::connect_with(dsn, settings).await?,
    ))
}

#[cfg(not(feature = "relational"))]
async fn connect_relational(_dsn: &str, _settings: PoolSettings) -> Result<Arc<dyn Backend>, StoreError> {
    Err(not_compiled(BackendKind::Relational, "relational"))
}

#[cfg(feature = "document")]
async fn connect_document(uri: &str, settings: PoolSettings) -> Result<Arc<dyn Backend>, StoreError> {
    Ok(Arc::new(
        crate::backend::DocumentBackend::connect_with(uri, settings).await?,
    ))
}

#[cfg(not(feature = "document"))]
async fn connect_document(_uri: &str, _settings: PoolSettings) -> Result<Arc<dyn Backend>, StoreError> {
    Err(not_compiled(BackendKind::Document, "document"))
}

#[async_trait]
impl BackendConnector for DriverConnector {
    async fn connect(
        &self,
        kind: BackendKind,
        env: &BackendEnv,
    ) -> Result<Arc<dyn Backend>, StoreError> {
        let parameter = || env.parameter(kind).ok_or_else(|| Self::missing_parameter(kind));
        match kind {
            BackendKind::KeyValue => connect_key_value(parameter()?).await,
            BackendKind::Relational => {
                let settings = PoolSettings::relational().with_operation_timeout(self.operation_timeout);
                connect_relational(parameter()?, settings).await
            }
            BackendKind::Document => {
                let settings = PoolSettings::document().with_operation_timeout(self.operation_timeout);
                connect_document(parameter()?, settings).await
            }
            BackendKind::File => {
                let settings = PoolSettings::file().with_operation_timeout(self.operation_timeout);
                let backend = FileBackend::open_with(&env.data_dir, settings).await?;
                Ok(Arc::new(backend))
            }
            BackendKind::Memory => Err(StoreError::connection(
                kind,
                "memory backend is never selected from the environment",
            )),
        }
    }
}

/// Shared, read-mostly reference to the active backend.
///
/// Stores call [`current`](Self::current) once per operation and keep that
/// snapshot for the whole call, so a reprobe never swaps a backend under an
/// in-flight operation.
#[derive(Clone)]
pub struct BackendHandle {
    inner: Arc<RwLock<Arc<dyn Backend>>>,
}

impl BackendHandle {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(backend)),
        }
    }

    pub fn current(&self) -> Arc<dyn Backend> {
        self.inner.read().clone()
    }

    pub fn kind(&self) -> BackendKind {
        self.inner.read().kind()
    }

    fn replace(&self, backend: Arc<dyn Backend>) {
        *self.inner.write() = backend;
    }
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle").field("kind", &self.kind()).finish()
    }
}

/// Where the selector is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "backend", rename_all = "snake_case")]
pub enum SelectionState {
    Unselected,
    Probing(BackendKind),
    Selected(BackendKind),
}

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// Connection parameter absent.
    Skipped,
    Failed(String),
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeAttempt {
    pub kind: BackendKind,
    #[serde(flatten)]
    pub outcome: ProbeOutcome,
}

/// Record of one selection run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub attempts: Vec<ProbeAttempt>,
    pub selected: BackendKind,
}

impl ProbeReport {
    pub fn outcome(&self, kind: BackendKind) -> Option<&ProbeOutcome> {
        self.attempts.iter().find(|a| a.kind == kind).map(|a| &a.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ProbeAttempt> {
        self.attempts
            .iter()
            .filter(|a| matches!(a.outcome, ProbeOutcome::Failed(_)))
    }
}

/// Owns the process-wide active backend.
pub struct BackendSelector {
    env: BackendEnv,
    connector: Arc<dyn BackendConnector>,
    state: RwLock<SelectionState>,
    handle: RwLock<Option<BackendHandle>>,
    report: RwLock<Option<ProbeReport>>,
    // Serializes select and reprobe.
    probing: Mutex<()>,
}

impl BackendSelector {
    pub fn new(env: BackendEnv, connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            env,
            connector,
            state: RwLock::new(SelectionState::Unselected),
            handle: RwLock::new(None),
            report: RwLock::new(None),
            probing: Mutex::new(()),
        }
    }

    /// Selector over the real drivers.
    pub fn from_env(env: BackendEnv) -> Self {
        Self::new(env, Arc::new(DriverConnector::new()))
    }

    pub fn state(&self) -> SelectionState {
        *self.state.read()
    }

    /// The active handle, if selection has run.
    pub fn handle(&self) -> Option<BackendHandle> {
        self.handle.read().clone()
    }

    pub fn last_report(&self) -> Option<ProbeReport> {
        self.report.read().clone()
    }

    /// Run selection if it has not run yet and return the active handle.
    ///
    /// Repeated calls return the same handle without probing again.
    pub async fn select(&self) -> Result<BackendHandle, StoreError> {
        let _guard = self.probing.lock().await;
        if let Some(handle) = self.handle() {
            return Ok(handle);
        }

        let (backend, report) = self.probe().await?;
        let handle = BackendHandle::new(backend);
        *self.handle.write() = Some(handle.clone());
        *self.report.write() = Some(report);
        Ok(handle)
    }

    /// Probe all candidates again and swap the active backend in place.
    ///
    /// Operations that already took a snapshot finish on the old backend.
    /// On failure the old backend stays active and the state reverts to it.
    pub async fn reprobe(&self) -> Result<ProbeReport, StoreError> {
        let _guard = self.probing.lock().await;
        let previous = self.handle().map(|h| h.kind());
        let prior_state = self.state();
        let (backend, report) = match self.probe().await {
            Ok(selected) => selected,
            Err(e) => {
                *self.state.write() = prior_state;
                warn!(previous = ?previous, error = %e, "backend reprobe failed, keeping current backend");
                return Err(e);
            }
        };

        let existing = self.handle();
        match existing {
            Some(handle) => handle.replace(backend),
            None => *self.handle.write() = Some(BackendHandle::new(backend)),
        }
        *self.report.write() = Some(report.clone());

        info!(
            previous = ?previous,
            selected = %report.selected,
            "backend reprobe complete"
        );
        Ok(report)
    }

    async fn probe(&self) -> Result<(Arc<dyn Backend>, ProbeReport), StoreError> {
        let mut attempts = Vec::with_capacity(BackendKind::PRIORITY.len());

        for kind in BackendKind::PRIORITY {
            if kind != BackendKind::File && self.env.parameter(kind).is_none() {
                debug!(backend = %kind, "no connection parameter, skipping");
                attempts.push(ProbeAttempt {
                    kind,
                    outcome: ProbeOutcome::Skipped,
                });
                continue;
            }

            *self.state.write() = SelectionState::Probing(kind);
            match self.connector.connect(kind, &self.env).await {
                Ok(backend) => {
                    attempts.push(ProbeAttempt {
                        kind,
                        outcome: ProbeOutcome::Connected,
                    });
                    *self.state.write() = SelectionState::Selected(kind);
                    info!(backend = %kind, "selected storage backend");
                    return Ok((
                        backend,
                        ProbeReport {
                            attempts,
                            selected: kind,
                        },
                    ));
                }
                Err(e) if kind == BackendKind::File => {
                    error!(backend = %kind, error = %e, "file backend unavailable");
                    *self.state.write() = SelectionState::Unselected;
                    return Err(e);
                }
                Err(e) => {
                    warn!(backend = %kind, error = %e, "backend probe failed, trying next candidate");
                    attempts.push(ProbeAttempt {
                        kind,
                        outcome: ProbeOutcome::Failed(e.to_string()),
                    });
                }
            }
        }

        // PRIORITY ends with File, which either returns or errors above.
        Err(StoreError::connection(
            BackendKind::File,
            "no candidate backend was probed",
        ))
    }
}

impl fmt::Debug for BackendSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSelector")
            .field("env", &self.env)
            .field("state", &self.state())
            .finish()
    }
}

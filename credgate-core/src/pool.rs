//! Connection resource management shared by the backend drivers.
//!
//! - Relational: sqlx pool bounded by [`PoolSettings::relational`] (2..=10).
//! - Document: the mongodb driver's own pool, default size.
//! - Key-value: one [`ReconnectingConnection`], reconnected once on failure.
//! - File: one [`ExclusiveHandle`] per process.
//!
//! Every operation runs under [`bounded`] so a stuck backend surfaces as a
//! retryable [`StoreError::Timeout`] instead of a hang.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::backend::{BackendKind, StoreError};

/// Fixed timeout for key-value operations and reconnects.
pub const KEY_VALUE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound applied to every non key-value operation.
pub const OPERATION_TIMEOUT_CAP: Duration = Duration::from_secs(30);

/// Resource bounds for one backend driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub min_connections: u32,
    /// `None` leaves sizing to the driver default.
    pub max_connections: Option<u32>,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
    /// Bound for one operation once a connection is held.
    pub operation_timeout: Duration,
}

impl PoolSettings {
    pub fn relational() -> Self {
        Self {
            min_connections: 2,
            max_connections: Some(10),
            acquire_timeout: Duration::from_secs(10),
            operation_timeout: OPERATION_TIMEOUT_CAP,
        }
    }

    pub fn document() -> Self {
        Self {
            min_connections: 0,
            max_connections: None,
            acquire_timeout: Duration::from_secs(10),
            operation_timeout: OPERATION_TIMEOUT_CAP,
        }
    }

    pub fn key_value() -> Self {
        Self {
            min_connections: 1,
            max_connections: Some(1),
            acquire_timeout: KEY_VALUE_TIMEOUT,
            operation_timeout: KEY_VALUE_TIMEOUT,
        }
    }

    pub fn file() -> Self {
        Self {
            min_connections: 1,
            max_connections: Some(1),
            acquire_timeout: Duration::from_secs(10),
            operation_timeout: OPERATION_TIMEOUT_CAP,
        }
    }

    /// Replace the operation timeout, never exceeding [`OPERATION_TIMEOUT_CAP`].
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout.min(OPERATION_TIMEOUT_CAP);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
            if self.min_connections > max {
                return Err("min_connections cannot be greater than max_connections".to_string());
            }
        }
        if self.operation_timeout.is_zero() {
            return Err("operation_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Run `fut` with a time bound, mapping expiry to [`StoreError::Timeout`].
pub async fn bounded<T, F>(
    backend: BackendKind,
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(backend = %backend, operation, "backend operation timed out");
            Err(StoreError::Timeout { backend, operation })
        }
    }
}

/// A single handle guarded by an async lock.
///
/// Used where the engine tolerates only one writer. Waiting for the lock is
/// bounded by the acquire timeout and reported as pool exhaustion.
pub struct ExclusiveHandle<T> {
    inner: Mutex<T>,
    backend: BackendKind,
    acquire_timeout: Duration,
}

impl<T> ExclusiveHandle<T> {
    pub fn new(handle: T, backend: BackendKind, acquire_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(handle),
            backend,
            acquire_timeout,
        }
    }

    /// Acquire the handle. The guard releases it on every exit path.
    pub async fn acquire(&self) -> Result<MutexGuard<'_, T>, StoreError> {
        tokio::time::timeout(self.acquire_timeout, self.inner.lock())
            .await
            .map_err(|_| StoreError::PoolExhausted {
                backend: self.backend,
            })
    }
}

/// Opens connections for a [`ReconnectingConnection`].
#[async_trait]
pub trait OpenConnection: Send + Sync {
    type Conn: Clone + Send + Sync + 'static;

    async fn open(&self) -> Result<Self::Conn, StoreError>;
}

/// One reused connection that is reopened once when an operation observes a
/// dropped connection.
pub struct ReconnectingConnection<O: OpenConnection> {
    opener: O,
    current: Mutex<Option<O::Conn>>,
    backend: BackendKind,
    timeout: Duration,
}

impl<O: OpenConnection> ReconnectingConnection<O> {
    /// Open the first connection eagerly so a bad endpoint fails the probe.
    pub async fn connect(
        opener: O,
        backend: BackendKind,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let conn = bounded(backend, "connect", timeout, opener.open()).await?;
        Ok(Self {
            opener,
            current: Mutex::new(Some(conn)),
            backend,
            timeout,
        })
    }

    async fn checkout(&self) -> Result<O::Conn, StoreError> {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref() {
            return Ok(conn.clone());
        }
        let conn = bounded(self.backend, "reconnect", self.timeout, self.opener.open()).await?;
        *current = Some(conn.clone());
        debug!(backend = %self.backend, "reconnected");
        Ok(conn)
    }

    async fn invalidate(&self) {
        self.current.lock().await.take();
    }

    /// Run `op` on the shared connection.
    ///
    /// A connection fault triggers exactly one reconnect and retry; a second
    /// fault is returned to the caller.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, StoreError>
    where
        F: Fn(O::Conn) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let conn = self.checkout().await?;
        match bounded(self.backend, operation, self.timeout, op(conn)).await {
            Err(e) if e.is_connection_fault() => {
                warn!(backend = %self.backend, operation, error = %e, "connection fault, reconnecting once");
                self.invalidate().await;
                let conn = self.checkout().await?;
                bounded(self.backend, operation, self.timeout, op(conn)).await
            }
            other => other,
        }
    }
}

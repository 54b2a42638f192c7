//! Storage backend abstraction.
//!
//! This module provides:
//! - [`Backend`] - The capability set every storage engine implements
//! - [`BackendKind`] - The four selectable variants, in probe priority order
//! - [`StoreError`] - Error taxonomy shared by all backends and stores
//! - [`MemoryBackend`] - In-process implementation for tests and ephemeral runs
//! - [`FileBackend`] - Embedded SQLite file, always available
//! - [`KeyValueBackend`] - Valkey/Redis (with `keyvalue` feature)
//! - [`RelationalBackend`] - PostgreSQL (with `relational` feature)
//! - [`DocumentBackend`] - MongoDB (with `document` feature)
//!
//! Drivers are constructed through their own `connect`/`open` functions and
//! then used only through `Arc<dyn Backend>`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::model::{ConfigEntry, Credential, CredentialId};

mod file;
mod memory;
mod sql;
#[cfg(feature = "keyvalue")]
mod keyvalue;
#[cfg(feature = "relational")]
mod relational;
#[cfg(feature = "document")]
mod document;

pub use file::{DATABASE_FILE_NAME, FileBackend};
pub use memory::MemoryBackend;
#[cfg(feature = "keyvalue")]
pub use keyvalue::KeyValueBackend;
#[cfg(feature = "relational")]
pub use relational::RelationalBackend;
#[cfg(feature = "document")]
pub use document::DocumentBackend;

/// The selectable backend variants.
///
/// Declaration order is probe priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Valkey / Redis.
    KeyValue,
    /// PostgreSQL.
    Relational,
    /// MongoDB.
    Document,
    /// Embedded SQLite file in the working directory.
    File,
    /// Process memory. Never chosen by the selector.
    Memory,
}

impl BackendKind {
    /// Candidates in the order the selector probes them.
    pub const PRIORITY: [BackendKind; 4] = [
        BackendKind::KeyValue,
        BackendKind::Relational,
        BackendKind::Document,
        BackendKind::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeyValue => "keyvalue",
            Self::Relational => "relational",
            Self::Document => "document",
            Self::File => "file",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyvalue" | "valkey" | "redis" => Ok(Self::KeyValue),
            "relational" | "postgres" | "postgresql" => Ok(Self::Relational),
            "document" | "mongodb" | "mongo" => Ok(Self::Document),
            "file" | "sqlite" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown backend kind: {other}")),
        }
    }
}

/// What kind of record a lookup was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Credential,
    Config,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Credential => f.write_str("credential"),
            Self::Config => f.write_str("config entry"),
        }
    }
}

/// Error type for backend and store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend is unreachable or the connection dropped.
    #[error("{backend} backend unavailable: {message}")]
    Connection { backend: BackendKind, message: String },

    /// An operation exceeded its time bound.
    #[error("{backend} backend timed out during {operation}")]
    Timeout {
        backend: BackendKind,
        operation: &'static str,
    },

    /// No pooled connection became available in time.
    #[error("{backend} connection pool exhausted")]
    PoolExhausted { backend: BackendKind },

    /// The requested record was not found.
    #[error("{kind} not found: {key}")]
    NotFound { kind: RecordKind, key: String },

    /// A uniqueness constraint was violated.
    #[error("conflict storing credential {id}: {message}")]
    Conflict { id: CredentialId, message: String },

    /// The backend rejected a write.
    #[error("{backend} backend rejected write: {message}")]
    Write { backend: BackendKind, message: String },

    /// A record failed validation before reaching the backend.
    #[error("validation failed: {0}")]
    Validation(#[from] crate::model::ValidationError),

    /// A stored record could not be decoded.
    #[error("corrupt record: {message}")]
    Corrupt { message: String },

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn connection(backend: BackendKind, message: impl fmt::Display) -> Self {
        Self::Connection {
            backend,
            message: message.to_string(),
        }
    }

    pub fn write(backend: BackendKind, message: impl fmt::Display) -> Self {
        Self::Write {
            backend,
            message: message.to_string(),
        }
    }

    pub fn credential_not_found(id: &CredentialId) -> Self {
        Self::NotFound {
            kind: RecordKind::Credential,
            key: id.to_string(),
        }
    }

    pub fn config_not_found(key: &str) -> Self {
        Self::NotFound {
            kind: RecordKind::Config,
            key: key.to_string(),
        }
    }

    pub fn duplicate_refresh_token(id: &CredentialId, existing: &str) -> Self {
        Self::Conflict {
            id: id.clone(),
            message: format!("refresh token already stored under {existing}"),
        }
    }

    /// Whether a caller may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::PoolExhausted { .. }
                | Self::Write { .. }
        )
    }

    /// Whether the error suggests the underlying connection is broken.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

/// Result of a batch write.
///
/// Partial failure is reported per id rather than aborting the batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub written: usize,
    pub failed: Vec<(CredentialId, StoreError)>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Capability set implemented by every storage engine.
///
/// Implementations include:
/// - [`MemoryBackend`] - In-memory storage for testing
/// - [`FileBackend`] - Embedded SQLite file
/// - [`KeyValueBackend`] (with `keyvalue` feature) - Valkey/Redis
/// - [`RelationalBackend`] (with `relational` feature) - PostgreSQL
/// - [`DocumentBackend`] (with `document` feature) - MongoDB
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> BackendKind;

    /// Retrieve a credential by id.
    async fn get_credential(&self, id: &CredentialId) -> Result<Credential, StoreError>;

    /// All stored credentials. Order is unspecified.
    async fn list_credentials(&self) -> Result<Vec<Credential>, StoreError>;

    /// Insert or replace a credential.
    ///
    /// Fails with [`StoreError::Conflict`] if the refresh token is already
    /// stored under a different id.
    async fn put_credential(&self, credential: &Credential) -> Result<(), StoreError>;

    /// Write many credentials, reporting which ids failed.
    async fn batch_put_credentials(
        &self,
        credentials: &[Credential],
    ) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome::default();
        for credential in credentials {
            match self.put_credential(credential).await {
                Ok(()) => outcome.written += 1,
                Err(e) => outcome.failed.push((credential.id.clone(), e)),
            }
        }
        Ok(outcome)
    }

    /// Delete a credential by id.
    async fn delete_credential(&self, id: &CredentialId) -> Result<(), StoreError>;

    /// Retrieve a config entry with its stored sensitivity.
    async fn get_config(&self, key: &str) -> Result<ConfigEntry, StoreError>;

    /// Store a config entry, overwriting any existing one.
    async fn set_config(&self, entry: &ConfigEntry) -> Result<(), StoreError>;

    /// All config entries. Order is unspecified.
    async fn list_config(&self) -> Result<Vec<ConfigEntry>, StoreError>;

    /// Delete a config value.
    async fn delete_config(&self, key: &str) -> Result<(), StoreError>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert_eq!(
            BackendKind::PRIORITY,
            [
                BackendKind::KeyValue,
                BackendKind::Relational,
                BackendKind::Document,
                BackendKind::File
            ]
        );
    }

    #[test]
    fn test_kind_parse_aliases() {
        assert_eq!("redis".parse::<BackendKind>().unwrap(), BackendKind::KeyValue);
        assert_eq!("postgres".parse::<BackendKind>().unwrap(), BackendKind::Relational);
        assert_eq!("mongodb".parse::<BackendKind>().unwrap(), BackendKind::Document);
        assert_eq!("sqlite".parse::<BackendKind>().unwrap(), BackendKind::File);
        assert!("oracle".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::connection(BackendKind::KeyValue, "refused").is_retryable());
        assert!(StoreError::PoolExhausted { backend: BackendKind::Relational }.is_retryable());
        assert!(StoreError::write(BackendKind::File, "disk full").is_retryable());
        assert!(!StoreError::config_not_found("x").is_retryable());
        assert!(!StoreError::duplicate_refresh_token(&"a".into(), "b").is_retryable());
    }
}

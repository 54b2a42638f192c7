//! # Credgate Core
//!
//! Storage and access control for OAuth credentials and runtime config.
//!
//! This crate provides:
//! - Domain types for credentials and config entries
//! - A [`Backend`] capability set with Valkey/Redis, PostgreSQL, MongoDB,
//!   SQLite file and in-memory implementations
//! - A [`BackendSelector`] that picks one active backend at startup
//! - [`CredentialStore`] and [`ConfigStore`] façades over the active backend
//! - A [`RedactionLayer`] that decides which fields each caller [`Scope`] sees
//! - Opaque session tokens via [`AuthTokenIssuer`]
//! - A [`migrate`](migrate::migrate) utility for copying between backends
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use credgate_core::{BackendEnv, BackendSelector, CredentialStore, RedactionLayer, Scope};
//!
//! # async fn example() -> Result<(), credgate_core::CredgateError> {
//! let selector = BackendSelector::from_env(BackendEnv::from_env("credgate-data"));
//! let handle = selector.select().await?;
//! let store = CredentialStore::new(handle);
//!
//! let layer = RedactionLayer::new();
//! for credential in store.list().await? {
//!     let view = layer.credential(&credential, Scope::Session)?;
//!     println!("{}", serde_json::to_string(&view).unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backend;
pub mod clock;
pub mod config;
pub mod config_store;
pub mod credential_store;
pub mod error;
pub mod migrate;
pub mod model;
pub mod pool;
pub mod redact;
pub mod secret;
pub mod selector;

// Re-export commonly used types at crate root
pub use model::{
    ConfigEntry,
    Credential,
    CredentialId,
    CredentialStatus,
    Metadata,
    Provider,
    Sensitivity,
};

pub use secret::Secret;

pub use backend::{
    Backend,
    BackendKind,
    BatchOutcome,
    FileBackend,
    MemoryBackend,
    StoreError,
};

#[cfg(feature = "keyvalue")]
pub use backend::KeyValueBackend;

#[cfg(feature = "relational")]
pub use backend::RelationalBackend;

#[cfg(feature = "document")]
pub use backend::DocumentBackend;

pub use selector::{
    BackendConnector,
    BackendEnv,
    BackendHandle,
    BackendSelector,
    DriverConnector,
    ProbeOutcome,
    ProbeReport,
    SelectionState,
};

pub use credential_store::{CredentialStore, ProviderCounts, StateUpdate};
pub use config_store::ConfigStore;

pub use redact::{
    RedactedConfigEntry,
    RedactedCredential,
    RedactionError,
    RedactionLayer,
    Scope,
};

pub use auth::{
    AuthError,
    AuthTokenIssuer,
    IssuedToken,
    PasswordAuthenticator,
    PasswordEnv,
    PasswordKind,
    TokenClaims,
    TokenScope,
    resolve_password,
};

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConfigError, CredgateConfig};
pub use error::CredgateError;
pub use migrate::{MigrationReport, migrate};

//! Domain model types for credgate.
//!
//! This module defines the records persisted by every backend:
//! - [`CredentialId`] - Stable identifier assigned when a credential is created
//! - [`Provider`] - Upstream account type a credential authenticates against
//! - [`Credential`] - One OAuth-derived identity, including its secrets
//! - [`ConfigEntry`] - A named runtime setting with a [`Sensitivity`] tier

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::secret::Secret;

/// Stable identifier for a stored credential.
///
/// # Examples
///
/// ```
/// use credgate_core::CredentialId;
///
/// let id = CredentialId::new("gemini-user-1.json");
/// assert_eq!(id.as_str(), "gemini-user-1.json");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(String);

impl CredentialId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CredentialId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CredentialId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Upstream account type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Gemini CLI OAuth account.
    GeminiCli,
    /// Antigravity OAuth account.
    Antigravity,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::GeminiCli, Provider::Antigravity];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeminiCli => "gemini_cli",
            Self::Antigravity => "antigravity",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gemini_cli" => Ok(Self::GeminiCli),
            "antigravity" => Ok(Self::Antigravity),
            other => Err(ParseError::UnknownVariant {
                kind: "provider",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle status of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Disabled,
    Invalid,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "disabled" => Ok(Self::Disabled),
            "invalid" => Ok(Self::Invalid),
            other => Err(ParseError::UnknownVariant {
                kind: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Free-form, non-secret key/value pairs that keep insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Vec<(String, String)>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, keeping the original position of an existing key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (k, v) in iter {
            metadata.insert(k, v);
        }
        metadata
    }
}

/// One OAuth-derived identity usable for upstream API calls.
///
/// `refresh_token` and `client_secret` are secret-tier, `access_token` is
/// sensitive-tier, everything else is public-tier within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub provider: Provider,
    pub access_token: Secret,
    pub refresh_token: Secret,
    pub client_id: String,
    pub client_secret: Secret,
    pub expiry: Option<DateTime<Utc>>,
    pub status: CredentialStatus,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Credential {
    /// Create an active credential with no access token yet.
    pub fn new(
        id: impl Into<CredentialId>,
        provider: Provider,
        refresh_token: impl Into<Secret>,
        client_id: impl Into<String>,
        client_secret: impl Into<Secret>,
    ) -> Self {
        Self {
            id: id.into(),
            provider,
            access_token: Secret::default(),
            refresh_token: refresh_token.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            expiry: None,
            status: CredentialStatus::Active,
            metadata: Metadata::new(),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<Secret>, expiry: DateTime<Utc>) -> Self {
        self.access_token = token.into();
        self.expiry = Some(expiry);
        self
    }

    pub fn with_status(mut self, status: CredentialStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Check if the access token has expired.
    ///
    /// Returns `true` if no expiry is known.
    pub fn is_access_token_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.map(|exp| exp <= now).unwrap_or(true)
    }

    /// SHA-256 hex digest of the refresh token.
    ///
    /// Backends index this instead of the raw token to detect duplicates.
    pub fn refresh_digest(&self) -> String {
        hex::encode(Sha256::digest(self.refresh_token.expose().as_bytes()))
    }

    /// Check mandatory fields before a write.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.as_str().trim().is_empty() {
            return Err(ValidationError::MissingField { field: "id" });
        }
        if self.refresh_token.is_empty() {
            return Err(ValidationError::MissingField { field: "refresh_token" });
        }
        if self.client_id.trim().is_empty() {
            return Err(ValidationError::MissingField { field: "client_id" });
        }
        Ok(())
    }
}

/// Visibility tier of a config entry.
///
/// Ordered by strictness, so `max` picks the stricter tier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    #[default]
    Public,
    Secret,
}

/// Config keys that always hold secret values.
const SECRET_CONFIG_KEYS: &[&str] = &["panel_password", "api_password", "password"];

/// Key suffixes that mark a config entry as secret.
const SECRET_CONFIG_SUFFIXES: &[&str] = &["_password", "_secret", "_token", "_key"];

impl Sensitivity {
    /// Minimum tier implied by a config key name.
    pub fn classify(key: &str) -> Self {
        let key = key.to_ascii_lowercase();
        if SECRET_CONFIG_KEYS.contains(&key.as_str())
            || SECRET_CONFIG_SUFFIXES.iter().any(|s| key.ends_with(s))
        {
            Self::Secret
        } else {
            Self::Public
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Secret => "secret",
        }
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sensitivity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "secret" => Ok(Self::Secret),
            other => Err(ParseError::UnknownVariant {
                kind: "sensitivity",
                value: other.to_string(),
            }),
        }
    }
}

/// A named runtime setting.
///
/// The stored sensitivity is never lower than [`Sensitivity::classify`]
/// gives for the key.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub sensitivity: Sensitivity,
}

impl ConfigEntry {
    /// Create an entry with the tier implied by its key.
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        let key = key.into();
        let sensitivity = Sensitivity::classify(&key);
        Self {
            key,
            value,
            sensitivity,
        }
    }

    /// Raise the tier to `sensitivity`. A lower tier leaves the entry unchanged.
    pub fn with_sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.sensitivity = self.sensitivity.max(sensitivity);
        self
    }

    pub fn is_secret(&self) -> bool {
        self.sensitivity == Sensitivity::Secret
    }
}

impl fmt::Debug for ConfigEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ConfigEntry");
        s.field("key", &self.key);
        match self.sensitivity {
            Sensitivity::Public => s.field("value", &self.value),
            Sensitivity::Secret => s.field("value", &"[REDACTED]"),
        };
        s.field("sensitivity", &self.sensitivity).finish()
    }
}

/// Error parsing an enum value read back from storage.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unknown {kind}: '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

/// A credential failed mandatory field checks.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("missing mandatory field: {field}")]
    MissingField { field: &'static str },
}

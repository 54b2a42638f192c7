//! Field-visibility policy applied to every externally observable read.
//!
//! The policy is an allow-list: a [`Credential`] is first decomposed into
//! `(CredentialField, value)` pairs and only the fields listed for the
//! caller's [`Scope`] are copied into the outgoing view. A field added to the
//! model stays invisible until it is listed here.
//!
//! | Scope | Credential fields | Config entries |
//! |---|---|---|
//! | Unauthenticated | none | none |
//! | Session | id, provider, status, expiry, metadata | public |
//! | Elevated | all | public + secret |
//!
//! For log sinks, secret material is reduced to a [`Fingerprint`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use tracing::error;

use crate::model::{ConfigEntry, Credential, Sensitivity};

/// Authorization level of a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Unauthenticated,
    Session,
    Elevated,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => f.write_str("unauthenticated"),
            Self::Session => f.write_str("session"),
            Self::Elevated => f.write_str("elevated"),
        }
    }
}

/// Every field of a [`Credential`], by serialized name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialField {
    Id,
    Provider,
    AccessToken,
    RefreshToken,
    ClientId,
    ClientSecret,
    Expiry,
    Status,
    Metadata,
}

impl CredentialField {
    pub const ALL: [CredentialField; 9] = [
        Self::Id,
        Self::Provider,
        Self::AccessToken,
        Self::RefreshToken,
        Self::ClientId,
        Self::ClientSecret,
        Self::Expiry,
        Self::Status,
        Self::Metadata,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Provider => "provider",
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
            Self::ClientId => "client_id",
            Self::ClientSecret => "client_secret",
            Self::Expiry => "expiry",
            Self::Status => "status",
            Self::Metadata => "metadata",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

const SESSION_FIELDS: &[CredentialField] = &[
    CredentialField::Id,
    CredentialField::Provider,
    CredentialField::Status,
    CredentialField::Expiry,
    CredentialField::Metadata,
];

/// Credential fields visible to a scope.
pub fn allowed_credential_fields(scope: Scope) -> &'static [CredentialField] {
    match scope {
        Scope::Unauthenticated => &[],
        Scope::Session => SESSION_FIELDS,
        Scope::Elevated => &CredentialField::ALL,
    }
}

/// Whether a config entry of `sensitivity` is visible to a scope.
pub fn config_visible(scope: Scope, sensitivity: Sensitivity) -> bool {
    match scope {
        Scope::Unauthenticated => false,
        Scope::Session => sensitivity == Sensitivity::Public,
        Scope::Elevated => true,
    }
}

/// Error raised at the redaction boundary.
///
/// Display text is generic; offending values are never included.
#[derive(Debug, Error)]
pub enum RedactionError {
    /// A field outside the scope's allow-list reached the boundary.
    #[error("response blocked by redaction policy")]
    Violation { scope: Scope, field: String },

    #[error("response could not be serialized")]
    Serialization(#[from] serde_json::Error),
}

/// Credential view containing only the fields its scope permits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RedactedCredential(Map<String, Value>);

impl RedactedCredential {
    pub fn get(&self, field: CredentialField) -> Option<&Value> {
        self.0.get(field.name())
    }

    pub fn contains(&self, field: CredentialField) -> bool {
        self.0.contains_key(field.name())
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Config entry as seen by a caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedactedConfigEntry {
    pub key: String,
    pub value: Value,
    pub sensitivity: Sensitivity,
}

fn credential_fields(credential: &Credential) -> Result<Vec<(CredentialField, Value)>, serde_json::Error> {
    Ok(vec![
        (CredentialField::Id, Value::String(credential.id.to_string())),
        (CredentialField::Provider, serde_json::to_value(credential.provider)?),
        (
            CredentialField::AccessToken,
            Value::String(credential.access_token.expose().to_string()),
        ),
        (
            CredentialField::RefreshToken,
            Value::String(credential.refresh_token.expose().to_string()),
        ),
        (CredentialField::ClientId, Value::String(credential.client_id.clone())),
        (
            CredentialField::ClientSecret,
            Value::String(credential.client_secret.expose().to_string()),
        ),
        (CredentialField::Expiry, serde_json::to_value(credential.expiry)?),
        (CredentialField::Status, serde_json::to_value(credential.status)?),
        (CredentialField::Metadata, metadata_value(credential)),
    ])
}

fn metadata_value(credential: &Credential) -> Value {
    let map: Map<String, Value> = credential
        .metadata
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect();
    Value::Object(map)
}

/// The single serialization boundary for credentials and config entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedactionLayer;

impl RedactionLayer {
    pub fn new() -> Self {
        Self
    }

    /// Build the view of `credential` permitted for `scope`.
    pub fn credential(
        &self,
        credential: &Credential,
        scope: Scope,
    ) -> Result<RedactedCredential, RedactionError> {
        let allowed = allowed_credential_fields(scope);
        let view: Map<String, Value> = credential_fields(credential)?
            .into_iter()
            .filter(|(field, _)| allowed.contains(field))
            .map(|(field, value)| (field.name().to_string(), value))
            .collect();

        let view = RedactedCredential(view);
        self.check_credential_view(&view, scope)?;
        Ok(view)
    }

    pub fn credentials(
        &self,
        credentials: &[Credential],
        scope: Scope,
    ) -> Result<Vec<RedactedCredential>, RedactionError> {
        credentials
            .iter()
            .map(|c| self.credential(c, scope))
            .collect()
    }

    /// Filter config entries down to those `scope` may see.
    pub fn config_entries(&self, entries: &[ConfigEntry], scope: Scope) -> Vec<RedactedConfigEntry> {
        entries
            .iter()
            .filter(|e| config_visible(scope, e.sensitivity))
            .map(|e| RedactedConfigEntry {
                key: e.key.clone(),
                value: e.value.clone(),
                sensitivity: e.sensitivity,
            })
            .collect()
    }

    /// Single entry view, or `None` if `scope` may not see it.
    pub fn config_entry(&self, entry: &ConfigEntry, scope: Scope) -> Option<RedactedConfigEntry> {
        self.config_entries(std::slice::from_ref(entry), scope)
            .into_iter()
            .next()
    }

    fn check_credential_view(
        &self,
        view: &RedactedCredential,
        scope: Scope,
    ) -> Result<(), RedactionError> {
        let allowed = allowed_credential_fields(scope);
        for name in view.field_names() {
            let permitted = CredentialField::from_name(name)
                .map(|f| allowed.contains(&f))
                .unwrap_or(false);
            if !permitted {
                return Err(self.violation(scope, name));
            }
        }
        Ok(())
    }

    /// Check an assembled response payload before it leaves the process.
    ///
    /// Any object key naming a credential field outside the scope's
    /// allow-list, at any depth, is a violation. So is any config-shaped
    /// object (a `sensitivity` tag, or a `key` with a `value`) whose tier
    /// the scope may not see. Nothing is dropped silently.
    pub fn guard(&self, payload: &Value, scope: Scope) -> Result<(), RedactionError> {
        let allowed = allowed_credential_fields(scope);
        let mut stack = vec![payload];
        while let Some(value) = stack.pop() {
            match value {
                Value::Object(map) => {
                    if let Some(sensitivity) = config_sensitivity(map) {
                        if !config_visible(scope, sensitivity) {
                            let name = map.get("key").and_then(Value::as_str).unwrap_or("sensitivity");
                            return Err(self.violation(scope, name));
                        }
                    }
                    for (key, child) in map {
                        if let Some(field) = CredentialField::from_name(key) {
                            if !allowed.contains(&field) {
                                return Err(self.violation(scope, key));
                            }
                        }
                        stack.push(child);
                    }
                }
                Value::Array(items) => stack.extend(items),
                _ => {}
            }
        }
        Ok(())
    }

    /// Serialize `payload` for `scope`, refusing payloads that fail [`guard`](Self::guard).
    pub fn serialize<T: Serialize>(&self, payload: &T, scope: Scope) -> Result<String, RedactionError> {
        let value = serde_json::to_value(payload)?;
        self.guard(&value, scope)?;
        Ok(serde_json::to_string(&value)?)
    }

    fn violation(&self, scope: Scope, field: &str) -> RedactionError {
        error!(scope = %scope, field, "redaction violation: field not permitted for scope");
        RedactionError::Violation {
            scope,
            field: field.to_string(),
        }
    }
}

/// Effective tier of a serialized config entry, or `None` if `map` is not one.
///
/// An unreadable `sensitivity` tag counts as secret.
fn config_sensitivity(map: &Map<String, Value>) -> Option<Sensitivity> {
    let declared = map.get("sensitivity").map(|tag| {
        tag.as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Sensitivity::Secret)
    });
    let by_key = match (map.get("key"), map.contains_key("value")) {
        (Some(Value::String(key)), true) => Some(Sensitivity::classify(key)),
        _ => None,
    };
    declared.max(by_key)
}

/// Number of digest hex characters kept in a [`Fingerprint`].
const FINGERPRINT_HEX_LEN: usize = 8;

/// Non-reversible, fixed-length indicator of a secret value for log records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    len: usize,
    digest_prefix: String,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "len={} sha256={}", self.len, self.digest_prefix)
    }
}

/// Fingerprint a secret value.
pub fn fingerprint(value: &str) -> Fingerprint {
    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    Fingerprint {
        len: value.chars().count(),
        digest_prefix: digest[..FINGERPRINT_HEX_LEN].to_string(),
    }
}

/// Fingerprint any JSON config value.
pub fn fingerprint_value(value: &Value) -> Fingerprint {
    match value {
        Value::String(s) => fingerprint(s),
        other => fingerprint(&other.to_string()),
    }
}

//! Opaque session tokens and password login.
//!
//! Tokens are random values with their own expiry and scope. They are never
//! derived from a password and never written to the credential backend: the
//! issuer keeps only a SHA-256 digest of each live token in process memory.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::backend::StoreError;
use crate::clock::{Clock, SystemClock};
use crate::config_store::ConfigStore;
use crate::redact::{Scope, fingerprint};
use crate::secret::Secret;

const TOKEN_PREFIX: &str = "cgt_";
const TOKEN_BYTES: usize = 32;

/// Default lifetime of a session token, in minutes.
pub const DEFAULT_SESSION_TTL_MINUTES: i64 = 24 * 60;

/// Default lifetime of an elevated token, in minutes.
pub const DEFAULT_ELEVATED_TTL_MINUTES: i64 = 15;

/// Longest accepted token lifetime, in minutes (one year).
pub const MAX_TTL_MINUTES: i64 = 365 * 24 * 60;

/// Token lifetime for `minutes`, clamped to `0..=MAX_TTL_MINUTES`.
pub fn ttl_minutes(minutes: i64) -> Duration {
    Duration::try_minutes(minutes.clamp(0, MAX_TTL_MINUTES)).unwrap_or_else(Duration::zero)
}

/// Errors from token validation and password login.
///
/// Display strings never say which check failed.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unauthorized")]
    InvalidToken,

    #[error("unauthorized: session expired")]
    ExpiredToken,

    #[error("unauthorized")]
    InvalidPassword,

    #[error("password login is not configured")]
    PasswordNotConfigured,

    #[error("could not read password setting: {0}")]
    Store(#[from] StoreError),
}

/// Scope carried by an issued token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    Session,
    Elevated,
}

impl From<TokenScope> for Scope {
    fn from(scope: TokenScope) -> Self {
        match scope {
            TokenScope::Session => Scope::Session,
            TokenScope::Elevated => Scope::Elevated,
        }
    }
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Scope::from(*self), f)
    }
}

/// A freshly issued token. The raw value is only available here.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: Secret,
    pub principal: String,
    pub scope: TokenScope,
    pub expires_at: DateTime<Utc>,
}

/// What a valid token resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub principal: String,
    pub scope: TokenScope,
    pub expires_at: DateTime<Utc>,
}

fn token_digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Issues and validates opaque bearer tokens.
pub struct AuthTokenIssuer {
    tokens: RwLock<HashMap<[u8; 32], TokenClaims>>,
    clock: Arc<dyn Clock>,
    session_ttl: Duration,
    elevated_ttl: Duration,
}

impl AuthTokenIssuer {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            clock,
            session_ttl: ttl_minutes(DEFAULT_SESSION_TTL_MINUTES),
            elevated_ttl: ttl_minutes(DEFAULT_ELEVATED_TTL_MINUTES),
        }
    }

    /// Replace both lifetimes. Each is capped at [`MAX_TTL_MINUTES`].
    pub fn with_ttls(mut self, session_ttl: Duration, elevated_ttl: Duration) -> Self {
        let max = ttl_minutes(MAX_TTL_MINUTES);
        self.session_ttl = session_ttl.min(max);
        self.elevated_ttl = elevated_ttl.min(max);
        self
    }

    /// Issue a session-scope token for `principal`.
    pub fn issue(&self, principal: &str) -> IssuedToken {
        self.issue_scoped(principal, TokenScope::Session, self.session_ttl)
    }

    /// Issue an elevated token.
    ///
    /// Callers must have re-verified the password; see
    /// [`PasswordAuthenticator::elevate`].
    pub fn issue_elevated(&self, principal: &str) -> IssuedToken {
        self.issue_scoped(principal, TokenScope::Elevated, self.elevated_ttl)
    }

    fn issue_scoped(&self, principal: &str, scope: TokenScope, ttl: Duration) -> IssuedToken {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = Secret::new(format!("{TOKEN_PREFIX}{}", hex::encode(bytes)));

        let now = self.clock.now();
        let claims = TokenClaims {
            principal: principal.to_string(),
            scope,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        let mut tokens = self.tokens.write();
        let before = tokens.len();
        tokens.retain(|_, claims| claims.expires_at > now);
        let purged = before - tokens.len();
        tokens.insert(token_digest(token.expose()), claims.clone());
        drop(tokens);
        if purged > 0 {
            debug!(purged, "purged expired tokens");
        }

        info!(principal, scope = %scope, expires_at = %claims.expires_at, "issued token");
        trace!(token = %fingerprint(token.expose()), "issued token fingerprint");

        IssuedToken {
            token,
            principal: claims.principal,
            scope,
            expires_at: claims.expires_at,
        }
    }

    /// Resolve a presented token to its claims.
    pub fn validate(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let claims = self
            .tokens
            .read()
            .get(&token_digest(token))
            .cloned()
            .ok_or(AuthError::InvalidToken)?;

        if claims.expires_at <= self.clock.now() {
            debug!(principal = %claims.principal, "rejected expired token");
            return Err(AuthError::ExpiredToken);
        }
        Ok(claims)
    }

    /// Invalidate a token. Returns whether it was known.
    pub fn revoke(&self, token: &str) -> bool {
        let removed = self.tokens.write().remove(&token_digest(token));
        if let Some(claims) = &removed {
            info!(principal = %claims.principal, scope = %claims.scope, "revoked token");
        }
        removed.is_some()
    }

    /// Drop every expired token. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut tokens = self.tokens.write();
        let before = tokens.len();
        tokens.retain(|_, claims| claims.expires_at > now);
        let purged = before - tokens.len();
        if purged > 0 {
            debug!(purged, "purged expired tokens");
        }
        purged
    }

    /// Number of tokens currently held, expired or not.
    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

impl Default for AuthTokenIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AuthTokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthTokenIssuer")
            .field("live_tokens", &self.len())
            .field("session_ttl", &self.session_ttl)
            .field("elevated_ttl", &self.elevated_ttl)
            .finish()
    }
}

/// Which password a login is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordKind {
    /// Operator panel.
    Panel,
    /// Programmatic API access.
    Api,
}

impl PasswordKind {
    pub fn config_key(&self) -> &'static str {
        match self {
            Self::Panel => "panel_password",
            Self::Api => "api_password",
        }
    }

    /// Principal name used for tokens issued after a login of this kind.
    pub fn principal(&self) -> &'static str {
        match self {
            Self::Panel => "panel",
            Self::Api => "api",
        }
    }
}

/// Password values taken from the process environment.
#[derive(Debug, Clone, Default)]
pub struct PasswordEnv {
    pub panel_password: Option<Secret>,
    pub api_password: Option<Secret>,
    pub password: Option<Secret>,
}

impl PasswordEnv {
    /// Read `PANEL_PASSWORD`, `API_PASSWORD` and `PASSWORD`.
    pub fn from_env() -> Self {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .map(Secret::new)
        };
        Self {
            panel_password: read("PANEL_PASSWORD"),
            api_password: read("API_PASSWORD"),
            password: read("PASSWORD"),
        }
    }
}

/// Resolve the password for `kind`.
///
/// Order: the config entry, then the kind-specific env var, then `PASSWORD`.
pub async fn resolve_password(
    config: &ConfigStore,
    env: &PasswordEnv,
    kind: PasswordKind,
) -> Result<Option<Secret>, StoreError> {
    match config.get(kind.config_key()).await {
        Ok(entry) => {
            if let Some(value) = entry.value.as_str().filter(|v| !v.is_empty()) {
                return Ok(Some(Secret::new(value)));
            }
        }
        Err(StoreError::NotFound { .. }) => {}
        Err(e) => return Err(e),
    }

    let specific = match kind {
        PasswordKind::Panel => &env.panel_password,
        PasswordKind::Api => &env.api_password,
    };
    Ok(specific.clone().or_else(|| env.password.clone()))
}

fn digests_match(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Exchanges a password for tokens.
pub struct PasswordAuthenticator {
    issuer: Arc<AuthTokenIssuer>,
    kind: PasswordKind,
    password_digest: Option<[u8; 32]>,
}

impl PasswordAuthenticator {
    /// Build an authenticator for a known password, or `None` to refuse all logins.
    pub fn new(issuer: Arc<AuthTokenIssuer>, kind: PasswordKind, password: Option<Secret>) -> Self {
        if password.is_none() {
            warn!(kind = kind.principal(), "no password configured, login disabled");
        }
        Self {
            issuer,
            kind,
            password_digest: password.map(|p| token_digest(p.expose())),
        }
    }

    /// Resolve the password from config and environment, then build.
    pub async fn resolve(
        issuer: Arc<AuthTokenIssuer>,
        kind: PasswordKind,
        config: &ConfigStore,
        env: &PasswordEnv,
    ) -> Result<Self, StoreError> {
        let password = resolve_password(config, env, kind).await?;
        Ok(Self::new(issuer, kind, password))
    }

    fn check(&self, password: &str) -> Result<(), AuthError> {
        let expected = self
            .password_digest
            .as_ref()
            .ok_or(AuthError::PasswordNotConfigured)?;
        if digests_match(expected, &token_digest(password)) {
            Ok(())
        } else {
            warn!(kind = self.kind.principal(), "rejected login with wrong password");
            Err(AuthError::InvalidPassword)
        }
    }

    /// Verify `password` and issue a session token.
    pub fn login(&self, password: &str) -> Result<IssuedToken, AuthError> {
        self.check(password)?;
        Ok(self.issuer.issue(self.kind.principal()))
    }

    /// Exchange a valid token plus the password for an elevated token.
    pub fn elevate(&self, session_token: &str, password: &str) -> Result<IssuedToken, AuthError> {
        let claims = self.issuer.validate(session_token)?;
        self.check(password)?;
        Ok(self.issuer.issue_elevated(&claims.principal))
    }

    pub fn issuer(&self) -> &Arc<AuthTokenIssuer> {
        &self.issuer
    }
}

impl fmt::Debug for PasswordAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordAuthenticator")
            .field("kind", &self.kind)
            .field("configured", &self.password_digest.is_some())
            .finish()
    }
}

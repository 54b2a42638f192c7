//! Top-level error types for credgate.

use thiserror::Error;

use crate::auth::AuthError;
use crate::backend::StoreError;
use crate::config::ConfigError;
use crate::redact::RedactionError;

/// Top-level error type encompassing all credgate errors.
#[derive(Debug, Error)]
pub enum CredgateError {
    /// Error from a backend or store operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Authentication failure.
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// A response was blocked at the redaction boundary.
    #[error("redaction error: {0}")]
    Redaction(#[from] RedactionError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl CredgateError {
    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Auth(AuthError::Store(e)) => e.is_retryable(),
            _ => false,
        }
    }

    /// Text safe to return to an external caller.
    ///
    /// Auth and redaction failures collapse to fixed strings; backend detail
    /// stays in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Auth(AuthError::PasswordNotConfigured) => "login is not available",
            Self::Auth(AuthError::Store(_)) => "temporarily unavailable, retry later",
            Self::Auth(_) => "unauthorized",
            Self::Redaction(_) => "internal error",
            Self::Store(StoreError::NotFound { .. }) => "not found",
            Self::Store(StoreError::Conflict { .. }) => "conflict",
            Self::Store(StoreError::Validation(_)) => "invalid request",
            Self::Store(e) if e.is_retryable() => "temporarily unavailable, retry later",
            Self::Store(_) | Self::Config(_) => "internal error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::redact::Scope;

    #[test]
    fn test_retryable_distinguished_from_permanent() {
        let timeout: CredgateError = StoreError::Timeout {
            backend: BackendKind::KeyValue,
            operation: "get_credential",
        }
        .into();
        assert!(timeout.is_retryable());
        assert_eq!(timeout.public_message(), "temporarily unavailable, retry later");

        let missing: CredgateError = StoreError::config_not_found("x").into();
        assert!(!missing.is_retryable());
        assert_eq!(missing.public_message(), "not found");
    }

    #[test]
    fn test_redaction_message_does_not_leak() {
        let err: CredgateError = RedactionError::Violation {
            scope: Scope::Session,
            field: "refresh_token".to_string(),
        }
        .into();
        assert_eq!(err.public_message(), "internal error");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_auth_never_retryable() {
        let err: CredgateError = AuthError::ExpiredToken.into();
        assert!(!err.is_retryable());
        assert_eq!(err.public_message(), "unauthorized");
    }
}

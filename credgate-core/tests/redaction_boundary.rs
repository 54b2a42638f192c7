//! Integration tests for the redaction boundary: stored records read back
//! through the stores and rendered for each caller scope.

use std::sync::Arc;

use credgate_core::redact::CredentialField;
use credgate_core::{
    AuthTokenIssuer, BackendHandle, ConfigStore, Credential, CredentialStore, MemoryBackend,
    PasswordAuthenticator, PasswordKind, Provider, RedactionError, RedactionLayer, Scope, Secret,
    Sensitivity,
};
use serde_json::json;

const SECRET_VALUES: [&str; 4] = [
    "1//0refresh-value",
    "GOCSPX-client-secret",
    "ya29.access-value",
    "panel-password-value",
];

fn stores() -> (CredentialStore, ConfigStore) {
    let handle = BackendHandle::new(Arc::new(MemoryBackend::new()));
    (CredentialStore::new(handle.clone()), ConfigStore::new(handle))
}

async fn seeded() -> (CredentialStore, ConfigStore) {
    let (credentials, config) = stores();
    credentials
        .put(
            &Credential::new(
                "cred-1",
                Provider::GeminiCli,
                SECRET_VALUES[0],
                "client.apps.example.com",
                SECRET_VALUES[1],
            )
            .with_access_token(SECRET_VALUES[2], chrono::Utc::now())
            .with_metadata("user_email", "someone@example.com"),
        )
        .await
        .unwrap();
    config
        .set("panel_password", json!(SECRET_VALUES[3]), Sensitivity::Public)
        .await
        .unwrap();
    config
        .set("calls_per_rotation", json!(25), Sensitivity::Public)
        .await
        .unwrap();
    (credentials, config)
}

#[tokio::test]
async fn test_secret_fields_only_visible_when_elevated() {
    let (credentials, _) = seeded().await;
    let layer = RedactionLayer::new();
    let stored = credentials.list().await.unwrap();

    for scope in [Scope::Unauthenticated, Scope::Session, Scope::Elevated] {
        for view in layer.credentials(&stored, scope).unwrap() {
            let has_secrets = view.contains(CredentialField::RefreshToken)
                || view.contains(CredentialField::ClientSecret);
            assert_eq!(has_secrets, scope == Scope::Elevated, "scope {scope}");
        }
    }
}

#[tokio::test]
async fn test_session_body_contains_no_secret_values() {
    let (credentials, config) = seeded().await;
    let layer = RedactionLayer::new();

    let creds = layer
        .credentials(&credentials.list().await.unwrap(), Scope::Session)
        .unwrap();
    let entries = layer.config_entries(&config.list().await.unwrap(), Scope::Session);
    let body = layer
        .serialize(&json!({ "credentials": creds, "config": entries }), Scope::Session)
        .unwrap();

    for secret in SECRET_VALUES {
        assert!(!body.contains(secret), "session body leaked a secret");
    }
    assert!(body.contains("cred-1"));
    assert!(body.contains("calls_per_rotation"));
}

#[tokio::test]
async fn test_elevated_export_includes_everything() {
    let (credentials, config) = seeded().await;
    let layer = RedactionLayer::new();

    let creds = layer
        .credentials(&credentials.list().await.unwrap(), Scope::Elevated)
        .unwrap();
    let entries = layer.config_entries(&config.list().await.unwrap(), Scope::Elevated);
    let body = layer
        .serialize(&json!({ "credentials": creds, "config": entries }), Scope::Elevated)
        .unwrap();

    for secret in SECRET_VALUES {
        assert!(body.contains(secret));
    }
}

#[tokio::test]
async fn test_unauthenticated_sees_nothing() {
    let (credentials, config) = seeded().await;
    let layer = RedactionLayer::new();

    let creds = layer
        .credentials(&credentials.list().await.unwrap(), Scope::Unauthenticated)
        .unwrap();
    assert!(creds.iter().all(|c| c.field_names().count() == 0));
    assert!(layer
        .config_entries(&config.list().await.unwrap(), Scope::Unauthenticated)
        .is_empty());
}

#[tokio::test]
async fn test_raw_credential_at_session_boundary_is_an_error() {
    let (credentials, _) = seeded().await;
    let layer = RedactionLayer::new();
    let raw = credentials.list().await.unwrap();

    // Bypassing the view builder must not silently pass.
    let result = layer.serialize(&raw, Scope::Session);
    assert!(matches!(result, Err(RedactionError::Violation { .. })));
}

#[tokio::test]
async fn test_raw_secret_config_at_session_boundary_is_an_error() {
    let (_, config) = seeded().await;
    let layer = RedactionLayer::new();
    let raw = config.list().await.unwrap();

    let result = layer.serialize(&json!({ "config": raw }), Scope::Session);
    assert!(matches!(result, Err(RedactionError::Violation { .. })));

    let body = layer.serialize(&raw, Scope::Elevated).unwrap();
    assert!(body.contains(SECRET_VALUES[3]));
}

#[tokio::test]
async fn test_token_scope_drives_visibility() {
    let (credentials, config) = seeded().await;
    let issuer = Arc::new(AuthTokenIssuer::new());
    let auth = PasswordAuthenticator::resolve(
        issuer.clone(),
        PasswordKind::Panel,
        &config,
        &Default::default(),
    )
    .await
    .unwrap();

    let session = auth.login(SECRET_VALUES[3]).unwrap();
    let claims = issuer.validate(session.token.expose()).unwrap();
    let layer = RedactionLayer::new();
    let stored = credentials.list().await.unwrap();

    let view = layer.credential(&stored[0], claims.scope.into()).unwrap();
    assert!(!view.contains(CredentialField::RefreshToken));

    let elevated = auth.elevate(session.token.expose(), SECRET_VALUES[3]).unwrap();
    let claims = issuer.validate(elevated.token.expose()).unwrap();
    let view = layer.credential(&stored[0], claims.scope.into()).unwrap();
    assert!(view.contains(CredentialField::RefreshToken));
    assert_ne!(elevated.token, Secret::new(SECRET_VALUES[3]));
}

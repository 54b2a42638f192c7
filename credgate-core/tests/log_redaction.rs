//! Log records produced at the most verbose level must never carry secret
//! values, only their fingerprints.

use std::io;
use std::sync::Arc;

use credgate_core::{
    AuthTokenIssuer, BackendHandle, ConfigStore, Credential, CredentialStore, FileBackend,
    PasswordAuthenticator, PasswordKind, Provider, RedactionLayer, Scope, Secret, Sensitivity,
};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;

const REFRESH: &str = "1//0gLogCaptureRefreshToken";
const CLIENT_SECRET: &str = "GOCSPX-LogCaptureClientSecret";
const ACCESS: &str = "ya29.LogCaptureAccessToken";
const PANEL_PASSWORD: &str = "log-capture-panel-password";

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[tokio::test]
async fn test_no_secret_reaches_trace_logs() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(logs.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let temp_dir = TempDir::new().unwrap();
    let backend = FileBackend::open(temp_dir.path()).await.unwrap();
    let handle = BackendHandle::new(Arc::new(backend));
    let credentials = CredentialStore::new(handle.clone());
    let config = ConfigStore::new(handle);

    let credential = Credential::new("cred-log", Provider::Antigravity, REFRESH, "client", CLIENT_SECRET)
        .with_access_token(ACCESS, chrono::Utc::now());
    credentials.put(&credential).await.unwrap();
    let mut duplicate = credential.clone();
    duplicate.id = "cred-dup".into();
    assert!(credentials.put(&duplicate).await.is_err());
    credentials.get(&credential.id).await.unwrap();

    config
        .set("panel_password", json!(PANEL_PASSWORD), Sensitivity::Public)
        .await
        .unwrap();
    config.get("panel_password").await.unwrap();

    let issuer = Arc::new(AuthTokenIssuer::new());
    let auth = PasswordAuthenticator::resolve(issuer, PasswordKind::Panel, &config, &Default::default())
        .await
        .unwrap();
    let session = auth.login(PANEL_PASSWORD).unwrap();
    assert!(auth.login("wrong").is_err());

    let layer = RedactionLayer::new();
    let raw = serde_json::to_value(&credential).unwrap();
    assert!(layer.guard(&raw, Scope::Session).is_err());

    let output = logs.contents();
    assert!(!output.is_empty(), "expected log output to be captured");
    for secret in [REFRESH, CLIENT_SECRET, ACCESS, PANEL_PASSWORD, session.token.expose()] {
        assert!(!output.contains(secret), "secret value found in log output");
    }
    assert!(output.contains("sha256="), "expected fingerprints at trace level");
    assert_ne!(session.token, Secret::new(PANEL_PASSWORD));
}

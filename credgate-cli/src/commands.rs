//! Command implementations.
//!
//! Every value printed by the CLI is built here and passes through the
//! redaction layer before it is serialized.

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use credgate_core::{
    AuthTokenIssuer, BackendConnector, BackendEnv, BackendKind, BackendSelector, ConfigStore,
    CredentialId, CredentialStore, CredgateConfig, CredgateError, MigrationReport,
    PasswordAuthenticator, PasswordEnv, PasswordKind, ProbeOutcome, ProviderCounts,
    RedactedConfigEntry, RedactedCredential, RedactionLayer, Scope, Sensitivity, StoreError,
    migrate, resolve_password,
};

/// Diagnostic view of the active backend. Never includes connection strings.
#[derive(Debug, Serialize)]
pub struct StatusView {
    pub backend: BackendKind,
    pub healthy: bool,
    pub probes: Vec<ProbeView>,
    pub credentials: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_provider: BTreeMap<String, ProviderCounts>,
}

#[derive(Debug, Serialize)]
pub struct ProbeView {
    pub backend: BackendKind,
    pub outcome: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ExportView {
    pub credentials: Vec<RedactedCredential>,
    pub config: Vec<RedactedConfigEntry>,
}

/// Wired-up core components for one CLI invocation.
pub struct App {
    env: BackendEnv,
    selector: BackendSelector,
    connector: Arc<dyn BackendConnector>,
    credentials: CredentialStore,
    config: ConfigStore,
    passwords: PasswordEnv,
    issuer: Arc<AuthTokenIssuer>,
    layer: RedactionLayer,
}

impl App {
    /// Select the active backend and bind the stores to it.
    pub async fn start(
        settings: &CredgateConfig,
        env: BackendEnv,
        passwords: PasswordEnv,
        connector: Arc<dyn BackendConnector>,
    ) -> Result<Self> {
        let selector = BackendSelector::new(env.clone(), connector.clone());
        let handle = selector
            .select()
            .await
            .context("no usable storage backend")?;

        let credentials =
            CredentialStore::new(handle.clone()).with_write_backoff(settings.write_retry_backoff());
        let config = ConfigStore::new(handle).with_write_backoff(settings.write_retry_backoff());
        let issuer = Arc::new(
            AuthTokenIssuer::new().with_ttls(settings.session_ttl(), settings.elevated_ttl()),
        );

        Ok(Self {
            env,
            selector,
            connector,
            credentials,
            config,
            passwords,
            issuer,
            layer: RedactionLayer::new(),
        })
    }

    /// Scope granted for this invocation.
    ///
    /// Local reads get session scope. A password upgrades to elevated scope
    /// through a login followed by a re-authenticated elevation.
    pub async fn scope(&self, password: Option<&str>) -> Result<Scope> {
        let Some(password) = password else {
            return Ok(Scope::Session);
        };

        let auth = PasswordAuthenticator::resolve(
            self.issuer.clone(),
            PasswordKind::Panel,
            &self.config,
            &self.passwords,
        )
        .await?;

        let session = auth.login(password).map_err(public)?;
        let elevated = auth
            .elevate(session.token.expose(), password)
            .map_err(public)?;
        self.issuer.revoke(session.token.expose());

        let claims = self
            .issuer
            .validate(elevated.token.expose())
            .map_err(public)?;
        debug!(principal = %claims.principal, scope = %claims.scope, "authenticated");
        Ok(claims.scope.into())
    }

    pub async fn status(&self) -> Result<StatusView> {
        let report = self
            .selector
            .last_report()
            .ok_or_else(|| anyhow!("backend selection has not run"))?;
        let probes = report
            .attempts
            .iter()
            .map(|a| ProbeView {
                backend: a.kind,
                outcome: match a.outcome {
                    ProbeOutcome::Skipped => "skipped",
                    ProbeOutcome::Failed(_) => "failed",
                    ProbeOutcome::Connected => "connected",
                },
            })
            .collect();

        Ok(StatusView {
            backend: self.credentials.backend_kind(),
            healthy: self.credentials.health_check().await,
            probes,
            credentials: self.credentials.count().await?,
            by_status: self.credentials.count_by_status().await?,
            by_provider: self.credentials.count_by_provider().await?,
        })
    }

    pub async fn list(&self, scope: Scope) -> Result<String> {
        let mut credentials = self.credentials.list().await?;
        credentials.sort_by(|a, b| a.id.cmp(&b.id));
        let views = self.layer.credentials(&credentials, scope)?;
        Ok(self.layer.serialize(&views, scope)?)
    }

    pub async fn export(&self, scope: Scope) -> Result<String> {
        if scope != Scope::Elevated {
            bail!("export requires --password");
        }
        let mut credentials = self.credentials.list().await?;
        credentials.sort_by(|a, b| a.id.cmp(&b.id));
        let view = ExportView {
            credentials: self.layer.credentials(&credentials, scope)?,
            config: self
                .layer
                .config_entries(&self.config.list().await?, scope),
        };
        info!(credentials = view.credentials.len(), "exported credentials");
        Ok(self.layer.serialize(&view, scope)?)
    }

    pub async fn delete(&self, id: &str, scope: Scope) -> Result<()> {
        require_elevated(scope, "delete")?;
        self.credentials
            .delete(&CredentialId::new(id))
            .await
            .with_context(|| format!("failed to delete credential {id}"))
    }

    pub async fn config_get(&self, key: &str, scope: Scope) -> Result<String> {
        let entry = self.config.get(key).await?;
        let view = self
            .layer
            .config_entry(&entry, scope)
            .ok_or_else(|| anyhow!("{key} is a secret setting; re-run with --password"))?;
        Ok(self.layer.serialize(&view, scope)?)
    }

    /// Write a config entry.
    ///
    /// Writing a secret entry, or overwriting one, needs elevated scope. The
    /// one exception is setting the panel password while none is configured.
    pub async fn config_set(
        &self,
        key: &str,
        raw: &str,
        sensitivity: Sensitivity,
        scope: Scope,
    ) -> Result<()> {
        if scope == Scope::Unauthenticated {
            bail!("unauthorized");
        }
        let existing = match self.config.get(key).await {
            Ok(entry) => entry.sensitivity,
            Err(StoreError::NotFound { .. }) => Sensitivity::Public,
            Err(e) => return Err(e.into()),
        };
        let tier = Sensitivity::classify(key).max(sensitivity).max(existing);
        if tier == Sensitivity::Secret && scope != Scope::Elevated && !self.bootstrapping(key).await? {
            bail!("{key} is a secret setting; re-run with --password");
        }
        self.config.set(key, parse_value(raw), sensitivity).await?;
        Ok(())
    }

    /// True when `key` is the panel password and no password is configured yet.
    async fn bootstrapping(&self, key: &str) -> Result<bool> {
        let kind = PasswordKind::Panel;
        if key != kind.config_key() {
            return Ok(false);
        }
        Ok(resolve_password(&self.config, &self.passwords, kind)
            .await?
            .is_none())
    }

    pub async fn config_list(&self, scope: Scope) -> Result<String> {
        let entries = self.config.list().await?;
        let views = self.layer.config_entries(&entries, scope);
        Ok(self.layer.serialize(&views, scope)?)
    }

    pub async fn config_delete(&self, key: &str, scope: Scope) -> Result<()> {
        require_elevated(scope, "config delete")?;
        self.config.delete(key).await?;
        Ok(())
    }

    /// Copy everything from the active backend into `to`.
    pub async fn migrate(&self, to: BackendKind, dest_data_dir: Option<PathBuf>) -> Result<MigrationReport> {
        let source = self.credentials.backend();
        if to == source.kind() && dest_data_dir.is_none() {
            bail!("destination is the active backend; pass --dest-data-dir to copy between files");
        }

        let mut env = self.env.clone();
        if let Some(dir) = dest_data_dir {
            env.data_dir = dir;
        }
        let destination = self
            .connector
            .connect(to, &env)
            .await
            .with_context(|| format!("cannot connect to {to} backend"))?;

        Ok(migrate(source.as_ref(), destination.as_ref()).await?)
    }
}

/// Map a core error to its caller-safe message.
fn public(e: impl Into<CredgateError>) -> anyhow::Error {
    let e = e.into();
    debug!(error = %e, "request rejected");
    anyhow!(e.public_message())
}

fn require_elevated(scope: Scope, command: &str) -> Result<()> {
    if scope != Scope::Elevated {
        bail!("{command} requires --password");
    }
    Ok(())
}

/// Interpret a command-line value as JSON, falling back to a plain string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

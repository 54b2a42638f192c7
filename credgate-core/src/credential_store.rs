//! Typed credential access over the active backend.

use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::backend::{Backend, BackendKind, BatchOutcome, StoreError};
use crate::model::{Credential, CredentialId, CredentialStatus, Metadata, Provider};
use crate::selector::BackendHandle;

/// Default pause before the single write retry.
pub const DEFAULT_WRITE_BACKOFF: Duration = Duration::from_millis(200);

/// Run a write, retrying once after `backoff` if the backend rejected it.
pub(crate) async fn retry_write<T, F, Fut>(
    operation: &'static str,
    backoff: Duration,
    mut write: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    match write().await {
        Err(e @ StoreError::Write { .. }) => {
            warn!(operation, error = %e, "write rejected, retrying once");
            tokio::time::sleep(backoff).await;
            write().await
        }
        other => other,
    }
}

/// Partial change to a credential's mutable state.
///
/// Metadata keys are merged into the stored metadata; keys not named here
/// keep their stored values.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub status: Option<CredentialStatus>,
    pub metadata: Metadata,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: CredentialStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    fn apply(&self, credential: &mut Credential) {
        if let Some(status) = self.status {
            credential.status = status;
        }
        for (key, value) in self.metadata.iter() {
            credential.metadata.insert(key, value);
        }
    }
}

/// Credential totals for one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProviderCounts {
    pub total: usize,
    pub active: usize,
}

/// Credential CRUD delegated to whichever backend is active.
///
/// Holds no data of its own; every call reads through to the backend.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    handle: BackendHandle,
    write_backoff: Duration,
}

impl CredentialStore {
    pub fn new(handle: BackendHandle) -> Self {
        Self {
            handle,
            write_backoff: DEFAULT_WRITE_BACKOFF,
        }
    }

    pub fn with_write_backoff(mut self, backoff: Duration) -> Self {
        self.write_backoff = backoff;
        self
    }

    /// Variant currently serving requests.
    pub fn backend_kind(&self) -> BackendKind {
        self.handle.kind()
    }

    pub async fn get(&self, id: &CredentialId) -> Result<Credential, StoreError> {
        self.handle.current().get_credential(id).await
    }

    pub async fn list(&self) -> Result<Vec<Credential>, StoreError> {
        self.handle.current().list_credentials().await
    }

    /// Credentials belonging to one upstream provider.
    pub async fn list_by_provider(&self, provider: Provider) -> Result<Vec<Credential>, StoreError> {
        let mut credentials = self.list().await?;
        credentials.retain(|c| c.provider == provider);
        Ok(credentials)
    }

    /// Validate and store a credential.
    pub async fn put(&self, credential: &Credential) -> Result<(), StoreError> {
        credential.validate()?;
        let backend = self.handle.current();

        trace!(
            credential_id = %credential.id,
            refresh_token = %credential.refresh_token.fingerprint(),
            client_secret = %credential.client_secret.fingerprint(),
            "storing credential"
        );

        retry_write("put_credential", self.write_backoff, || {
            backend.put_credential(credential)
        })
        .await?;

        debug!(credential_id = %credential.id, backend = %backend.kind(), "credential stored");
        Ok(())
    }

    /// Store many credentials, reporting per-id failures.
    ///
    /// Invalid credentials are reported as failures without reaching the
    /// backend.
    pub async fn batch_put(&self, credentials: &[Credential]) -> Result<BatchOutcome, StoreError> {
        let backend = self.handle.current();
        let mut invalid = Vec::new();
        let mut valid = Vec::with_capacity(credentials.len());
        for credential in credentials {
            match credential.validate() {
                Ok(()) => valid.push(credential.clone()),
                Err(e) => invalid.push((credential.id.clone(), StoreError::from(e))),
            }
        }

        let mut outcome = backend.batch_put_credentials(&valid).await?;
        outcome.failed.extend(invalid);

        debug!(
            backend = %backend.kind(),
            written = outcome.written,
            failed = outcome.failed.len(),
            "batch write complete"
        );
        Ok(outcome)
    }

    pub async fn delete(&self, id: &CredentialId) -> Result<(), StoreError> {
        let backend = self.handle.current();
        retry_write("delete_credential", self.write_backoff, || {
            backend.delete_credential(id)
        })
        .await?;
        debug!(credential_id = %id, "credential deleted");
        Ok(())
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.list().await?.len())
    }

    pub async fn count_by_status(&self) -> Result<BTreeMap<String, usize>, StoreError> {
        let mut counts = BTreeMap::new();
        for credential in self.list().await? {
            *counts.entry(credential.status.to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Total and active credentials per provider, keyed by provider name.
    ///
    /// Every provider appears, including those with no credentials.
    pub async fn count_by_provider(&self) -> Result<BTreeMap<String, ProviderCounts>, StoreError> {
        let mut counts: BTreeMap<String, ProviderCounts> = Provider::ALL
            .iter()
            .map(|p| (p.to_string(), ProviderCounts::default()))
            .collect();
        for credential in self.list().await? {
            let entry = counts.entry(credential.provider.to_string()).or_default();
            entry.total += 1;
            if credential.status == CredentialStatus::Active {
                entry.active += 1;
            }
        }
        Ok(counts)
    }

    /// Apply a partial state change to a stored credential.
    ///
    /// Secrets and identity fields are left as stored.
    pub async fn update_state(
        &self,
        id: &CredentialId,
        update: &StateUpdate,
    ) -> Result<Credential, StoreError> {
        let mut credential = self.get(id).await?;
        update.apply(&mut credential);
        self.put(&credential).await?;
        debug!(
            credential_id = %id,
            status = %credential.status,
            metadata_keys = update.metadata.len(),
            "credential state updated"
        );
        Ok(credential)
    }

    /// Change only the status of a stored credential.
    pub async fn set_status(
        &self,
        id: &CredentialId,
        status: CredentialStatus,
    ) -> Result<(), StoreError> {
        self.update_state(id, &StateUpdate::new().status(status)).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> bool {
        self.handle.current().health_check().await
    }

    /// The backend snapshot this store would use right now.
    pub fn backend(&self) -> std::sync::Arc<dyn Backend> {
        self.handle.current()
    }
}

//! Offline copy of every credential and config entry between backends.
//!
//! Migration is not all-or-nothing: each record that fails to write is
//! counted and named in the [`MigrationReport`] and the rest still go through.

use serde::Serialize;
use tracing::{info, warn};

use crate::backend::{Backend, BackendKind, StoreError};

/// A record that could not be written to the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationFailure {
    pub key: String,
    pub reason: String,
}

/// Per-item outcome of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub source: BackendKind,
    pub destination: BackendKind,
    pub credentials_read: usize,
    pub credentials_written: usize,
    pub credential_failures: Vec<MigrationFailure>,
    pub config_read: usize,
    pub config_written: usize,
    pub config_failures: Vec<MigrationFailure>,
}

impl MigrationReport {
    pub fn failure_count(&self) -> usize {
        self.credential_failures.len() + self.config_failures.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failure_count() == 0
    }
}

/// Copy all records from `source` to `destination`.
///
/// Fails only if `source` cannot be read. Write failures on the destination
/// are reported per item.
pub async fn migrate(
    source: &dyn Backend,
    destination: &dyn Backend,
) -> Result<MigrationReport, StoreError> {
    info!(
        source = %source.kind(),
        destination = %destination.kind(),
        "starting migration"
    );

    let credentials = source.list_credentials().await?;
    let config = source.list_config().await?;

    let outcome = destination.batch_put_credentials(&credentials).await?;
    let credential_failures: Vec<MigrationFailure> = outcome
        .failed
        .into_iter()
        .map(|(id, e)| {
            warn!(credential_id = %id, error = %e, "credential not migrated");
            MigrationFailure {
                key: id.to_string(),
                reason: e.to_string(),
            }
        })
        .collect();

    let mut config_written = 0;
    let mut config_failures = Vec::new();
    for entry in &config {
        match destination.set_config(entry).await {
            Ok(()) => config_written += 1,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "config entry not migrated");
                config_failures.push(MigrationFailure {
                    key: entry.key.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    let report = MigrationReport {
        source: source.kind(),
        destination: destination.kind(),
        credentials_read: credentials.len(),
        credentials_written: outcome.written,
        credential_failures,
        config_read: config.len(),
        config_written,
        config_failures,
    };

    info!(
        credentials_written = report.credentials_written,
        config_written = report.config_written,
        failures = report.failure_count(),
        "migration finished"
    );
    Ok(report)
}

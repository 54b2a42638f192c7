//! Row mapping and error translation shared by the SQL drivers.

use chrono::{DateTime, SecondsFormat, Utc};

use super::{BackendKind, StoreError};
use crate::model::{ConfigEntry, Credential, Metadata, Sensitivity};
use crate::secret::Secret;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CredentialRow {
    pub id: String,
    pub provider: String,
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
    pub expiry: Option<String>,
    pub status: String,
    pub metadata: String,
}

impl TryFrom<CredentialRow> for Credential {
    type Error = StoreError;

    fn try_from(row: CredentialRow) -> Result<Self, Self::Error> {
        let corrupt = |e: crate::model::ParseError| StoreError::Corrupt {
            message: format!("credential {}: {e}", row.id),
        };
        let provider = row.provider.parse().map_err(corrupt)?;
        let status = row.status.parse().map_err(corrupt)?;
        let metadata: Metadata = serde_json::from_str(&row.metadata)?;
        let expiry = row.expiry.as_deref().map(decode_timestamp).transpose()?;
        Ok(Credential {
            id: row.id.into(),
            provider,
            access_token: Secret::new(row.access_token),
            refresh_token: Secret::new(row.refresh_token),
            client_id: row.client_id,
            client_secret: Secret::new(row.client_secret),
            expiry,
            status,
            metadata,
        })
    }
}

/// Timestamps are stored as RFC 3339 text with nanosecond precision, which
/// neither engine's native timestamp type keeps.
pub(crate) fn encode_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            message: format!("timestamp '{raw}': {e}"),
        })
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ConfigRow {
    pub key: String,
    pub value: String,
    pub sensitivity: String,
}

impl TryFrom<ConfigRow> for ConfigEntry {
    type Error = StoreError;

    fn try_from(row: ConfigRow) -> Result<Self, Self::Error> {
        let sensitivity: Sensitivity = row.sensitivity.parse().map_err(|e| StoreError::Corrupt {
            message: format!("config {}: {e}", row.key),
        })?;
        let value = serde_json::from_str(&row.value)?;
        Ok(ConfigEntry::new(row.key, value).with_sensitivity(sensitivity))
    }
}

/// Translate a sqlx error raised by a read.
pub(crate) fn read_error(backend: BackendKind, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut => StoreError::PoolExhausted { backend },
        sqlx::Error::Decode(e) | sqlx::Error::ColumnDecode { source: e, .. } => {
            StoreError::Corrupt {
                message: e.to_string(),
            }
        }
        other => StoreError::connection(backend, other),
    }
}

/// Translate a sqlx error raised by a write.
pub(crate) fn write_error(backend: BackendKind, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut => StoreError::PoolExhausted { backend },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::connection(backend, err),
        other => StoreError::write(backend, other),
    }
}

/// Whether a database error is a unique-constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_timestamp_keeps_nanoseconds() {
        let at = Utc
            .with_ymd_and_hms(2025, 3, 1, 12, 0, 0)
            .unwrap()
            .with_nanosecond(123_456_789)
            .unwrap();
        let encoded = encode_timestamp(at);
        assert_eq!(encoded, "2025-03-01T12:00:00.123456789Z");
        assert_eq!(decode_timestamp(&encoded).unwrap(), at);
    }

    #[test]
    fn test_legacy_offset_timestamp_decodes() {
        let at = decode_timestamp("2025-03-01T12:00:00.5+00:00").unwrap();
        assert_eq!(at.timestamp_subsec_millis(), 500);
        assert!(decode_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_config_row_cannot_lower_key_tier() {
        let row = ConfigRow {
            key: "panel_password".to_string(),
            value: "\"pw\"".to_string(),
            sensitivity: "public".to_string(),
        };
        let entry = ConfigEntry::try_from(row).unwrap();
        assert!(entry.is_secret());
    }
}

//! Process settings loaded from `credgate.toml`.
//!
//! Backend connection parameters are not read from here; they come from the
//! environment through [`BackendEnv`](crate::selector::BackendEnv).

use chrono::Duration as ChronoDuration;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::auth::{
    DEFAULT_ELEVATED_TTL_MINUTES, DEFAULT_SESSION_TTL_MINUTES, MAX_TTL_MINUTES, ttl_minutes,
};
use crate::selector::DEFAULT_DATA_DIR;

pub const CONFIG_FILE_NAME: &str = "credgate.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {message}")]
    Invalid { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredgateConfig {
    /// Directory holding the File backend database.
    pub data_dir: PathBuf,

    /// Default tracing filter, overridden by `RUST_LOG`.
    pub log_level: String,

    pub session_ttl_minutes: i64,

    pub elevated_ttl_minutes: i64,

    /// Upper bound for one operation on the relational, document and file backends.
    pub operation_timeout_secs: u64,

    /// Pause before retrying a rejected write.
    pub write_retry_backoff_ms: u64,

    /// File this configuration was loaded from, if any.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Default for CredgateConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            log_level: "info".to_string(),
            session_ttl_minutes: DEFAULT_SESSION_TTL_MINUTES,
            elevated_ttl_minutes: DEFAULT_ELEVATED_TTL_MINUTES,
            operation_timeout_secs: 30,
            write_retry_backoff_ms: 200,
            config_path: None,
        }
    }
}

impl CredgateConfig {
    /// Load from the platform config directory, or defaults if no file exists.
    pub fn load() -> Result<Self, ConfigError> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                debug!("no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        config.config_path = Some(path.to_path_buf());
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };
        if self.session_ttl_minutes <= 0 {
            return invalid("session_ttl_minutes must be positive");
        }
        if self.elevated_ttl_minutes <= 0 {
            return invalid("elevated_ttl_minutes must be positive");
        }
        if self.session_ttl_minutes > MAX_TTL_MINUTES {
            return invalid("session_ttl_minutes cannot exceed one year");
        }
        if self.elevated_ttl_minutes > self.session_ttl_minutes {
            return invalid("elevated_ttl_minutes cannot exceed session_ttl_minutes");
        }
        if self.operation_timeout_secs == 0 {
            return invalid("operation_timeout_secs must be greater than 0");
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> ChronoDuration {
        ttl_minutes(self.session_ttl_minutes)
    }

    pub fn elevated_ttl(&self) -> ChronoDuration {
        ttl_minutes(self.elevated_ttl_minutes)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn write_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.write_retry_backoff_ms)
    }
}

/// `credgate.toml` in the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join(CONFIG_FILE_NAME))
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "credgate", "credgate")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = CredgateConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("credgate-data"));
        assert_eq!(config.session_ttl_minutes, 1440);
        assert_eq!(config.elevated_ttl_minutes, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = CredgateConfig::parse("log_level = \"debug\"\n").unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.operation_timeout_secs, 30);
    }

    #[test]
    fn test_rejects_elevated_longer_than_session() {
        let result = CredgateConfig::parse("session_ttl_minutes = 10\nelevated_ttl_minutes = 20\n");
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_rejects_ttl_beyond_one_year() {
        let result = CredgateConfig::parse(
            "session_ttl_minutes = 9223372036854775807\nelevated_ttl_minutes = 15\n",
        );
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));

        let config = CredgateConfig::parse("session_ttl_minutes = 525600\n").unwrap();
        assert_eq!(config.session_ttl(), ChronoDuration::days(365));
    }

    #[test]
    fn test_ttl_getters_never_panic() {
        let config = CredgateConfig {
            session_ttl_minutes: i64::MAX,
            elevated_ttl_minutes: i64::MIN,
            ..CredgateConfig::default()
        };
        assert_eq!(config.session_ttl(), ChronoDuration::days(365));
        assert_eq!(config.elevated_ttl(), ChronoDuration::zero());
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "data_dir = \"/var/lib/credgate\"\nwrite_retry_backoff_ms = 50\n").unwrap();

        let config = CredgateConfig::load_from(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/credgate"));
        assert_eq!(config.write_retry_backoff(), Duration::from_millis(50));
        assert_eq!(config.config_path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "session_ttl_minutes = \"soon\"").unwrap();
        let err = CredgateConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains(CONFIG_FILE_NAME));
    }
}

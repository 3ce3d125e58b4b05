//! Environment-driven pipeline configuration.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::extract::{OracleBackend, OracleConfig};
use crate::writer::RetryPolicy;

/// Everything the composition root needs, read once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub oracle: OracleConfig,
    /// Local database file.
    pub db_path: PathBuf,
    /// Consumer group shared by worker replicas.
    pub consumer_group: String,
    /// Concurrent extractions per worker process.
    pub max_in_flight: usize,
    /// Store-write backoff policy.
    pub retry: RetryPolicy,
    /// Deployment-specific skip markers, appended to the defaults.
    pub extra_markers: Vec<String>,
}

impl PipelineConfig {
    /// Read configuration from `SMS_LEDGER_*` environment variables.
    ///
    /// Only the oracle API key is mandatory; everything else has a default
    /// suitable for a single-node deployment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend_str = env_or("SMS_LEDGER_ORACLE_BACKEND", "anthropic");
        let backend =
            OracleBackend::parse(&backend_str).ok_or_else(|| ConfigError::InvalidValue {
                key: "SMS_LEDGER_ORACLE_BACKEND".into(),
                message: format!("unknown backend '{backend_str}'"),
            })?;

        let api_key = std::env::var("SMS_LEDGER_ORACLE_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("SMS_LEDGER_ORACLE_API_KEY".into()))?;

        let default_model = match backend {
            OracleBackend::Anthropic => "claude-3-5-haiku-latest",
            OracleBackend::OpenAi => "gpt-4o-mini",
        };

        Ok(Self {
            oracle: OracleConfig {
                backend,
                api_key: SecretString::from(api_key),
                model: env_or("SMS_LEDGER_ORACLE_MODEL", default_model),
            },
            db_path: PathBuf::from(env_or("SMS_LEDGER_DB_PATH", "./data/sms-ledger.db")),
            consumer_group: env_or("SMS_LEDGER_CONSUMER_GROUP", "sms-workers"),
            max_in_flight: env_parse("SMS_LEDGER_MAX_IN_FLIGHT", 8)?,
            retry: RetryPolicy {
                max_attempts: env_parse("SMS_LEDGER_RETRY_MAX_ATTEMPTS", 5)?,
                base_delay: Duration::from_secs(env_parse("SMS_LEDGER_RETRY_BASE_SECS", 1)?),
                max_delay: Duration::from_secs(env_parse("SMS_LEDGER_RETRY_MAX_SECS", 20)?),
            },
            extra_markers: parse_markers(&env_or("SMS_LEDGER_EXTRA_MARKERS", "")),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.into(),
            message: format!("'{raw}' is not a valid value"),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_markers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect()
}

//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::source::retry::RetryPolicy;

/// Default Gmail REST endpoint.
pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com";

/// Sync configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Principal whose mailbox is synced by the binary.
    pub principal: String,
    /// Sender address the notification emails come from.
    pub sender: String,
    /// Subject substring identifying transaction notifications.
    pub subject: String,
    /// Upper bound on message references considered per run.
    pub max_results: usize,
    /// Width of the per-message worker pool.
    pub concurrency: usize,
    /// Seconds between runs. Zero runs once and exits.
    pub poll_interval_secs: u64,
    /// Path to the local libSQL database file.
    pub db_path: PathBuf,
    /// Base URL of the message API.
    pub api_base: String,
    /// Retry/backoff policy for the source client.
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            principal: "default".to_string(),
            sender: String::new(),
            subject: String::new(),
            max_results: 50,
            concurrency: 4,
            poll_interval_secs: 0,
            db_path: PathBuf::from("./data/txn-sync.db"),
            api_base: DEFAULT_API_BASE.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Build config from environment variables.
    ///
    /// `TXN_SYNC_SENDER` and `TXN_SYNC_SUBJECT` are required; everything
    /// else falls back to [`SyncConfig::default`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let sender = required("TXN_SYNC_SENDER")?;
        let subject = required("TXN_SYNC_SUBJECT")?;

        let principal = std::env::var("TXN_SYNC_PRINCIPAL").unwrap_or(defaults.principal);
        let max_results = parsed("TXN_SYNC_MAX_RESULTS").unwrap_or(defaults.max_results);
        let concurrency = parsed("TXN_SYNC_CONCURRENCY").unwrap_or(defaults.concurrency);
        let poll_interval_secs =
            parsed("TXN_SYNC_POLL_INTERVAL_SECS").unwrap_or(defaults.poll_interval_secs);
        let db_path = std::env::var("TXN_SYNC_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let api_base = std::env::var("GMAIL_API_BASE").unwrap_or(defaults.api_base);

        let retry = RetryPolicy {
            max_attempts: parsed("TXN_SYNC_RETRY_MAX_ATTEMPTS")
                .unwrap_or(defaults.retry.max_attempts),
            initial_delay: parsed("TXN_SYNC_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.initial_delay),
            max_delay: parsed("TXN_SYNC_RETRY_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
            ..defaults.retry
        };

        let config = Self {
            principal,
            sender,
            subject,
            max_results,
            concurrency,
            poll_interval_secs,
            db_path,
            api_base,
            retry,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a run meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TXN_SYNC_CONCURRENCY".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TXN_SYNC_RETRY_MAX_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Render the fixed search query for the configured sender and subject.
    pub fn search_query(&self) -> String {
        search_query(&self.sender, &self.subject)
    }
}

/// Fixed query template combining a sender address and a subject substring.
pub fn search_query(sender: &str, subject: &str) -> String {
    format!("from:{sender} subject:\"{subject}\"")
}

fn required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

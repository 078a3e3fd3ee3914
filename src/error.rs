//! Error types for txn-sync.

use std::time::Duration;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by the remote message source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Rate limited by {provider}, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Transport error talking to {provider}: {reason}")]
    Transport { provider: String, reason: String },

    #[error("{provider} returned server error {status}: {body}")]
    Server {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Authentication rejected by {provider} ({status})")]
    AuthRejected { provider: String, status: u16 },

    #[error("{provider} rejected request ({status}): {body}")]
    BadRequest {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Failed to decode {provider} response: {reason}")]
    Decode { provider: String, reason: String },

    #[error("{provider} unavailable after {attempts} attempts: {last_error}")]
    Unavailable {
        provider: String,
        attempts: u32,
        last_error: String,
    },
}

impl SourceError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::RateLimited { .. }
                | SourceError::Transport { .. }
                | SourceError::Server { .. }
        )
    }

    /// Server-provided retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Credential provider errors.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Principal {principal} has no connected mailbox")]
    NotConnected { principal: String },

    #[error("Credential refresh failed for {principal}: {reason}")]
    RefreshFailed { principal: String, reason: String },
}

/// Conditions that abort a whole sync call.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Principal {principal} is not connected")]
    NotConnected { principal: String },

    #[error("Message source unavailable: {0}")]
    SourceUnavailable(#[source] SourceError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] DatabaseError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let rate = SourceError::RateLimited {
            provider: "gmail".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(rate.is_transient());
        assert_eq!(rate.retry_after(), Some(Duration::from_secs(2)));

        let server = SourceError::Server {
            provider: "gmail".into(),
            status: 503,
            body: String::new(),
        };
        assert!(server.is_transient());
        assert_eq!(server.retry_after(), None);

        let auth = SourceError::AuthRejected {
            provider: "gmail".into(),
            status: 401,
        };
        assert!(!auth.is_transient());

        let bad = SourceError::BadRequest {
            provider: "gmail".into(),
            status: 400,
            body: "invalid q".into(),
        };
        assert!(!bad.is_transient());
    }

    #[test]
    fn sync_error_wraps_source_error() {
        let err = SyncError::SourceUnavailable(SourceError::Unavailable {
            provider: "gmail".into(),
            attempts: 5,
            last_error: "timeout".into(),
        });
        let msg = err.to_string();
        assert!(msg.contains("unavailable after 5 attempts"));
    }
}

//! Bearer credentials for the message source.
//!
//! Token acquisition and refresh live outside this crate; a
//! [`CredentialProvider`] just hands back something usable per principal.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::CredentialError;

/// A valid bearer credential for one principal.
#[derive(Clone)]
pub struct Credential {
    pub principal: String,
    token: SecretString,
}

impl Credential {
    pub fn new(principal: impl Into<String>, token: SecretString) -> Self {
        Self {
            principal: principal.into(),
            token,
        }
    }

    /// The raw bearer token, for the `Authorization` header only.
    pub fn bearer(&self) -> &str {
        self.token.expose_secret()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("principal", &self.principal)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Supplies a valid credential per principal, refreshing if it must.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_valid_credential(&self, principal: &str) -> Result<Credential, CredentialError>;
}

/// Fixed principal → token map. Used by the binary and in tests.
#[derive(Default)]
pub struct StaticCredentialProvider {
    tokens: HashMap<String, SecretString>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, principal: &str, token: &str) -> Self {
        self.tokens
            .insert(principal.to_string(), SecretString::from(token.to_string()));
        self
    }

    /// Read `GMAIL_ACCESS_TOKEN` for the given principal.
    /// An unset or empty variable leaves the principal disconnected.
    pub fn from_env(principal: &str) -> Self {
        match std::env::var("GMAIL_ACCESS_TOKEN") {
            Ok(token) if !token.trim().is_empty() => Self::new().with_token(principal, token.trim()),
            _ => Self::new(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_valid_credential(&self, principal: &str) -> Result<Credential, CredentialError> {
        self.tokens
            .get(principal)
            .map(|token| Credential::new(principal, token.clone()))
            .ok_or_else(|| CredentialError::NotConnected {
                principal: principal.to_string(),
            })
    }
}

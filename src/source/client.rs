//! Message source — the remote mailbox API.
//!
//! [`MessageSource`] is the seam the orchestrator talks to; [`GmailClient`]
//! implements it over the Gmail REST API with reqwest. Every call is a
//! read, wrapped in the client's [`RetryPolicy`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::credentials::Credential;
use crate::error::SourceError;
use crate::source::retry::RetryPolicy;
use crate::source::types::{MessageDetail, SearchPage};

/// Largest page Gmail will return for `messages.list`.
pub const MAX_PAGE_SIZE: usize = 500;

const PROVIDER: &str = "gmail";

/// Read-only access to a remote mailbox.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// One page of message references matching `query`.
    ///
    /// `page_size` is a hint; implementations may return fewer.
    async fn search(
        &self,
        credential: &Credential,
        query: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<SearchPage, SourceError>;

    /// Full message including its MIME part tree.
    async fn fetch_detail(
        &self,
        credential: &Credential,
        message_id: &str,
    ) -> Result<MessageDetail, SourceError>;
}

/// Gmail REST client.
pub struct GmailClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl GmailClient {
    /// `base_url` is the API root, e.g. `https://gmail.googleapis.com`.
    pub fn new(base_url: &str, retry: RetryPolicy) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("txn-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SourceError::Transport {
                provider: PROVIDER.into(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/gmail/v1/users/me/messages", self.base_url)
    }

    /// `messages/{id}` with the id percent-encoded as one path segment.
    fn message_url(&self, message_id: &str) -> Result<String, SourceError> {
        let invalid = |reason: String| SourceError::BadRequest {
            provider: PROVIDER.into(),
            status: 0,
            body: reason,
        };

        // The url crate drops dot segments on push.
        if matches!(message_id, "" | "." | "..") {
            return Err(invalid(format!("Invalid message id {message_id:?}")));
        }

        let mut url = reqwest::Url::parse(&self.messages_url())
            .map_err(|e| invalid(format!("Invalid API base {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| invalid(format!("API base {} cannot carry a path", self.base_url)))?
            .push(message_id);
        Ok(url.into())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        credential: &Credential,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        self.retry
            .run(PROVIDER, operation, || self.get_once(credential, url, query))
            .await
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(credential.bearer())
            .query(query)
            .send()
            .await
            .map_err(|e| SourceError::Transport {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| SourceError::Transport {
            provider: PROVIDER.into(),
            reason: format!("Failed to read response body: {e}"),
        })?;

        if status.is_success() {
            return serde_json::from_slice(&body).map_err(|e| SourceError::Decode {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            });
        }

        Err(classify_failure(
            status,
            &headers,
            &String::from_utf8_lossy(&body),
        ))
    }
}

/// Map a non-success response onto the error taxonomy.
fn classify_failure(status: StatusCode, headers: &HeaderMap, body: &str) -> SourceError {
    // Gmail reports per-user quota exhaustion as 403 with a rate-limit reason.
    let quota_exceeded = status == StatusCode::FORBIDDEN
        && (body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded"));

    if status == StatusCode::TOO_MANY_REQUESTS || quota_exceeded {
        return SourceError::RateLimited {
            provider: PROVIDER.into(),
            retry_after: parse_retry_after(headers),
        };
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return SourceError::AuthRejected {
            provider: PROVIDER.into(),
            status: status.as_u16(),
        };
    }

    let body: String = body.chars().take(512).collect();
    if status.is_server_error() {
        SourceError::Server {
            provider: PROVIDER.into(),
            status: status.as_u16(),
            body,
        }
    } else {
        SourceError::BadRequest {
            provider: PROVIDER.into(),
            status: status.as_u16(),
            body,
        }
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl MessageSource for GmailClient {
    async fn search(
        &self,
        credential: &Credential,
        query: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<SearchPage, SourceError> {
        let mut params = vec![
            ("q", query.to_string()),
            ("maxResults", page_size.clamp(1, MAX_PAGE_SIZE).to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let page: SearchPage = self
            .get_json("messages.list", credential, &self.messages_url(), &params)
            .await?;

        debug!(
            principal = %credential.principal,
            count = page.messages.len(),
            has_next = page.next_page_token.is_some(),
            "Fetched search page"
        );
        Ok(page)
    }

    async fn fetch_detail(
        &self,
        credential: &Credential,
        message_id: &str,
    ) -> Result<MessageDetail, SourceError> {
        let url = self.message_url(message_id)?;
        let params = [("format", "full".to_string())];
        self.get_json("messages.get", credential, &url, &params)
            .await
    }
}

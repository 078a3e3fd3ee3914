//! Wire types for the Gmail REST message API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// Id-only handle returned by a search call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl MessageRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            thread_id: None,
        }
    }
}

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    #[serde(default)]
    pub messages: Vec<MessageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// Full message as returned by `messages.get?format=full`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDetail {
    pub id: String,
    #[serde(default)]
    pub snippet: String,
    /// Milliseconds since the epoch, sent as a decimal string.
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: Option<MessagePart>,
}

impl MessageDetail {
    /// Original send time: `internalDate` / 1000, truncated to whole seconds.
    pub fn email_date(&self) -> Result<DateTime<Utc>, SourceError> {
        let raw = self
            .internal_date
            .as_deref()
            .ok_or_else(|| decode_error(&self.id, "missing internalDate"))?;
        let millis: i64 = raw
            .trim()
            .parse()
            .map_err(|_| decode_error(&self.id, &format!("invalid internalDate {raw:?}")))?;
        DateTime::from_timestamp(millis.div_euclid(1000), 0)
            .ok_or_else(|| decode_error(&self.id, &format!("internalDate out of range: {millis}")))
    }
}

fn decode_error(message_id: &str, reason: &str) -> SourceError {
    SourceError::Decode {
        provider: "gmail".into(),
        reason: format!("message {message_id}: {reason}"),
    }
}

/// A node of the MIME part tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<PartBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<MessagePart>>,
}

/// Body of a part; `data` is base64url.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

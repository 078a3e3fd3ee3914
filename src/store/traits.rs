//! `Database` trait — the dedup ledger's persistence interface.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::DatabaseError;
use crate::pipeline::types::{Currency, ParsedAmount};

/// One remembered conversion attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedMessage {
    pub principal_id: String,
    pub message_id: String,
    pub processed_at: DateTime<Utc>,
    pub email_date: DateTime<Utc>,
    pub currency: Option<Currency>,
    pub amount: Option<Decimal>,
    pub linked_record_id: Option<String>,
}

impl ProcessedMessage {
    /// Seen, but no monetary notation was found.
    pub fn is_unparseable(&self) -> bool {
        self.currency.is_none() && self.amount.is_none()
    }

    pub fn parsed(&self) -> Option<ParsedAmount> {
        Some(ParsedAmount {
            amount: self.amount?,
            currency: self.currency?,
        })
    }
}

/// Result of a `record` call that reached the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// This call created the row.
    Inserted,
    /// The `(principal, message)` pair was already present.
    AlreadyRecorded,
}

/// Backend-agnostic ledger of processed messages.
///
/// `(principal_id, message_id)` is unique. `record` is atomic per pair, so
/// concurrent callers see exactly one `Inserted`.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Whether the pair has been recorded.
    async fn is_processed(&self, principal: &str, message_id: &str) -> Result<bool, DatabaseError>;

    /// The subset of `message_ids` already recorded for `principal`.
    async fn processed_ids(
        &self,
        principal: &str,
        message_ids: &[String],
    ) -> Result<HashSet<String>, DatabaseError> {
        let mut seen = HashSet::new();
        for id in message_ids {
            if self.is_processed(principal, id).await? {
                seen.insert(id.clone());
            }
        }
        Ok(seen)
    }

    /// Insert a new row. `parsed = None` marks the message seen-but-unparseable.
    async fn record(
        &self,
        principal: &str,
        message_id: &str,
        email_date: DateTime<Utc>,
        parsed: Option<&ParsedAmount>,
    ) -> Result<RecordOutcome, DatabaseError>;

    /// Look up a single row.
    async fn get_processed(
        &self,
        principal: &str,
        message_id: &str,
    ) -> Result<Option<ProcessedMessage>, DatabaseError>;

    /// All rows for `principal`, newest `email_date` first.
    async fn list_processed(&self, principal: &str) -> Result<Vec<ProcessedMessage>, DatabaseError>;

    /// Attach a downstream record id. Returns false if the row doesn't exist.
    async fn link_record(
        &self,
        principal: &str,
        message_id: &str,
        record_id: &str,
    ) -> Result<bool, DatabaseError>;
}

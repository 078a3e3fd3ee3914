//! Shared types for the ingestion pipeline.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// Currencies the notation patterns can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Cad,
    Usd,
}

impl Currency {
    /// Three-letter ISO code.
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Cad => "CAD",
            Currency::Usd => "USD",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CAD" => Ok(Currency::Cad),
            "USD" => Ok(Currency::Usd),
            other => Err(format!("unknown currency code: {other}")),
        }
    }
}

/// An amount/currency pair pulled out of a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParsedAmount {
    pub amount: Decimal,
    pub currency: Currency,
}

impl ParsedAmount {
    /// Non-negative with at most two fractional digits.
    pub fn is_well_formed(&self) -> bool {
        !self.amount.is_sign_negative() && self.amount.scale() <= 2
    }
}

/// One message successfully converted during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedTransaction {
    pub message_id: String,
    pub email_date: DateTime<Utc>,
    pub amount: Decimal,
    pub currency: Currency,
    pub snippet: String,
}

/// A per-message failure that left the message unrecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageFailure {
    pub message_id: String,
    pub reason: String,
}

/// Result of one `sync` call.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub principal: String,
    /// Message references taken from search, after the result bound.
    pub considered: usize,
    /// Sorted by `email_date`, then message id.
    pub new_transactions: Vec<ExtractedTransaction>,
    pub skipped_already_processed: usize,
    pub unparseable: usize,
    pub errors: Vec<MessageFailure>,
    /// The run stopped early because its cancellation flag was raised.
    pub cancelled: bool,
}

impl SyncReport {
    pub(crate) fn new(run_id: Uuid, principal: &str) -> Self {
        Self {
            run_id,
            principal: principal.to_string(),
            considered: 0,
            new_transactions: Vec::new(),
            skipped_already_processed: 0,
            unparseable: 0,
            errors: Vec::new(),
            cancelled: false,
        }
    }
}

/// What happened to one message reference inside a run.
#[derive(Debug)]
pub(crate) enum MessageOutcome {
    New(ExtractedTransaction),
    AlreadyRecorded,
    Unparseable,
    Failed(MessageFailure),
    /// Not started because the run was cancelled.
    Skipped,
}

/// Shared cancellation signal for a sync run or polling loop.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

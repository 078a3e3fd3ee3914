//! Sync orchestrator — one idempotent pass over the mailbox.
//!
//! search → ledger filter → fetch detail → extract → parse → record.
//! Only the run whose `record` inserts the row reports the transaction, so
//! overlapping runs never double-count.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::credentials::{Credential, CredentialProvider};
use crate::error::{CredentialError, SyncError};
use crate::pipeline::body;
use crate::pipeline::parser::TransactionParser;
use crate::pipeline::types::{
    CancellationFlag, ExtractedTransaction, MessageFailure, MessageOutcome, SyncReport,
};
use crate::source::client::{MAX_PAGE_SIZE, MessageSource};
use crate::source::types::MessageRef;
use crate::store::traits::{Database, RecordOutcome};

/// Default width of the per-message worker pool.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Drives sync runs for any principal against one query.
pub struct SyncOrchestrator {
    credentials: Arc<dyn CredentialProvider>,
    source: Arc<dyn MessageSource>,
    store: Arc<dyn Database>,
    parser: TransactionParser,
    query: String,
    concurrency: usize,
}

impl SyncOrchestrator {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        source: Arc<dyn MessageSource>,
        store: Arc<dyn Database>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            credentials,
            source,
            store,
            parser: TransactionParser::new(),
            query: query.into(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Set the worker pool width. Zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run one sync pass for `principal`, considering at most `max_results`
    /// message references.
    pub async fn sync(&self, principal: &str, max_results: usize) -> Result<SyncReport, SyncError> {
        self.sync_with_cancel(principal, max_results, &CancellationFlag::new())
            .await
    }

    /// Like [`sync`](Self::sync), but stops issuing source calls once
    /// `cancel` is raised and returns the partial report.
    pub async fn sync_with_cancel(
        &self,
        principal: &str,
        max_results: usize,
        cancel: &CancellationFlag,
    ) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync", %run_id, principal);
        self.run(run_id, principal, max_results, cancel)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        run_id: Uuid,
        principal: &str,
        max_results: usize,
        cancel: &CancellationFlag,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new(run_id, principal);

        let credential = self
            .credentials
            .get_valid_credential(principal)
            .await
            .map_err(|e| {
                warn!("No usable credential: {e}");
                match e {
                    CredentialError::NotConnected { principal }
                    | CredentialError::RefreshFailed { principal, .. } => {
                        SyncError::NotConnected { principal }
                    }
                }
            })?;

        let (refs, search_cut_short) = self.collect_refs(&credential, max_results, cancel).await?;
        report.considered = refs.len();
        report.cancelled = search_cut_short;

        if refs.is_empty() {
            info!("No matching messages");
            return Ok(report);
        }

        let ids: Vec<String> = refs.iter().map(|r| r.id.clone()).collect();
        let already = self.store.processed_ids(principal, &ids).await?;
        report.skipped_already_processed = already.len();

        let pending: Vec<String> = ids.into_iter().filter(|id| !already.contains(id)).collect();
        debug!(
            considered = report.considered,
            pending = pending.len(),
            "Filtered against ledger"
        );

        let outcomes: Vec<MessageOutcome> = stream::iter(pending)
            .map(|message_id| self.process_one(&credential, principal, message_id, cancel))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                MessageOutcome::New(txn) => report.new_transactions.push(txn),
                MessageOutcome::AlreadyRecorded => report.skipped_already_processed += 1,
                MessageOutcome::Unparseable => report.unparseable += 1,
                MessageOutcome::Failed(failure) => report.errors.push(failure),
                MessageOutcome::Skipped => report.cancelled = true,
            }
        }

        report.new_transactions.sort_by(|a, b| {
            a.email_date
                .cmp(&b.email_date)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        report.errors.sort_by(|a, b| a.message_id.cmp(&b.message_id));

        info!(
            considered = report.considered,
            new = report.new_transactions.len(),
            skipped = report.skipped_already_processed,
            unparseable = report.unparseable,
            errors = report.errors.len(),
            cancelled = report.cancelled,
            "Sync run complete"
        );
        Ok(report)
    }

    /// Page through search until `max_results` unique refs are collected,
    /// the source runs out, or the run is cancelled.
    ///
    /// Returns the refs and whether cancellation stopped paging early.
    async fn collect_refs(
        &self,
        credential: &Credential,
        max_results: usize,
        cancel: &CancellationFlag,
    ) -> Result<(Vec<MessageRef>, bool), SyncError> {
        let mut refs: Vec<MessageRef> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        while refs.len() < max_results {
            if cancel.is_cancelled() {
                info!(collected = refs.len(), "Cancelled while paging");
                return Ok((refs, true));
            }

            let page_size = (max_results - refs.len()).min(MAX_PAGE_SIZE);
            let page = self
                .source
                .search(credential, &self.query, page_token.as_deref(), page_size)
                .await
                .map_err(|e| {
                    warn!(page = pages, "Search failed: {e}");
                    SyncError::SourceUnavailable(e)
                })?;
            pages += 1;

            let empty = page.messages.is_empty();
            for message in page.messages {
                if refs.len() >= max_results {
                    break;
                }
                if seen.insert(message.id.clone()) {
                    refs.push(message);
                }
            }

            match page.next_page_token {
                // An empty page with a token would loop forever.
                Some(token) if !empty => page_token = Some(token),
                _ => break,
            }
        }

        debug!(pages, collected = refs.len(), "Search complete");
        Ok((refs, false))
    }

    /// Classify one unprocessed message. Never fails the run.
    async fn process_one(
        &self,
        credential: &Credential,
        principal: &str,
        message_id: String,
        cancel: &CancellationFlag,
    ) -> MessageOutcome {
        if cancel.is_cancelled() {
            return MessageOutcome::Skipped;
        }

        let detail = match self.source.fetch_detail(credential, &message_id).await {
            Ok(detail) => detail,
            Err(e) => {
                warn!(message_id = %message_id, "Fetch failed: {e}");
                return MessageOutcome::Failed(MessageFailure {
                    message_id,
                    reason: e.to_string(),
                });
            }
        };

        let email_date = match detail.email_date() {
            Ok(date) => date,
            Err(e) => {
                warn!(message_id = %message_id, "Undecodable message: {e}");
                return MessageOutcome::Failed(MessageFailure {
                    message_id,
                    reason: e.to_string(),
                });
            }
        };

        let text = body::extract_text(&detail);
        let parsed = self.parser.parse(&text);

        match self
            .store
            .record(principal, &message_id, email_date, parsed.as_ref())
            .await
        {
            Ok(RecordOutcome::Inserted) => match parsed {
                Some(p) => {
                    debug!(message_id = %message_id, amount = %p.amount, currency = %p.currency, "New transaction");
                    MessageOutcome::New(ExtractedTransaction {
                        message_id,
                        email_date,
                        amount: p.amount,
                        currency: p.currency,
                        snippet: detail.snippet,
                    })
                }
                None => {
                    debug!(message_id = %message_id, "No monetary notation found");
                    MessageOutcome::Unparseable
                }
            },
            Ok(RecordOutcome::AlreadyRecorded) => {
                debug!(message_id = %message_id, "Recorded by a concurrent run");
                MessageOutcome::AlreadyRecorded
            }
            Err(e) => {
                warn!(message_id = %message_id, "Failed to record: {e}");
                MessageOutcome::Failed(MessageFailure {
                    message_id,
                    reason: e.to_string(),
                })
            }
        }
    }
}

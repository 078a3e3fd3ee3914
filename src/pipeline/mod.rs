//! Mailbox → transaction ingestion pipeline.
//!
//! One sync run flows through:
//! 1. `CredentialProvider::get_valid_credential()` — bearer token for the principal
//! 2. `MessageSource::search()` — paged message references, bounded by `max_results`
//! 3. `Database::processed_ids()` — ledger filter, already-seen ids are skipped
//! 4. `MessageSource::fetch_detail()` + `body::extract_text()` — readable body
//! 5. `TransactionParser::parse()` — first matching notation pattern
//! 6. `Database::record()` — atomic claim; only the inserting run reports it
//!
//! A message is only recorded once its outcome is known. Fetch or decode
//! failures leave it unrecorded so the next run retries it.

pub mod body;
pub mod parser;
pub mod poller;
pub mod sync;
pub mod types;

pub use parser::TransactionParser;
pub use poller::spawn_sync_loop;
pub use sync::SyncOrchestrator;
pub use types::{CancellationFlag, ExtractedTransaction, MessageFailure, SyncReport};

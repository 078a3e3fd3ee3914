//! txn-sync — idempotent mailbox → transaction ingestion.

pub mod config;
pub mod credentials;
pub mod error;
pub mod pipeline;
pub mod source;
pub mod store;

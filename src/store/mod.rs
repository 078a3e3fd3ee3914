//! Persistence layer — the libSQL-backed ledger of processed messages.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, ProcessedMessage, RecordOutcome};

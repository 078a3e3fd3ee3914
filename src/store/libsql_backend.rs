//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Uniqueness of
//! `(principal_id, message_id)` is the table's primary key; `record` relies
//! on `ON CONFLICT DO NOTHING` and the affected-row count, never on a
//! read-then-write check.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::pipeline::types::{Currency, ParsedAmount};
use crate::store::migrations;
use crate::store::traits::{Database, ProcessedMessage, RecordOutcome};

/// Max bound parameters per `IN (...)` lookup.
const ID_CHUNK: usize = 200;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    /// Owns the database the connection was opened from; never read.
    _db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        configure_local(&conn).await?;

        let backend = Self {
            _db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            _db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// How long a writer waits on another connection's lock before failing.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// File-backed databases may be shared with other connections and processes;
/// a competing writer waits for the lock rather than failing.
async fn configure_local(conn: &Connection) -> Result<(), DatabaseError> {
    let busy_timeout = format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}");
    for pragma in [busy_timeout.as_str(), "PRAGMA journal_mode = WAL"] {
        let mut rows = conn
            .query(pragma, ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("{pragma}: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Pool(format!("{pragma}: {e}")))?;
    }
    Ok(())
}

/// Canonical write format. Fixed width, so text order is time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

const PROCESSED_COLUMNS: &str =
    "principal_id, message_id, processed_at, email_date, currency, amount, linked_record_id";

/// Map a libsql Row to a ProcessedMessage.
///
/// Column order matches PROCESSED_COLUMNS.
fn row_to_processed(row: &libsql::Row) -> Result<ProcessedMessage, DatabaseError> {
    let get_text = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
    };

    let currency = match row.get::<String>(4).ok() {
        Some(code) => Some(Currency::from_str(&code).map_err(DatabaseError::Serialization)?),
        None => None,
    };
    let amount = match row.get::<String>(5).ok() {
        Some(raw) => Some(
            Decimal::from_str(&raw)
                .map_err(|e| DatabaseError::Serialization(format!("amount {raw:?}: {e}")))?,
        ),
        None => None,
    };

    Ok(ProcessedMessage {
        principal_id: get_text(0)?,
        message_id: get_text(1)?,
        processed_at: parse_datetime(&get_text(2)?),
        email_date: parse_datetime(&get_text(3)?),
        currency,
        amount,
        linked_record_id: row.get::<String>(6).ok(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn is_processed(&self, principal: &str, message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM processed_messages WHERE principal_id = ?1 AND message_id = ?2",
                params![principal, message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_processed: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("is_processed: {e}"))),
        }
    }

    async fn processed_ids(
        &self,
        principal: &str,
        message_ids: &[String],
    ) -> Result<HashSet<String>, DatabaseError> {
        let mut seen = HashSet::new();

        for chunk in message_ids.chunks(ID_CHUNK) {
            let placeholders: Vec<String> = (0..chunk.len()).map(|i| format!("?{}", i + 2)).collect();
            let sql = format!(
                "SELECT message_id FROM processed_messages WHERE principal_id = ?1 AND message_id IN ({})",
                placeholders.join(", ")
            );

            let mut values = Vec::with_capacity(chunk.len() + 1);
            values.push(libsql::Value::Text(principal.to_string()));
            values.extend(chunk.iter().map(|id| libsql::Value::Text(id.clone())));

            let mut rows = self
                .conn()
                .query(&sql, libsql::params_from_iter(values))
                .await
                .map_err(|e| DatabaseError::Query(format!("processed_ids: {e}")))?;

            loop {
                match rows.next().await {
                    Ok(Some(row)) => {
                        let id: String = row
                            .get(0)
                            .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                        seen.insert(id);
                    }
                    Ok(None) => break,
                    Err(e) => return Err(DatabaseError::Query(format!("processed_ids: {e}"))),
                }
            }
        }

        Ok(seen)
    }

    async fn record(
        &self,
        principal: &str,
        message_id: &str,
        email_date: DateTime<Utc>,
        parsed: Option<&ParsedAmount>,
    ) -> Result<RecordOutcome, DatabaseError> {
        if let Some(p) = parsed
            && !p.is_well_formed()
        {
            return Err(DatabaseError::Constraint(format!(
                "amount {} for message {message_id} must be non-negative with at most two decimals",
                p.amount
            )));
        }

        let currency = parsed.map(|p| p.currency.code().to_string());
        let amount = parsed.map(|p| p.amount.to_string());

        let affected = self
            .conn()
            .execute(
                "INSERT INTO processed_messages (principal_id, message_id, processed_at, email_date, currency, amount)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (principal_id, message_id) DO NOTHING",
                params![
                    principal,
                    message_id,
                    format_datetime(&Utc::now()),
                    format_datetime(&email_date),
                    opt_text_owned(currency),
                    opt_text_owned(amount),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record: {e}")))?;

        if affected == 0 {
            debug!(principal, message_id, "Message already recorded");
            return Ok(RecordOutcome::AlreadyRecorded);
        }

        debug!(principal, message_id, parsed = parsed.is_some(), "Message recorded");
        Ok(RecordOutcome::Inserted)
    }

    async fn get_processed(
        &self,
        principal: &str,
        message_id: &str,
    ) -> Result<Option<ProcessedMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PROCESSED_COLUMNS} FROM processed_messages WHERE principal_id = ?1 AND message_id = ?2"
                ),
                params![principal, message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_processed: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_processed(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_processed: {e}"))),
        }
    }

    async fn list_processed(&self, principal: &str) -> Result<Vec<ProcessedMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PROCESSED_COLUMNS} FROM processed_messages WHERE principal_id = ?1
                     ORDER BY email_date DESC, message_id DESC"
                ),
                params![principal],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_processed: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_processed(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    warn!("Skipping processed_messages row: {e}");
                }
            }
        }
        Ok(messages)
    }

    async fn link_record(
        &self,
        principal: &str,
        message_id: &str,
        record_id: &str,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE processed_messages SET linked_record_id = ?1
                 WHERE principal_id = ?2 AND message_id = ?3",
                params![record_id, principal, message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("link_record: {e}")))?;

        if affected > 0 {
            debug!(principal, message_id, record_id, "Linked downstream record");
        }
        Ok(affected > 0)
    }
}

//! End-to-end orchestrator tests against a scripted mailbox and the real
//! libSQL ledger.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use rust_decimal_macros::dec;

use txn_sync::credentials::{Credential, StaticCredentialProvider};
use txn_sync::error::{SourceError, SyncError};
use txn_sync::pipeline::types::Currency;
use txn_sync::pipeline::{CancellationFlag, SyncOrchestrator};
use txn_sync::source::{MessageDetail, MessagePart, MessageRef, MessageSource, PartBody, SearchPage};
use txn_sync::store::{Database, LibSqlBackend};

const PRINCIPAL: &str = "alice";

/// How a scripted message answers `fetch_detail`.
#[derive(Clone)]
enum Scripted {
    Body { millis: i64, text: String },
    FetchFails,
    NoDate,
}

/// In-memory mailbox with call counters.
struct ScriptedMailbox {
    order: Vec<String>,
    messages: HashMap<String, Scripted>,
    page_len: usize,
    fail_search: bool,
    searches: AtomicUsize,
    fetches: Mutex<Vec<String>>,
    /// Raised after this many detail fetches, if set.
    cancel_after: Option<(usize, CancellationFlag)>,
}

impl ScriptedMailbox {
    fn new(page_len: usize) -> Self {
        Self {
            order: Vec::new(),
            messages: HashMap::new(),
            page_len,
            fail_search: false,
            searches: AtomicUsize::new(0),
            fetches: Mutex::new(Vec::new()),
            cancel_after: None,
        }
    }

    fn with(mut self, id: &str, message: Scripted) -> Self {
        self.order.push(id.to_string());
        self.messages.insert(id.to_string(), message);
        self
    }

    fn body(self, id: &str, millis: i64, text: &str) -> Self {
        self.with(
            id,
            Scripted::Body {
                millis,
                text: text.to_string(),
            },
        )
    }

    fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    fn fetched(&self, id: &str) -> usize {
        self.fetches.lock().unwrap().iter().filter(|f| *f == id).count()
    }
}

#[async_trait]
impl MessageSource for ScriptedMailbox {
    async fn search(
        &self,
        _credential: &Credential,
        _query: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<SearchPage, SourceError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if self.fail_search {
            return Err(SourceError::Unavailable {
                provider: "gmail".into(),
                attempts: 5,
                last_error: "503 Service Unavailable".into(),
            });
        }

        let start: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
        let end = (start + self.page_len.min(page_size)).min(self.order.len());
        Ok(SearchPage {
            messages: self.order[start..end].iter().map(MessageRef::new).collect(),
            next_page_token: (end < self.order.len()).then(|| end.to_string()),
        })
    }

    async fn fetch_detail(
        &self,
        _credential: &Credential,
        message_id: &str,
    ) -> Result<MessageDetail, SourceError> {
        let count = {
            let mut fetches = self.fetches.lock().unwrap();
            fetches.push(message_id.to_string());
            fetches.len()
        };
        if let Some((after, flag)) = &self.cancel_after
            && count >= *after
        {
            flag.cancel();
        }

        match self.messages.get(message_id).cloned() {
            Some(Scripted::Body { millis, text }) => Ok(MessageDetail {
                id: message_id.to_string(),
                snippet: text.chars().take(40).collect(),
                internal_date: Some(millis.to_string()),
                payload: Some(MessagePart {
                    mime_type: Some("text/plain; charset=UTF-8".into()),
                    body: Some(PartBody {
                        data: Some(URL_SAFE.encode(text.as_bytes())),
                        size: Some(text.len() as u64),
                    }),
                    ..Default::default()
                }),
            }),
            Some(Scripted::NoDate) => Ok(MessageDetail {
                id: message_id.to_string(),
                ..Default::default()
            }),
            Some(Scripted::FetchFails) | None => Err(SourceError::Server {
                provider: "gmail".into(),
                status: 500,
                body: "backend error".into(),
            }),
        }
    }
}

async fn ledger() -> Arc<dyn Database> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

fn orchestrator(source: Arc<ScriptedMailbox>, store: Arc<dyn Database>) -> SyncOrchestrator {
    let creds = Arc::new(StaticCredentialProvider::new().with_token(PRINCIPAL, "token"));
    SyncOrchestrator::new(
        creds,
        source,
        store,
        "from:alerts@bank.example subject:\"Deposit\"",
    )
}

fn five_deposits() -> ScriptedMailbox {
    ScriptedMailbox::new(50)
        .body("m1", 1_700_000_500_000, "CDN$ 100.00 has been added to your account")
        .body("m2", 1_700_000_400_000, "USD $50.00 has been added to your account")
        .body("m3", 1_700_000_300_000, "$25.00 has been added to your account")
        .body("m4", 1_700_000_200_000, "$1,000.00 has been added to your account")
        .body("m5", 1_700_000_100_000, "Your statement is ready")
}

#[tokio::test]
async fn first_run_classifies_and_second_run_is_idempotent() {
    let source = Arc::new(five_deposits());
    let store = ledger().await;
    let orch = orchestrator(Arc::clone(&source), Arc::clone(&store));

    let first = orch.sync(PRINCIPAL, 50).await.unwrap();
    assert_eq!(first.considered, 5);
    assert_eq!(first.new_transactions.len(), 4);
    assert_eq!(first.unparseable, 1);
    assert_eq!(first.skipped_already_processed, 0);
    assert!(first.errors.is_empty());

    // Oldest first
    let got: Vec<(&str, _, Currency)> = first
        .new_transactions
        .iter()
        .map(|t| (t.message_id.as_str(), t.amount, t.currency))
        .collect();
    assert_eq!(
        got,
        vec![
            ("m4", dec!(1000.00), Currency::Usd),
            ("m3", dec!(25.00), Currency::Usd),
            ("m2", dec!(50.00), Currency::Usd),
            ("m1", dec!(100.00), Currency::Cad),
        ]
    );

    let second = orch.sync(PRINCIPAL, 50).await.unwrap();
    assert!(second.new_transactions.is_empty());
    assert_eq!(second.skipped_already_processed, 5);
    assert_eq!(second.unparseable, 0);
    assert_eq!(source.fetch_count(), 5, "no detail fetch on the second run");

    assert_eq!(store.list_processed(PRINCIPAL).await.unwrap().len(), 5);
}

#[tokio::test]
async fn unparseable_message_is_never_fetched_again() {
    let source = Arc::new(ScriptedMailbox::new(50).body("u1", 1_700_000_000_000, "Thanks for banking with us"));
    let store = ledger().await;
    let orch = orchestrator(Arc::clone(&source), Arc::clone(&store));

    let first = orch.sync(PRINCIPAL, 10).await.unwrap();
    assert_eq!(first.unparseable, 1);

    for _ in 0..3 {
        let again = orch.sync(PRINCIPAL, 10).await.unwrap();
        assert_eq!(again.unparseable, 0);
        assert_eq!(again.skipped_already_processed, 1);
    }
    assert_eq!(source.fetched("u1"), 1);

    let row = store.get_processed(PRINCIPAL, "u1").await.unwrap().unwrap();
    assert!(row.is_unparseable());
}

#[tokio::test]
async fn one_failed_fetch_does_not_stop_the_rest() {
    let source = Arc::new(
        ScriptedMailbox::new(50)
            .body("m1", 1_700_000_100_000, "CAD 10.00 has been added")
            .body("m2", 1_700_000_200_000, "CAD 20.00 has been added")
            .with("m3", Scripted::FetchFails)
            .body("m4", 1_700_000_400_000, "no money here")
            .body("m5", 1_700_000_500_000, "US$ 7.50 has been added"),
    );
    let store = ledger().await;
    let orch = orchestrator(Arc::clone(&source), Arc::clone(&store));

    let report = orch.sync(PRINCIPAL, 50).await.unwrap();
    assert_eq!(report.new_transactions.len(), 3);
    assert_eq!(report.unparseable, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].message_id, "m3");
    assert!(report.errors[0].reason.contains("500"));

    // The failed message stays unrecorded and is retried next time
    assert!(!store.is_processed(PRINCIPAL, "m3").await.unwrap());
    let retry = orch.sync(PRINCIPAL, 50).await.unwrap();
    assert_eq!(retry.skipped_already_processed, 4);
    assert_eq!(retry.errors.len(), 1);
    assert_eq!(source.fetched("m3"), 2);
}

#[tokio::test]
async fn undecodable_detail_is_a_per_message_error() {
    let source = Arc::new(
        ScriptedMailbox::new(50)
            .with("bad", Scripted::NoDate)
            .body("ok", 1_700_000_000_000, "$5.00 has been added"),
    );
    let store = ledger().await;
    let orch = orchestrator(Arc::clone(&source), Arc::clone(&store));

    let report = orch.sync(PRINCIPAL, 50).await.unwrap();
    assert_eq!(report.new_transactions.len(), 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].message_id, "bad");
    assert!(!store.is_processed(PRINCIPAL, "bad").await.unwrap());
}

#[tokio::test]
async fn pagination_stops_at_max_results() {
    let mut mailbox = ScriptedMailbox::new(4);
    for i in 0..15 {
        mailbox = mailbox.body(&format!("p{i:02}"), 1_700_000_000_000 + i * 1000, "$1.00 has been added");
    }
    let source = Arc::new(mailbox);
    let orch = orchestrator(Arc::clone(&source), ledger().await);

    let report = orch.sync(PRINCIPAL, 10).await.unwrap();
    assert_eq!(report.considered, 10);
    assert_eq!(report.new_transactions.len(), 10);
    assert_eq!(source.fetch_count(), 10);

    // The next run picks up where the ledger says it left off
    let next = orch.sync(PRINCIPAL, 15).await.unwrap();
    assert_eq!(next.skipped_already_processed, 10);
    assert_eq!(next.new_transactions.len(), 5);
}

#[tokio::test]
async fn missing_credential_is_not_connected() {
    let source = Arc::new(five_deposits());
    let orch = orchestrator(Arc::clone(&source), ledger().await);

    let err = orch.sync("bob", 50).await.unwrap_err();
    assert!(matches!(err, SyncError::NotConnected { .. }));
    assert_eq!(source.searches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn search_failure_aborts_the_run() {
    let mut mailbox = five_deposits();
    mailbox.fail_search = true;
    let source = Arc::new(mailbox);
    let store = ledger().await;
    let orch = orchestrator(Arc::clone(&source), Arc::clone(&store));

    let err = orch.sync(PRINCIPAL, 50).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::SourceUnavailable(SourceError::Unavailable { attempts: 5, .. })
    ));
    assert_eq!(source.fetch_count(), 0);
    assert!(store.list_processed(PRINCIPAL).await.unwrap().is_empty());
}

#[tokio::test]
async fn overlapping_runs_report_each_transaction_once() {
    let mut mailbox = ScriptedMailbox::new(7);
    for i in 0..20 {
        mailbox = mailbox.body(&format!("c{i:02}"), 1_700_000_000_000 + i * 1000, "CD$ 3.00 has been added");
    }
    let source = Arc::new(mailbox);
    let store = ledger().await;
    let a = Arc::new(orchestrator(Arc::clone(&source), Arc::clone(&store)).with_concurrency(3));
    let b = Arc::new(orchestrator(Arc::clone(&source), Arc::clone(&store)).with_concurrency(5));

    let (ra, rb) = tokio::join!(a.sync(PRINCIPAL, 50), b.sync(PRINCIPAL, 50));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.new_transactions.len() + rb.new_transactions.len(), 20);
    let ids: HashSet<&str> = ra
        .new_transactions
        .iter()
        .chain(rb.new_transactions.iter())
        .map(|t| t.message_id.as_str())
        .collect();
    assert_eq!(ids.len(), 20);
    assert_eq!(ra.skipped_already_processed + rb.skipped_already_processed, 20);
    assert_eq!(store.list_processed(PRINCIPAL).await.unwrap().len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runs_on_separate_connections_report_each_transaction_once() {
    let mut mailbox = ScriptedMailbox::new(10);
    for i in 0..30 {
        mailbox = mailbox.body(&format!("f{i:02}"), 1_700_000_000_000 + i * 1000, "CAD 4.00 has been added");
    }
    let source = Arc::new(mailbox);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let store_a: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let store_b: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let a = Arc::new(orchestrator(Arc::clone(&source), Arc::clone(&store_a)).with_concurrency(4));
    let b = Arc::new(orchestrator(Arc::clone(&source), store_b).with_concurrency(4));

    let ta = tokio::spawn({
        let a = Arc::clone(&a);
        async move { a.sync(PRINCIPAL, 50).await }
    });
    let tb = tokio::spawn({
        let b = Arc::clone(&b);
        async move { b.sync(PRINCIPAL, 50).await }
    });
    let ra = ta.await.unwrap().unwrap();
    let rb = tb.await.unwrap().unwrap();

    assert!(ra.errors.is_empty(), "errors: {:?}", ra.errors);
    assert!(rb.errors.is_empty(), "errors: {:?}", rb.errors);
    assert_eq!(ra.new_transactions.len() + rb.new_transactions.len(), 30);
    assert_eq!(ra.skipped_already_processed + rb.skipped_already_processed, 30);
    assert_eq!(store_a.list_processed(PRINCIPAL).await.unwrap().len(), 30);
}

#[tokio::test]
async fn cancellation_stops_new_fetches_and_keeps_finished_work() {
    let cancel = CancellationFlag::new();
    let mut mailbox = ScriptedMailbox::new(50);
    for i in 0..10 {
        mailbox = mailbox.body(&format!("x{i}"), 1_700_000_000_000 + i * 1000, "$2.00 has been added");
    }
    mailbox.cancel_after = Some((3, cancel.clone()));
    let source = Arc::new(mailbox);
    let store = ledger().await;
    let orch = orchestrator(Arc::clone(&source), Arc::clone(&store)).with_concurrency(1);

    let report = orch.sync_with_cancel(PRINCIPAL, 50, &cancel).await.unwrap();
    assert!(report.cancelled);
    assert_eq!(source.fetch_count(), 3);
    assert_eq!(report.new_transactions.len(), 3);

    // Everything reported was durably recorded
    let recorded = store.list_processed(PRINCIPAL).await.unwrap();
    assert_eq!(recorded.len(), 3);

    // A fresh run finishes the job
    let rest = orch.sync(PRINCIPAL, 50).await.unwrap();
    assert!(!rest.cancelled);
    assert_eq!(rest.new_transactions.len(), 7);
    assert_eq!(rest.skipped_already_processed, 3);
}

#[tokio::test]
async fn ledger_is_scoped_per_principal() {
    let source = Arc::new(five_deposits());
    let store = ledger().await;
    let creds = Arc::new(
        StaticCredentialProvider::new()
            .with_token("alice", "a")
            .with_token("bob", "b"),
    );
    let orch = SyncOrchestrator::new(creds, Arc::clone(&source) as Arc<dyn MessageSource>, store, "q");

    let alice = orch.sync("alice", 50).await.unwrap();
    let bob = orch.sync("bob", 50).await.unwrap();
    assert_eq!(alice.new_transactions.len(), 4);
    assert_eq!(bob.new_transactions.len(), 4);
    assert_eq!(bob.skipped_already_processed, 0);
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

use txn_sync::config::SyncConfig;
use txn_sync::credentials::StaticCredentialProvider;
use txn_sync::pipeline::{SyncOrchestrator, spawn_sync_loop};
use txn_sync::source::GmailClient;
use txn_sync::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = SyncConfig::from_env().context("Invalid configuration")?;

    eprintln!("txn-sync v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Principal: {}", config.principal);
    eprintln!("   Query: {}", config.search_query());
    eprintln!("   Database: {}", config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Source + credentials ─────────────────────────────────────────────
    let source = Arc::new(
        GmailClient::new(&config.api_base, config.retry.clone())
            .context("Failed to build Gmail client")?,
    );
    let credentials = Arc::new(StaticCredentialProvider::from_env(&config.principal));

    let orchestrator = Arc::new(
        SyncOrchestrator::new(credentials, source, store, config.search_query())
            .with_concurrency(config.concurrency),
    );

    if config.poll_interval_secs == 0 {
        let report = orchestrator
            .sync(&config.principal, config.max_results)
            .await
            .context("Sync failed")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let (handle, shutdown) = spawn_sync_loop(
        Arc::clone(&orchestrator),
        config.principal.clone(),
        config.max_results,
        Duration::from_secs(config.poll_interval_secs),
    );

    let stop = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after in-flight writes");
            stop.cancel();
        }
    });

    handle.await.context("Sync loop task failed")?;
    info!("Sync loop stopped");
    Ok(())
}

/// `RUST_LOG` filtering, plus a daily rolling file when `TXN_SYNC_LOG_DIR` is set.
fn init_tracing() -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    match std::env::var_os("TXN_SYNC_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "txn-sync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            builder.with_writer(writer).with_ansi(false).init();
            Some(guard)
        }
        None => {
            builder.init();
            None
        }
    }
}

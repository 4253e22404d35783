use std::sync::Arc;
use std::time::Duration;

use mirage::config::Config;
use mirage::jobs::store::{PendingJobStore, TERMINAL_RETENTION_DAYS};
use mirage::ledger::CreditLedger;
use mirage::push::{HttpPushDispatch, NullPushDispatch, PushDispatch};
use mirage::reconciler::Reconciler;
use mirage::server::{build_router, AppState};

/// How often the retention sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    tracing::info!("mirage webhook receiver starting");

    let config = Arc::new(Config::from_env());
    let store = Arc::new(PendingJobStore::new());
    let ledger = Arc::new(CreditLedger::new());
    let push: Arc<dyn PushDispatch> = match &config.push_gateway_url {
        Some(url) => Arc::new(HttpPushDispatch::new(url.clone())),
        None => Arc::new(NullPushDispatch),
    };
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&ledger),
        push,
        config.webhook_secrets(),
    ));

    // Retention sweep: terminal rows are kept for 7 days, non-terminal rows
    // are never deleted.
    let sweep_store = Arc::clone(&store);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sweep_store.sweep_terminal(chrono::Duration::days(TERMINAL_RETENTION_DAYS));
        }
    });

    let state = AppState {
        store,
        ledger,
        reconciler,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = config.listen_addr, "listening");
    axum::serve(listener, app).await?;

    tracing::info!("mirage shutting down");
    Ok(())
}

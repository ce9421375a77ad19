use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradesync::application::handlers::trade_handler::{self, AppState};
use tradesync::application::services::queue_bridge::QueueSynchronizerBridge;
use tradesync::config::{QueueConfig, ServerConfig, SyncConfig};
use tradesync::domain::services::bot_synchronizer::BotSynchronizer;
use tradesync::infrastructure::paper_executor::PaperExecutor;
use tradesync::infrastructure::trade_log::TracingTradeLog;
use tradesync::rate_limit;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradesync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let queue_config = QueueConfig::from_env();
    let sync_config = SyncConfig::from_env();
    let server_config = ServerConfig::from_env();
    info!(
        "Starting trade execution core: {} orders per {:?}, {} retries",
        queue_config.max_requests_per_window, queue_config.rate_window, queue_config.max_retries
    );

    let synchronizer = Arc::new(BotSynchronizer::new(sync_config));
    let bridge = QueueSynchronizerBridge::with_builder(
        queue_config,
        Arc::new(PaperExecutor::new()),
        synchronizer.clone(),
        |builder| builder.log_sink(Arc::new(TracingTradeLog)),
    );
    bridge.start().await;

    let pruner = tokio::spawn(ledger_maintenance_task(synchronizer.clone()));

    let app = trade_handler::router(AppState::new(bridge.clone()));
    let app = rate_limit::with_rate_limit(app, &server_config).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([127, 0, 0, 1], server_config.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app);

    let shutdown_signal = async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    info!("Server started successfully. Press Ctrl+C to stop.");
    server.with_graceful_shutdown(shutdown_signal).await?;

    info!("Server shutting down gracefully...");
    pruner.abort();
    bridge.stop().await;

    let stats = bridge.queue().get_queue_stats().await;
    info!(
        "Shutdown complete: {} executed, {} failed, {} canceled",
        stats.executed, stats.failed, stats.canceled
    );
    Ok(())
}

/// Periodically drop ledger entries past retention
async fn ledger_maintenance_task(synchronizer: Arc<BotSynchronizer>) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));

    loop {
        interval.tick().await;
        let removed = synchronizer.prune_ledger().await;
        debug!("Ledger maintenance pass removed {} entries", removed);
    }
}

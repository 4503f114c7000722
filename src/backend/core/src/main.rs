//! Courier Server - Main entry point

use std::sync::Arc;
use std::time::Duration;

use courier_core::{
    api::{self, AppState},
    config::Config,
    jobs::QueueManager,
    telemetry::init_telemetry,
    webhooks::{InMemoryWebhookStore, PgWebhookStore, WebhookDispatcher},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = match std::env::var("COURIER_CONFIG_FILE") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };

    let telemetry = init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.telemetry.environment,
        "Starting Courier Server"
    );

    // Queue backend is fixed for the lifetime of the process
    let manager = Arc::new(
        QueueManager::from_config(config.redis.as_ref(), &config.queue)
            .await?
            .with_tracing_listener()
            .await,
    );
    tracing::info!(backend = %manager.backend_kind(), "Queue manager initialized");

    let dispatcher = match &config.database {
        Some(database) => {
            let store = Arc::new(PgWebhookStore::connect(database).await?);
            if database.run_migrations {
                store.migrate().await?;
                tracing::info!("Database migrations applied");
            }
            tracing::info!("Using PostgreSQL webhook store");
            WebhookDispatcher::new(store.clone(), store, manager.clone(), config.webhooks.clone())?
        }
        None => {
            tracing::warn!("No database configured, webhook subscriptions are kept in memory");
            let store = Arc::new(InMemoryWebhookStore::new());
            WebhookDispatcher::new(store.clone(), store, manager.clone(), config.webhooks.clone())?
        }
    };
    dispatcher.start().await?;

    let cleaner = match config.queue.clean_interval() {
        Some(period) => Some(spawn_cleaner(manager.clone(), period, &config)),
        None => {
            tracing::info!("Periodic queue cleaning disabled");
            None
        }
    };

    let app = api::build_router(AppState::new(dispatcher, telemetry.metrics));

    // Start server
    let addr = config.bind_addr();
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    if let Some(cleaner) = cleaner {
        cleaner.abort();
    }
    manager.shutdown().await?;
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Periodically purge old completed and failed jobs from every known queue.
fn spawn_cleaner(manager: Arc<QueueManager>, period: Duration, config: &Config) -> tokio::task::JoinHandle<()> {
    let targets = config.queue.clean_targets();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for queue in manager.queue_names().await {
                for (grace, status) in targets {
                    match manager.clean(&queue, grace, Some(status)).await {
                        Ok(0) => {}
                        Ok(removed) => tracing::info!(
                            queue = %queue,
                            status = status.as_str(),
                            removed,
                            "Cleaned old jobs"
                        ),
                        Err(e) => tracing::warn!(queue = %queue, error = %e, "Queue clean failed"),
                    }
                }
            }
        }
    })
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

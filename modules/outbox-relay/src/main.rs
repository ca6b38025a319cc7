use event_bus::retry::{retry_with_backoff, RetryConfig};
use event_bus::{InMemoryPublisher, JetStreamPublisher, MessagePublisher};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use outbox_relay_rs::{
    config::{BusType, Config},
    db,
    metrics::RelayMetrics,
    store::PgOutboxStore,
    OutboxWorker,
};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting outbox relay...");

    let config = Config::from_env().expect("Failed to load configuration from environment");

    tracing::info!(
        bus_type = ?config.bus_type,
        workers = config.workers,
        batch_size = config.batch_size,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        topic_prefix = %config.topic_prefix,
        "Configuration loaded"
    );

    // The relay may come up before the database does
    tracing::info!("Connecting to database...");
    let retry = RetryConfig {
        max_attempts: 10,
        initial_backoff: Duration::from_millis(500),
        max_backoff: config.max_backoff,
    };
    let pool = retry_with_backoff(
        || db::init_pool(&config.database_url, &config.pool),
        &retry,
        "connect_database",
    )
    .await
    .expect("Failed to connect to database");

    tracing::info!("Running migrations...");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let metrics = RelayMetrics::new().expect("Failed to register relay metrics");
    let store = PgOutboxStore::new(pool.clone());

    let mut workers = Vec::with_capacity(config.workers);
    for i in 0..config.workers {
        // One broker connection per worker
        let publisher: Arc<dyn MessagePublisher> = match config.bus_type {
            BusType::Nats => Arc::new(JetStreamPublisher::new(
                config.nats_url.clone(),
                config.jetstream_config(),
            )),
            BusType::InMemory => {
                tracing::warn!("Using InMemory publisher; events will not leave this process");
                Arc::new(InMemoryPublisher::new())
            }
        };

        let worker = Arc::new(
            OutboxWorker::new(
                format!("outbox-relay-{}", i),
                store.clone(),
                publisher,
                config.topic_router(),
                config.worker_config(),
            )
            .with_metrics(metrics.clone()),
        );
        workers.push(worker);
    }

    let handles: Vec<_> = workers
        .iter()
        .map(|worker| {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        })
        .collect();

    tracing::info!(workers = handles.len(), "Outbox relay running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }

    tracing::info!("Shutdown requested, finishing in-flight batches...");
    for worker in &workers {
        worker.stop();
    }

    let mut published = 0;
    let results = futures::future::join_all(handles).await;
    for (worker, result) in workers.iter().zip(results) {
        match result {
            Ok(summary) => published += summary.published,
            Err(e) => tracing::error!(
                worker_id = %worker.worker_id(),
                error = %e,
                "Outbox worker task panicked"
            ),
        }
    }

    pool.close().await;

    tracing::debug!(metrics = %metrics.render(), "Final relay metrics");
    tracing::info!(published, "Outbox relay stopped");
}

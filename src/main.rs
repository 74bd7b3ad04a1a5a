use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use trade_capture::application::TradeIngestService;
use trade_capture::infrastructure::logging::init_logging;
use trade_capture::infrastructure::schema::ensure_schema;
use trade_capture::infrastructure::{
    AppConfig, CaptureMetrics, KafkaTradePublisher, KafkaTradeSource, OutboxDispatcher,
    PartitionTracker, PostgresDeadLetterRepository, PostgresOutboxRepository, PostgresTradeStore,
    Shutdown, ShutdownSequence,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env()?;
    let _log_guard = init_logging(&config.logging)?;

    info!("Starting trade capture service");
    info!(
        "Ingest: max batch {}, flush interval {:?}, idempotency {:?}",
        config.ingest.batching.max_batch_size,
        config.ingest.batching.flush_interval,
        config.ingest.idempotency
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(config.database.acquire_timeout)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;
    ensure_schema(&pool).await?;

    let metrics = Arc::new(CaptureMetrics::default());
    let outbox_repo = Arc::new(PostgresOutboxRepository::new(pool.clone()));
    let trade_store = Arc::new(PostgresTradeStore::new(
        pool.clone(),
        outbox_repo.clone(),
        config.ingest.idempotency,
    ));
    let dead_letters = Arc::new(PostgresDeadLetterRepository::new(pool.clone()));

    let tracker = Arc::new(PartitionTracker::new());
    let source = Arc::new(KafkaTradeSource::new(&config.kafka, tracker)?);
    let committer = Arc::new(source.committer());

    let ingest = Arc::new(TradeIngestService::new(
        config.ingest.batching.clone(),
        trade_store,
        committer,
        dead_letters,
        metrics.clone(),
    ));
    ingest.start().await;

    let publisher = Arc::new(KafkaTradePublisher::new(&config.kafka)?);
    let dispatcher = Arc::new(OutboxDispatcher::new(
        outbox_repo,
        publisher,
        config.outbox.clone(),
        metrics.clone(),
    ));
    let dispatcher_handle = Arc::new(dispatcher.start());

    let consumer_token = CancellationToken::new();
    let consumer_task = {
        let ingest = ingest.clone();
        let source = source.clone();
        let token = consumer_token.clone();
        tokio::spawn(async move { ingest.consume(&source, token).await })
    };

    info!("✅ Trade capture service running");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    // Stop intake first so the drain sees a fixed set of messages.
    consumer_token.cancel();
    if let Err(e) = consumer_task.await {
        error!("Consumer task ended abnormally: {}", e);
    }

    let failures = ShutdownSequence::new()
        .then("ingest", ingest.clone() as Arc<dyn Shutdown>)
        .then("outbox dispatcher", dispatcher_handle as Arc<dyn Shutdown>)
        .run()
        .await;

    info!("Final metrics: {}", metrics.snapshot());
    pool.close().await;

    if failures > 0 {
        anyhow::bail!("{} components failed to shut down cleanly", failures);
    }
    Ok(())
}

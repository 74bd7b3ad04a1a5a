use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::{PendingMessage, StreamPosition, TradeEvent};
use crate::infrastructure::dead_letter::{DeadLetterEntry, DeadLetterSinkTrait};
use crate::infrastructure::kafka_abstraction::KafkaTradeSource;
use crate::infrastructure::metrics::CaptureMetrics;
use crate::infrastructure::offset_tracker::OffsetCommitter;
use crate::infrastructure::persistence_writer::{FlushOutcome, PersistenceWriter};
use crate::infrastructure::safe_store::TradeStoreTrait;
use crate::infrastructure::shutdown::Shutdown;
use crate::infrastructure::trade_batching::{BatchingConfig, FlushScheduler, PortfolioBatchingBuffer};

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What happened to one upstream record.
#[derive(Debug)]
pub enum Delivery {
    Buffered,
    /// The record filled its portfolio's queue and the flush ran inline.
    Flushed(FlushOutcome),
    DeadLettered,
}

/// Ingestion side of the pipeline: decode, buffer per portfolio, flush on
/// size or age, commit upstream progress after durability.
pub struct TradeIngestService {
    buffer: Arc<PortfolioBatchingBuffer>,
    scheduler: FlushScheduler,
    committer: Arc<dyn OffsetCommitter>,
    dead_letters: Arc<dyn DeadLetterSinkTrait>,
    metrics: Arc<CaptureMetrics>,
}

impl TradeIngestService {
    pub fn new(
        config: BatchingConfig,
        store: Arc<dyn TradeStoreTrait>,
        committer: Arc<dyn OffsetCommitter>,
        dead_letters: Arc<dyn DeadLetterSinkTrait>,
        metrics: Arc<CaptureMetrics>,
    ) -> Self {
        let writer = PersistenceWriter::new(store, metrics.clone());
        let buffer = Arc::new(PortfolioBatchingBuffer::new(
            config,
            writer,
            committer.clone(),
            metrics.clone(),
        ));
        let scheduler = FlushScheduler::new(buffer.clone());
        Self {
            buffer,
            scheduler,
            committer,
            dead_letters,
            metrics,
        }
    }

    /// Starts the time-based flush trigger.
    pub async fn start(&self) {
        self.scheduler.start().await;
    }

    pub fn buffer(&self) -> &Arc<PortfolioBatchingBuffer> {
        &self.buffer
    }

    pub fn metrics(&self) -> &Arc<CaptureMetrics> {
        &self.metrics
    }

    /// Buffers an already decoded trade.
    pub async fn add_message(&self, message: PendingMessage) -> Option<FlushOutcome> {
        CaptureMetrics::incr(&self.metrics.messages_received);
        self.committer
            .observe(message.position, Some(message.routing_key()));
        self.buffer.add_message(message).await
    }

    /// Entry point for raw upstream records. Undecodable input is
    /// dead-lettered so its partition keeps moving.
    pub async fn handle_payload(&self, payload: &[u8], position: StreamPosition) -> Delivery {
        match TradeEvent::decode(payload) {
            Ok(event) => {
                let message = PendingMessage::new(event, payload.to_vec(), position);
                match self.add_message(message).await {
                    Some(outcome) => Delivery::Flushed(outcome),
                    None => Delivery::Buffered,
                }
            }
            Err(e) => {
                CaptureMetrics::incr(&self.metrics.messages_received);
                self.dead_letter(payload, &e.to_string(), position).await;
                Delivery::DeadLettered
            }
        }
    }

    async fn dead_letter(&self, payload: &[u8], detail: &str, position: StreamPosition) {
        CaptureMetrics::incr(&self.metrics.messages_dead_lettered);
        self.committer.observe(position, None);

        let entry = DeadLetterEntry::new(payload, detail, Some(position));
        if let Err(e) = self.dead_letters.record(entry).await {
            error!(
                "Failed to dead-letter message at {} ({}): {:?}",
                position, detail, e
            );
        }

        if let Err(e) = self.committer.release(position).await {
            CaptureMetrics::incr(&self.metrics.offset_commit_failures);
            warn!("Offset commit after dead letter at {} failed: {}", position, e);
        }
    }

    /// Feeds records from `source` until `shutdown` fires. A record being
    /// handled when the signal arrives is finished first.
    pub async fn consume(&self, source: &KafkaTradeSource, shutdown: CancellationToken) {
        info!("🚀 Trade consumer loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = source.recv() => match received {
                    Ok(record) => {
                        self.handle_payload(&record.payload, record.position).await;
                    }
                    Err(e) => {
                        error!("Trade consumer receive error: {}", e);
                        tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                    }
                }
            }
        }
        info!("🛑 Trade consumer loop stopped");
    }
}

#[async_trait]
impl Shutdown for TradeIngestService {
    /// Stops the scheduler, then drains every queue.
    async fn shutdown(&self) -> Result<()> {
        self.scheduler.stop().await;

        let report = self.buffer.flush_all().await;
        let remaining = self.buffer.total_queued().await;
        if report.failed > 0 {
            warn!(
                "Drain finished with {} failed portfolios, {} messages left for redelivery",
                report.failed, remaining
            );
        }
        info!(
            "✅ Ingest drained: {} portfolios flushed on shutdown",
            report.flushed
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::dead_letter::InMemoryDeadLetterSink;
    use crate::infrastructure::memory_store::InMemoryTradeStore;
    use crate::infrastructure::offset_tracker::CommitError;
    use uuid::Uuid;

    #[derive(Default)]
    struct NoopCommitter;

    #[async_trait]
    impl OffsetCommitter for NoopCommitter {
        async fn commit(&self, _: Uuid, _: StreamPosition) -> Result<(), CommitError> {
            Ok(())
        }
    }

    fn service(store: Arc<InMemoryTradeStore>, dlq: Arc<InMemoryDeadLetterSink>) -> TradeIngestService {
        TradeIngestService::new(
            BatchingConfig::new(2, Duration::from_secs(60)),
            store,
            Arc::new(NoopCommitter),
            dlq,
            Arc::new(CaptureMetrics::default()),
        )
    }

    fn payload(portfolio_id: Uuid) -> Vec<u8> {
        serde_json::json!({
            "portfolioId": portfolio_id,
            "tradeId": Uuid::new_v4(),
            "symbol": "AAPL",
            "side": "BUY",
            "pricePerStock": 187.5,
            "quantity": 12,
            "timestamp": "2024-03-01T10:15:00Z"
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_valid_payloads_are_buffered_then_flushed() {
        let store = Arc::new(InMemoryTradeStore::default());
        let service = service(store.clone(), Arc::new(InMemoryDeadLetterSink::new()));
        let portfolio_id = Uuid::new_v4();

        let first = service
            .handle_payload(&payload(portfolio_id), StreamPosition::new(0, 0))
            .await;
        assert!(matches!(first, Delivery::Buffered));

        let second = service
            .handle_payload(&payload(portfolio_id), StreamPosition::new(0, 1))
            .await;
        assert!(matches!(second, Delivery::Flushed(ref outcome) if outcome.is_success()));
        assert_eq!(store.trades().await.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead_lettered() {
        let store = Arc::new(InMemoryTradeStore::default());
        let dlq = Arc::new(InMemoryDeadLetterSink::new());
        let service = service(store.clone(), dlq.clone());

        let delivery = service
            .handle_payload(b"{not json", StreamPosition::new(1, 7))
            .await;

        assert!(matches!(delivery, Delivery::DeadLettered));
        let entries = dlq.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].raw_message, b"{not json".to_vec());
        assert_eq!(entries[0].position, Some(StreamPosition::new(1, 7)));
        assert!(store.trades().await.is_empty());
        assert_eq!(CaptureMetrics::get(&service.metrics().messages_dead_lettered), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_partial_batches() {
        let store = Arc::new(InMemoryTradeStore::default());
        let service = service(store.clone(), Arc::new(InMemoryDeadLetterSink::new()));
        service.start().await;

        service
            .handle_payload(&payload(Uuid::new_v4()), StreamPosition::new(0, 0))
            .await;
        service
            .handle_payload(&payload(Uuid::new_v4()), StreamPosition::new(0, 1))
            .await;
        assert!(store.trades().await.is_empty());

        service.shutdown().await.unwrap();
        assert_eq!(store.trades().await.len(), 2);
        assert_eq!(service.buffer().total_queued().await, 0);
    }
}

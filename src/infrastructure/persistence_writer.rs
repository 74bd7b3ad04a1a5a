use crate::domain::{PendingMessage, StreamPosition, TradeBatch};
use crate::infrastructure::metrics::CaptureMetrics;
use crate::infrastructure::safe_store::{StoreError, TradeStoreTrait};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Result of one flush attempt for one routing key.
#[derive(Debug)]
pub enum FlushOutcome {
    /// The batch is durable. `highest` holds the last offset of every
    /// partition in the batch. `duplicates` counts trades that were already
    /// stored by an earlier flush.
    Persisted {
        highest: Vec<StreamPosition>,
        inserted: usize,
        duplicates: usize,
    },
    /// The store rejected the batch on the trade id constraint, meaning it was
    /// persisted before a restart. Treated as success.
    AlreadyDurable { highest: Vec<StreamPosition> },
    /// Nothing was written. The caller must requeue the batch.
    Failed { error: StoreError },
}

impl FlushOutcome {
    /// Positions the caller may commit upstream, one per partition. Empty
    /// after a failure.
    pub fn committable(&self) -> &[StreamPosition] {
        match self {
            FlushOutcome::Persisted { highest, .. } | FlushOutcome::AlreadyDurable { highest } => {
                highest
            }
            FlushOutcome::Failed { .. } => &[],
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, FlushOutcome::Failed { .. })
    }
}

/// Last offset of each partition present in `messages`, ordered by partition.
/// A routing key can span partitions when the topic is repartitioned.
fn highest_per_partition(messages: &[PendingMessage]) -> Vec<StreamPosition> {
    let mut highest: BTreeMap<i32, i64> = BTreeMap::new();
    for message in messages {
        let offset = highest
            .entry(message.position.partition)
            .or_insert(message.position.offset);
        *offset = (*offset).max(message.position.offset);
    }
    highest
        .into_iter()
        .map(|(partition, offset)| StreamPosition::new(partition, offset))
        .collect()
}

/// Turns one routing key's snapshot into a single atomic write.
#[derive(Clone)]
pub struct PersistenceWriter {
    store: Arc<dyn TradeStoreTrait>,
    metrics: Arc<CaptureMetrics>,
}

impl PersistenceWriter {
    pub fn new(store: Arc<dyn TradeStoreTrait>, metrics: Arc<CaptureMetrics>) -> Self {
        Self { store, metrics }
    }

    pub async fn write_batch(&self, routing_key: Uuid, messages: &[PendingMessage]) -> FlushOutcome {
        if messages.is_empty() {
            return FlushOutcome::Failed {
                error: StoreError::Unavailable("empty batch".to_string()),
            };
        }
        let highest = highest_per_partition(messages);

        let batch = TradeBatch::from_messages(messages);

        match self.store.persist_batch(&batch).await {
            Ok(report) => {
                CaptureMetrics::incr(&self.metrics.batches_flushed);
                CaptureMetrics::add(&self.metrics.records_persisted, report.inserted as u64);
                CaptureMetrics::add(&self.metrics.duplicate_records, report.duplicates as u64);
                if report.duplicates > 0 {
                    info!(
                        "Portfolio {}: {} of {} trades were already stored (replay)",
                        routing_key,
                        report.duplicates,
                        messages.len()
                    );
                }
                debug!(
                    "Portfolio {}: persisted {} trades up to {:?}",
                    routing_key, report.inserted, highest
                );
                FlushOutcome::Persisted {
                    highest,
                    inserted: report.inserted,
                    duplicates: report.duplicates,
                }
            }
            Err(e) if e.is_duplicate() => {
                CaptureMetrics::incr(&self.metrics.batches_flushed);
                CaptureMetrics::add(&self.metrics.duplicate_records, messages.len() as u64);
                info!(
                    "Portfolio {}: batch of {} up to {:?} already durable ({})",
                    routing_key,
                    messages.len(),
                    highest,
                    e
                );
                FlushOutcome::AlreadyDurable { highest }
            }
            Err(e) => {
                CaptureMetrics::incr(&self.metrics.flush_failures);
                error!(
                    "Portfolio {}: failed to persist batch of {} up to {:?}: {}",
                    routing_key,
                    messages.len(),
                    highest,
                    e
                );
                FlushOutcome::Failed { error: e }
            }
        }
    }
}

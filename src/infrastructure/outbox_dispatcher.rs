use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::infrastructure::kafka_abstraction::TradePublisherTrait;
use crate::infrastructure::metrics::CaptureMetrics;
use crate::infrastructure::outbox::OutboxRepositoryTrait;
use crate::infrastructure::shutdown::Shutdown;

#[derive(Clone, Debug)]
pub struct OutboxDispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// Pause after the outbox table itself could not be read or updated.
    pub error_backoff: Duration,
    pub topic: String,
}

impl Default for OutboxDispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            error_backoff: Duration::from_secs(1),
            topic: "raw-trades".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub fetched: usize,
    pub sent: usize,
    pub failed: usize,
    /// Rows skipped because an earlier row of the same portfolio failed in
    /// this cycle.
    pub deferred: usize,
}

/// Drains PENDING outbox rows to the downstream bus.
///
/// Rows go out one at a time in creation order. Once a row fails, later rows
/// of the same portfolio wait for the next cycle so they cannot overtake it.
/// There is no attempt ceiling: a row stays PENDING until the bus accepts it.
pub struct OutboxDispatcher {
    outbox_repo: Arc<dyn OutboxRepositoryTrait>,
    publisher: Arc<dyn TradePublisherTrait>,
    config: OutboxDispatcherConfig,
    metrics: Arc<CaptureMetrics>,
}

impl OutboxDispatcher {
    pub fn new(
        outbox_repo: Arc<dyn OutboxRepositoryTrait>,
        publisher: Arc<dyn TradePublisherTrait>,
        config: OutboxDispatcherConfig,
        metrics: Arc<CaptureMetrics>,
    ) -> Self {
        Self {
            outbox_repo,
            publisher,
            config,
            metrics,
        }
    }

    /// One poll cycle. Stops between rows once `shutdown` fires; a publish
    /// that already started is awaited.
    pub async fn dispatch_once(&self, shutdown: &CancellationToken) -> Result<DispatchStats> {
        let rows = self.outbox_repo.fetch_pending(self.config.batch_size).await?;
        let mut stats = DispatchStats {
            fetched: rows.len(),
            ..Default::default()
        };
        let mut blocked: HashSet<Uuid> = HashSet::new();

        for row in rows {
            if shutdown.is_cancelled() {
                break;
            }
            if blocked.contains(&row.portfolio_id) {
                stats.deferred += 1;
                continue;
            }

            let key = row.portfolio_id.to_string();
            match self
                .publisher
                .publish(&self.config.topic, &key, &row.payload)
                .await
            {
                Ok(()) => {
                    self.outbox_repo.mark_sent(row.id).await?;
                    CaptureMetrics::incr(&self.metrics.outbox_sent);
                    stats.sent += 1;
                }
                Err(e) => {
                    CaptureMetrics::incr(&self.metrics.outbox_publish_failures);
                    warn!(
                        "Outbox row {} (trade {}, attempt {}) failed to publish: {}",
                        row.id,
                        row.trade_id,
                        row.attempts + 1,
                        e
                    );
                    blocked.insert(row.portfolio_id);
                    stats.failed += 1;
                    self.outbox_repo.increment_attempts(row.id).await?;
                }
            }
        }

        if stats.fetched > 0 {
            debug!("Outbox cycle: {:?}", stats);
        }
        Ok(stats)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "OutboxDispatcher started with config: {:?}",
            self.config
        );

        while !shutdown.is_cancelled() {
            let pause = match self.dispatch_once(&shutdown).await {
                Ok(stats) if stats.sent > 0 => None,
                Ok(_) => Some(self.config.poll_interval),
                Err(e) => {
                    error!("OutboxDispatcher: outbox store error: {:?}", e);
                    Some(self.config.error_backoff)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(pause) => {}
                }
            }
        }

        info!("OutboxDispatcher received shutdown signal. Exiting.");
    }

    pub fn start(self: Arc<Self>) -> DispatcherHandle {
        let shutdown_token = CancellationToken::new();
        let token = shutdown_token.clone();
        let handle = tokio::spawn(async move { self.run(token).await });
        DispatcherHandle {
            shutdown_token,
            handle: Mutex::new(Some(handle)),
        }
    }
}

pub struct DispatcherHandle {
    shutdown_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Shutdown for DispatcherHandle {
    async fn shutdown(&self) -> Result<()> {
        self.shutdown_token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            handle.await?;
        }
        info!("✅ Outbox dispatcher stopped");
        Ok(())
    }
}

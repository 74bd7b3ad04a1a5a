use crate::domain::PendingMessage;
use crate::infrastructure::metrics::CaptureMetrics;
use crate::infrastructure::offset_tracker::OffsetCommitter;
use crate::infrastructure::persistence_writer::{FlushOutcome, PersistenceWriter};
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MIN_SCHEDULER_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct BatchingConfig {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    pub scheduler_period: Duration,
    /// Empty routing keys untouched for this long are dropped from the registry.
    pub idle_slot_ttl: Duration,
}

impl BatchingConfig {
    /// Scheduler runs at half the flush interval so an aged queue waits at
    /// most two ticks.
    pub fn new(max_batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            max_batch_size,
            flush_interval,
            scheduler_period: (flush_interval / 2).max(MIN_SCHEDULER_PERIOD),
            idle_slot_ttl: Duration::from_secs(300),
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self::new(100, Duration::from_millis(200))
    }
}

struct PortfolioQueue {
    messages: VecDeque<PendingMessage>,
    oldest_unflushed: Option<Instant>,
    last_activity: Instant,
}

impl PortfolioQueue {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            oldest_unflushed: None,
            last_activity: Instant::now(),
        }
    }

    fn is_old(&self, now: Instant, max_age: Duration) -> bool {
        !self.messages.is_empty()
            && self
                .oldest_unflushed
                .map_or(false, |oldest| now.saturating_duration_since(oldest) >= max_age)
    }
}

/// One routing key's queue. `queue` guards appends and snapshots and is never
/// held across I/O. `flush_gate` serializes flushes of the key so a later
/// batch cannot reach the store before an earlier one.
struct PortfolioSlot {
    queue: Mutex<PortfolioQueue>,
    flush_gate: Mutex<()>,
}

impl PortfolioSlot {
    fn new() -> Self {
        Self {
            queue: Mutex::new(PortfolioQueue::new()),
            flush_gate: Mutex::new(()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub flushed: usize,
    pub failed: usize,
}

/// Per-portfolio buffer of messages waiting to be persisted.
///
/// Locking is per routing key: producers for different portfolios never
/// contend. A full queue flushes inline on the producer, which is the only
/// backpressure towards the upstream consumer.
pub struct PortfolioBatchingBuffer {
    config: BatchingConfig,
    slots: DashMap<Uuid, Arc<PortfolioSlot>>,
    writer: PersistenceWriter,
    committer: Arc<dyn OffsetCommitter>,
    metrics: Arc<CaptureMetrics>,
}

impl PortfolioBatchingBuffer {
    pub fn new(
        config: BatchingConfig,
        writer: PersistenceWriter,
        committer: Arc<dyn OffsetCommitter>,
        metrics: Arc<CaptureMetrics>,
    ) -> Self {
        Self {
            config,
            slots: DashMap::new(),
            writer,
            committer,
            metrics,
        }
    }

    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    fn slot(&self, routing_key: Uuid) -> Arc<PortfolioSlot> {
        self.slots
            .entry(routing_key)
            .or_insert_with(|| Arc::new(PortfolioSlot::new()))
            .clone()
    }

    fn existing_slot(&self, routing_key: Uuid) -> Option<Arc<PortfolioSlot>> {
        self.slots.get(&routing_key).map(|slot| slot.clone())
    }

    fn snapshot_slots(&self) -> Vec<(Uuid, Arc<PortfolioSlot>)> {
        self.slots
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Appends a message to its portfolio's queue. When the queue reaches the
    /// maximum batch size the flush runs before this returns.
    pub async fn add_message(&self, message: PendingMessage) -> Option<FlushOutcome> {
        let routing_key = message.routing_key();
        let slot = self.slot(routing_key);

        let full = {
            let mut queue = slot.queue.lock().await;
            let now = Instant::now();
            queue.messages.push_back(message);
            queue.oldest_unflushed.get_or_insert(now);
            queue.last_activity = now;
            queue.messages.len() >= self.config.max_batch_size
        };

        if full {
            debug!("Portfolio {}: size trigger reached", routing_key);
            self.flush_key(routing_key).await
        } else {
            None
        }
    }

    /// Persists everything queued for `routing_key`, at most `max_batch_size`
    /// messages per write. Stops at the first failed write, which is requeued.
    /// Returns the last outcome, or `None` when the queue was already empty.
    pub async fn flush_key(&self, routing_key: Uuid) -> Option<FlushOutcome> {
        let slot = self.existing_slot(routing_key)?;
        let _gate = slot.flush_gate.lock().await;

        let mut last = None;
        loop {
            let (batch, oldest) = {
                let mut queue = slot.queue.lock().await;
                if queue.messages.is_empty() {
                    break;
                }
                let take = queue.messages.len().min(self.config.max_batch_size.max(1));
                let batch: Vec<PendingMessage> = queue.messages.drain(..take).collect();
                let oldest = queue.oldest_unflushed;
                if queue.messages.is_empty() {
                    queue.oldest_unflushed = None;
                }
                (batch, oldest)
            };

            let outcome = self.writer.write_batch(routing_key, &batch).await;

            if !outcome.is_success() {
                let requeued = batch.len();
                let mut queue = slot.queue.lock().await;
                for message in batch.into_iter().rev() {
                    queue.messages.push_front(message);
                }
                // Messages that arrived during the write are younger than the batch.
                queue.oldest_unflushed = oldest.or(queue.oldest_unflushed);
                warn!(
                    "Portfolio {}: requeued {} messages after failed flush ({} queued)",
                    routing_key,
                    requeued,
                    queue.messages.len()
                );
                return Some(outcome);
            }

            for position in outcome.committable() {
                match self.committer.commit(routing_key, *position).await {
                    Ok(()) => CaptureMetrics::incr(&self.metrics.offsets_committed),
                    Err(e) => {
                        CaptureMetrics::incr(&self.metrics.offset_commit_failures);
                        warn!(
                            "Portfolio {}: offset commit at {} failed, replay window grows: {}",
                            routing_key, position, e
                        );
                    }
                }
            }
            last = Some(outcome);
        }

        last
    }

    /// Flushes every portfolio whose oldest unflushed message is at least
    /// `flush_interval` old. Returns the number of flushes attempted.
    pub async fn flush_due(&self, now: Instant) -> usize {
        let mut due = Vec::new();
        for (routing_key, slot) in self.snapshot_slots() {
            if slot.queue.lock().await.is_old(now, self.config.flush_interval) {
                due.push(routing_key);
            }
        }

        let attempted = due.len();
        join_all(due.into_iter().map(|routing_key| self.flush_key(routing_key))).await;
        attempted
    }

    /// Flushes every non-empty queue. Used on shutdown.
    pub async fn flush_all(&self) -> DrainReport {
        let keys: Vec<Uuid> = self.slots.iter().map(|entry| *entry.key()).collect();
        let outcomes = join_all(keys.into_iter().map(|routing_key| self.flush_key(routing_key))).await;

        let mut report = DrainReport::default();
        for outcome in outcomes.into_iter().flatten() {
            if outcome.is_success() {
                report.flushed += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    /// Drops empty slots idle for longer than `idle_slot_ttl`. A slot that is
    /// referenced by an in-progress add or flush is kept.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let ttl = self.config.idle_slot_ttl;
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.queue.try_lock() {
                Ok(queue) => {
                    !queue.messages.is_empty()
                        || now.saturating_duration_since(queue.last_activity) < ttl
                }
                Err(_) => true,
            }
        });
        before.saturating_sub(self.slots.len())
    }

    pub async fn queued_len(&self, routing_key: Uuid) -> usize {
        match self.existing_slot(routing_key) {
            Some(slot) => slot.queue.lock().await.messages.len(),
            None => 0,
        }
    }

    pub async fn total_queued(&self) -> usize {
        let mut total = 0;
        for (_, slot) in self.snapshot_slots() {
            total += slot.queue.lock().await.messages.len();
        }
        total
    }

    pub fn routing_keys(&self) -> usize {
        self.slots.len()
    }
}

/// Background task that applies the time trigger.
pub struct FlushScheduler {
    buffer: Arc<PortfolioBatchingBuffer>,
    shutdown_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FlushScheduler {
    pub fn new(buffer: Arc<PortfolioBatchingBuffer>) -> Self {
        Self {
            buffer,
            shutdown_token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }

        let buffer = self.buffer.clone();
        let shutdown_token = self.shutdown_token.clone();
        let period = buffer.config().scheduler_period;
        info!("🚀 Starting flush scheduler (period {:?})", period);

        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = Instant::now();
                        let flushed = buffer.flush_due(now).await;
                        if flushed > 0 {
                            debug!("Flush scheduler tick: {} portfolios due", flushed);
                        }
                        let evicted = buffer.evict_idle(now);
                        if evicted > 0 {
                            debug!("Flush scheduler evicted {} idle portfolios", evicted);
                        }
                    }
                    _ = shutdown_token.cancelled() => {
                        info!("🛑 Flush scheduler shutdown signal received");
                        break;
                    }
                }
            }
        }));
    }

    /// Signals the loop and waits for an in-progress tick to finish.
    pub async fn stop(&self) {
        self.shutdown_token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Flush scheduler task ended abnormally: {}", e);
            }
        }
        info!("✅ Flush scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.handle.lock().await.is_some()
    }
}

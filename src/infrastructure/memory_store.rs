use crate::domain::{OutboxRecord, OutboxStatus, SafeStoreRecord, TradeBatch};
use crate::infrastructure::outbox::OutboxRepositoryTrait;
use crate::infrastructure::safe_store::{IdempotencyMode, PersistReport, StoreError, TradeStoreTrait};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    trades: Vec<SafeStoreRecord>,
    trade_ids: HashSet<Uuid>,
    outbox: Vec<OutboxRecord>,
    next_outbox_id: i64,
}

/// Transactional stand-in for the PostgreSQL tables. A batch is applied under
/// one lock so it becomes visible all at once, and the same idempotency rules
/// apply as in `PostgresTradeStore`.
pub struct InMemoryTradeStore {
    state: Mutex<MemoryState>,
    mode: IdempotencyMode,
    failures_remaining: AtomicUsize,
    persist_calls: AtomicUsize,
}

impl Default for InMemoryTradeStore {
    fn default() -> Self {
        Self::new(IdempotencyMode::PerRecord)
    }
}

impl InMemoryTradeStore {
    pub fn new(mode: IdempotencyMode) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            mode,
            failures_remaining: AtomicUsize::new(0),
            persist_calls: AtomicUsize::new(0),
        }
    }

    /// The next `count` persist calls fail as if the database were down.
    pub fn fail_next_persists(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    /// All safe-store rows in creation order.
    pub async fn trades(&self) -> Vec<SafeStoreRecord> {
        self.state.lock().await.trades.clone()
    }

    pub async fn contains_trade(&self, trade_id: Uuid) -> bool {
        self.state.lock().await.trade_ids.contains(&trade_id)
    }

    /// All outbox rows in creation order.
    pub async fn outbox(&self) -> Vec<OutboxRecord> {
        self.state.lock().await.outbox.clone()
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TradeStoreTrait for InMemoryTradeStore {
    async fn persist_batch(&self, batch: &TradeBatch) -> Result<PersistReport, StoreError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_injected_failure() {
            return Err(StoreError::Unavailable(
                "simulated store outage".to_string(),
            ));
        }

        let mut state = self.state.lock().await;

        if self.mode == IdempotencyMode::WholeBatch {
            if let Some(duplicate) = batch
                .trades
                .iter()
                .find(|trade| state.trade_ids.contains(&trade.trade_id))
            {
                return Err(StoreError::DuplicateTrade(format!(
                    "trade_id {} already exists",
                    duplicate.trade_id
                )));
            }
        }

        let mut report = PersistReport::default();
        let now = Utc::now();
        for (trade, outbox) in batch.trades.iter().zip(batch.outbox.iter()) {
            if !state.trade_ids.insert(trade.trade_id) {
                report.duplicates += 1;
                continue;
            }
            state.trades.push(trade.clone());
            state.next_outbox_id += 1;
            let id = state.next_outbox_id;
            state.outbox.push(OutboxRecord {
                id,
                created_at: now,
                portfolio_id: outbox.portfolio_id,
                trade_id: outbox.trade_id,
                payload: outbox.payload.clone(),
                status: OutboxStatus::Pending,
                attempts: 0,
            });
            report.inserted += 1;
        }
        Ok(report)
    }

    async fn list_trades(&self, portfolio_id: Uuid) -> Result<Vec<SafeStoreRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .trades
            .iter()
            .filter(|trade| trade.portfolio_id == portfolio_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OutboxRepositoryTrait for InMemoryTradeStore {
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxRecord>> {
        let state = self.state.lock().await;
        let mut pending: Vec<OutboxRecord> = state
            .outbox
            .iter()
            .filter(|record| record.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|record| (record.created_at, record.id));
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn mark_sent(&self, id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.outbox.iter_mut().find(|record| record.id == id) {
            record.status = OutboxStatus::Sent;
        }
        Ok(())
    }

    async fn increment_attempts(&self, id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state
            .outbox
            .iter_mut()
            .find(|record| record.id == id && record.status == OutboxStatus::Pending)
        {
            record.attempts += 1;
        }
        Ok(())
    }

    async fn count_by_status(&self, status: OutboxStatus) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|record| record.status == status)
            .count() as i64)
    }
}

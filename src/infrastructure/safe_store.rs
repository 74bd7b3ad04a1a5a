use crate::domain::{SafeStoreRecord, TradeBatch, TradeSide};
use crate::infrastructure::outbox::PostgresOutboxRepository;
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// PostgreSQL accepts at most `u16::MAX` bind parameters per statement and a
/// safe-store row binds eight.
pub const MAX_ROWS_PER_INSERT: usize = u16::MAX as usize / 8;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The unique constraint on trade id rejected the batch.
    #[error("Duplicate trade id in batch: {0}")]
    DuplicateTrade(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateTrade(_))
    }

    fn classify(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
                StoreError::DuplicateTrade(db_error.message().to_string())
            }
            _ => StoreError::Database(error),
        }
    }
}

/// How a flush treats trade ids that are already in the safe store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyMode {
    /// Already-stored trades are skipped row by row; only new trades get an
    /// outbox row.
    #[default]
    PerRecord,
    /// Any duplicate rejects the whole insert and the batch is reported as a
    /// duplicate.
    WholeBatch,
}

impl FromStr for IdempotencyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "per_record" | "per-record" => Ok(IdempotencyMode::PerRecord),
            "whole_batch" | "whole-batch" => Ok(IdempotencyMode::WholeBatch),
            other => Err(format!("unknown idempotency mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersistReport {
    pub inserted: usize,
    pub duplicates: usize,
}

#[async_trait]
pub trait TradeStoreTrait: Send + Sync {
    /// Writes the safe-store rows and their outbox rows in one transaction.
    /// Either everything new in the batch becomes durable or nothing does.
    async fn persist_batch(&self, batch: &TradeBatch) -> Result<PersistReport, StoreError>;

    /// Safe-store rows of one portfolio in creation order.
    async fn list_trades(&self, portfolio_id: Uuid) -> Result<Vec<SafeStoreRecord>, StoreError>;
}

#[derive(Clone)]
pub struct PostgresTradeStore {
    pool: PgPool,
    outbox: Arc<PostgresOutboxRepository>,
    mode: IdempotencyMode,
}

impl PostgresTradeStore {
    pub fn new(pool: PgPool, outbox: Arc<PostgresOutboxRepository>, mode: IdempotencyMode) -> Self {
        Self { pool, outbox, mode }
    }

    fn map_row(row: &PgRow) -> Result<SafeStoreRecord, StoreError> {
        let side: String = row.try_get("side")?;
        Ok(SafeStoreRecord {
            received_at: row.try_get("received_at")?,
            portfolio_id: row.try_get("portfolio_id")?,
            trade_id: row.try_get("trade_id")?,
            symbol: row.try_get("symbol")?,
            side: TradeSide::from_str(&side)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?,
            price: row.try_get("price")?,
            quantity: row.try_get("quantity")?,
            event_time: row.try_get("event_time")?,
        })
    }
}

#[async_trait]
impl TradeStoreTrait for PostgresTradeStore {
    async fn persist_batch(&self, batch: &TradeBatch) -> Result<PersistReport, StoreError> {
        if batch.is_empty() {
            return Ok(PersistReport::default());
        }

        let mut tx = self.pool.begin().await?;

        let mut inserted = HashSet::with_capacity(batch.len());
        for chunk in batch.trades.chunks(MAX_ROWS_PER_INSERT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO safe_store_trade \
                 (received_at, portfolio_id, trade_id, symbol, side, price, quantity, event_time) ",
            );
            builder.push_values(chunk, |mut row, trade| {
                row.push_bind(trade.received_at)
                    .push_bind(trade.portfolio_id)
                    .push_bind(trade.trade_id)
                    .push_bind(trade.symbol.as_str())
                    .push_bind(trade.side.as_str())
                    .push_bind(trade.price)
                    .push_bind(trade.quantity)
                    .push_bind(trade.event_time);
            });
            if self.mode == IdempotencyMode::PerRecord {
                builder.push(" ON CONFLICT (trade_id) DO NOTHING");
            }
            builder.push(" RETURNING trade_id");

            let rows = builder
                .build()
                .fetch_all(&mut *tx)
                .await
                .map_err(StoreError::classify)?;
            for row in &rows {
                inserted.insert(row.try_get::<Uuid, _>("trade_id")?);
            }
        }

        // Replayed trades already own an outbox row from their first flush.
        // A trade repeated inside the batch gets a single row.
        let mut awaiting_outbox = inserted.clone();
        let outbox: Vec<_> = batch
            .outbox
            .iter()
            .filter(|record| awaiting_outbox.remove(&record.trade_id))
            .cloned()
            .collect();

        self.outbox
            .add_pending_records(&mut tx, &outbox)
            .await
            .map_err(StoreError::classify)?;

        tx.commit().await?;

        let report = PersistReport {
            inserted: inserted.len(),
            duplicates: batch.len() - inserted.len(),
        };
        debug!(
            "Persisted batch of {} trades: {} inserted, {} duplicates",
            batch.len(),
            report.inserted,
            report.duplicates
        );
        Ok(report)
    }

    async fn list_trades(&self, portfolio_id: Uuid) -> Result<Vec<SafeStoreRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT received_at, portfolio_id, trade_id, symbol, side, price, quantity, event_time
            FROM safe_store_trade
            WHERE portfolio_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(portfolio_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::map_row).collect()
    }
}

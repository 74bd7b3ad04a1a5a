use crate::domain::{NewOutboxRecord, OutboxRecord, OutboxStatus};
use crate::infrastructure::safe_store::MAX_ROWS_PER_INSERT;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};

#[async_trait]
pub trait OutboxRepositoryTrait: Send + Sync {
    /// Fetches up to `limit` PENDING rows, oldest first. Rows created in the
    /// same transaction share `created_at`; the identity id breaks the tie in
    /// insertion order.
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxRecord>>;

    /// PENDING -> SENT. A row that is already SENT is left untouched.
    async fn mark_sent(&self, id: i64) -> Result<()>;

    /// Records a failed publish. The row stays PENDING.
    async fn increment_attempts(&self, id: i64) -> Result<()>;

    async fn count_by_status(&self, status: OutboxStatus) -> Result<i64>;
}

#[derive(Clone)]
pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts outbox rows inside the caller's transaction, in slice order.
    pub async fn add_pending_records(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        records: &[NewOutboxRecord],
    ) -> Result<(), sqlx::Error> {
        if records.is_empty() {
            return Ok(());
        }

        for chunk in records.chunks(MAX_ROWS_PER_INSERT) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO outbox_event (portfolio_id, trade_id, payload) ");
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.portfolio_id)
                    .push_bind(record.trade_id)
                    .push_bind(record.payload.as_slice());
            });
            builder.build().execute(&mut **tx).await?;
        }
        Ok(())
    }

    fn map_row(row: &PgRow) -> Result<OutboxRecord> {
        let status: String = row.try_get("status")?;
        Ok(OutboxRecord {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            portfolio_id: row.try_get("portfolio_id")?,
            trade_id: row.try_get("trade_id")?,
            payload: row.try_get("payload")?,
            status: status.parse()?,
            attempts: row.try_get("attempts")?,
        })
    }
}

#[async_trait]
impl OutboxRepositoryTrait for PostgresOutboxRepository {
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, created_at, portfolio_id, trade_id, payload, status, attempts
            FROM outbox_event
            WHERE status = 'PENDING'
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch pending outbox rows")?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn mark_sent(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE outbox_event SET status = 'SENT' WHERE id = $1 AND status = 'PENDING'")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to mark outbox row {} as SENT", id))?;
        Ok(())
    }

    async fn increment_attempts(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE outbox_event SET attempts = attempts + 1 WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record failed attempt for outbox row {}", id))?;
        Ok(())
    }

    async fn count_by_status(&self, status: OutboxStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_event WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

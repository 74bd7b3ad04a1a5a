use crate::domain::StreamPosition;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// A payload that could not be turned into a trade.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub failed_at: DateTime<Utc>,
    pub raw_message: Vec<u8>,
    pub error_detail: String,
    pub position: Option<StreamPosition>,
}

impl DeadLetterEntry {
    pub fn new(raw_message: &[u8], error_detail: impl Into<String>, position: Option<StreamPosition>) -> Self {
        Self {
            id: Uuid::new_v4(),
            failed_at: Utc::now(),
            raw_message: raw_message.to_vec(),
            error_detail: error_detail.into(),
            position,
        }
    }
}

/// Poison-message sink. Malformed input lands here instead of stalling its
/// partition.
#[async_trait]
pub trait DeadLetterSinkTrait: Send + Sync {
    async fn record(&self, entry: DeadLetterEntry) -> Result<()>;
}

#[derive(Clone)]
pub struct PostgresDeadLetterRepository {
    pool: PgPool,
}

impl PostgresDeadLetterRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterSinkTrait for PostgresDeadLetterRepository {
    async fn record(&self, entry: DeadLetterEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dlq_entry (id, failed_at, raw_message, error_detail, source_partition, source_offset)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.failed_at)
        .bind(&entry.raw_message)
        .bind(&entry.error_detail)
        .bind(entry.position.map(|p| p.partition))
        .bind(entry.position.map(|p| p.offset))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to store dead letter {}", entry.id))?;

        warn!(
            "Dead-lettered message at {:?}: {}",
            entry.position, entry.error_detail
        );
        Ok(())
    }
}

/// Keeps dead letters in memory. Used by tests and local runs without a
/// database.
#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterSinkTrait for InMemoryDeadLetterSink {
    async fn record(&self, entry: DeadLetterEntry) -> Result<()> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

/// DDL for the capture tables. Every statement is idempotent so the service
/// can run it on each start.
const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS safe_store_trade (
        id            BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        received_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        portfolio_id  UUID NOT NULL,
        trade_id      UUID NOT NULL,
        symbol        TEXT NOT NULL,
        side          TEXT NOT NULL CHECK (side IN ('BUY', 'SELL')),
        price         NUMERIC(20, 8) NOT NULL,
        quantity      BIGINT NOT NULL,
        event_time    TIMESTAMPTZ NOT NULL,
        CONSTRAINT safe_store_trade_trade_id_key UNIQUE (trade_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_safe_store_trade_portfolio
        ON safe_store_trade (portfolio_id, id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox_event (
        id            BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        portfolio_id  UUID NOT NULL,
        trade_id      UUID NOT NULL,
        payload       BYTEA NOT NULL,
        status        TEXT NOT NULL DEFAULT 'PENDING' CHECK (status IN ('PENDING', 'SENT')),
        attempts      INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_event_pending
        ON outbox_event (created_at, id)
        WHERE status = 'PENDING'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dlq_entry (
        id                UUID PRIMARY KEY,
        failed_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        raw_message       BYTEA NOT NULL,
        error_detail      TEXT,
        source_partition  INTEGER,
        source_offset     BIGINT
    )
    "#,
];

pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to apply schema statement: {}", statement.trim()))?;
    }
    info!("Trade capture schema is up to date");
    Ok(())
}

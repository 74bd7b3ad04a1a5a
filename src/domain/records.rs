use crate::domain::trade::{PendingMessage, TradeError, TradeEvent, TradeSide};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Append-only audit row in `safe_store_trade`. One per trade id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeStoreRecord {
    pub received_at: DateTime<Utc>,
    pub portfolio_id: Uuid,
    pub trade_id: Uuid,
    pub symbol: String,
    pub side: TradeSide,
    pub price: Decimal,
    pub quantity: i64,
    pub event_time: DateTime<Utc>,
}

impl SafeStoreRecord {
    pub fn from_event(event: &TradeEvent, received_at: DateTime<Utc>) -> Self {
        Self {
            received_at,
            portfolio_id: event.portfolio_id,
            trade_id: event.trade_id,
            symbol: event.symbol.clone(),
            side: event.side,
            price: event.price,
            quantity: event.quantity,
            event_time: event.event_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    Pending,
    Sent,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sent => "SENT",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "SENT" => Ok(OutboxStatus::Sent),
            other => Err(TradeError::MalformedPayload(format!(
                "unknown outbox status {}",
                other
            ))),
        }
    }
}

/// Outbox row to be inserted alongside its safe-store row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxRecord {
    pub portfolio_id: Uuid,
    pub trade_id: Uuid,
    pub payload: Vec<u8>,
}

impl NewOutboxRecord {
    pub fn from_message(message: &PendingMessage) -> Self {
        Self {
            portfolio_id: message.event.portfolio_id,
            trade_id: message.event.trade_id,
            payload: message.payload.clone(),
        }
    }
}

/// Outbox row as read back by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub portfolio_id: Uuid,
    pub trade_id: Uuid,
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub attempts: i32,
}

/// Both halves of one flush, built 1:1 from the buffered messages.
#[derive(Debug, Clone, Default)]
pub struct TradeBatch {
    pub trades: Vec<SafeStoreRecord>,
    pub outbox: Vec<NewOutboxRecord>,
}

impl TradeBatch {
    pub fn from_messages(messages: &[PendingMessage]) -> Self {
        let mut batch = TradeBatch {
            trades: Vec::with_capacity(messages.len()),
            outbox: Vec::with_capacity(messages.len()),
        };
        for message in messages {
            batch
                .trades
                .push(SafeStoreRecord::from_event(&message.event, message.received_at));
            batch.outbox.push(NewOutboxRecord::from_message(message));
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }
}

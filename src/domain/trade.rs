use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum TradeError {
    #[error("Malformed trade payload: {0}")]
    MalformedPayload(String),
    #[error("Invalid trade {trade_id}: {reason}")]
    InvalidTrade { trade_id: Uuid, reason: String },
    #[error("Unknown trade side: {0}")]
    UnknownSide(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeSide {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            other => Err(TradeError::UnknownSide(other.to_string())),
        }
    }
}

/// A trade as produced upstream. Immutable once received.
///
/// Field aliases accept the simulator's camelCase layout (`pricePerStock`,
/// `timestamp`) as well as the snake_case names used here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    #[serde(alias = "portfolio_id")]
    pub portfolio_id: Uuid,
    #[serde(alias = "trade_id")]
    pub trade_id: Uuid,
    pub symbol: String,
    pub side: TradeSide,
    #[serde(alias = "pricePerStock", alias = "price_per_stock")]
    pub price: Decimal,
    pub quantity: i64,
    #[serde(alias = "timestamp", alias = "event_time")]
    pub event_time: DateTime<Utc>,
}

impl TradeEvent {
    pub fn decode(payload: &[u8]) -> Result<Self, TradeError> {
        let event: TradeEvent = serde_json::from_slice(payload)
            .map_err(|e| TradeError::MalformedPayload(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    pub fn encode(&self) -> Result<Vec<u8>, TradeError> {
        serde_json::to_vec(self).map_err(|e| TradeError::MalformedPayload(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), TradeError> {
        let invalid = |reason: &str| TradeError::InvalidTrade {
            trade_id: self.trade_id,
            reason: reason.to_string(),
        };

        if self.symbol.trim().is_empty() {
            return Err(invalid("symbol is empty"));
        }
        if self.quantity <= 0 {
            return Err(invalid("quantity must be positive"));
        }
        if self.price <= Decimal::ZERO {
            return Err(invalid("price must be positive"));
        }
        Ok(())
    }

    /// The ordering key shared by the upstream stream and the downstream bus.
    pub fn routing_key(&self) -> Uuid {
        self.portfolio_id
    }
}

/// Position of a message inside one upstream partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamPosition {
    pub partition: i32,
    pub offset: i64,
}

impl StreamPosition {
    pub fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// A received trade waiting in memory for its batch to be flushed.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub event: TradeEvent,
    pub payload: Vec<u8>,
    pub position: StreamPosition,
    pub received_at: DateTime<Utc>,
}

impl PendingMessage {
    pub fn new(event: TradeEvent, payload: Vec<u8>, position: StreamPosition) -> Self {
        Self {
            event,
            payload,
            position,
            received_at: Utc::now(),
        }
    }

    pub fn routing_key(&self) -> Uuid {
        self.event.portfolio_id
    }

    pub fn offset(&self) -> i64 {
        self.position.offset
    }
}

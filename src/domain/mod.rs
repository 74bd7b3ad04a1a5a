pub mod records;
pub mod trade;

pub use records::{NewOutboxRecord, OutboxRecord, OutboxStatus, SafeStoreRecord, TradeBatch};
pub use trade::{PendingMessage, StreamPosition, TradeError, TradeEvent, TradeSide};

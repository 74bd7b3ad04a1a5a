pub mod application;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{Delivery, TradeIngestService};
pub use domain::{PendingMessage, StreamPosition, TradeError, TradeEvent, TradeSide};
pub use infrastructure::{
    AppConfig, CaptureMetrics, KafkaConfig, OutboxDispatcher, PortfolioBatchingBuffer,
    TradeStoreTrait,
};

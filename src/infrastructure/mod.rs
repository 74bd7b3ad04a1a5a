pub mod config;
pub mod dead_letter;
pub mod kafka_abstraction;
pub mod logging;
pub mod memory_store;
pub mod metrics;
pub mod offset_tracker;
pub mod outbox;
pub mod outbox_dispatcher;
pub mod persistence_writer;
pub mod safe_store;
pub mod schema;
pub mod shutdown;
pub mod trade_batching;

pub use config::{AppConfig, ConfigError, SimulatorConfig};
pub use dead_letter::{DeadLetterEntry, DeadLetterSinkTrait, InMemoryDeadLetterSink, PostgresDeadLetterRepository};
pub use kafka_abstraction::{
    KafkaConfig, KafkaOffsetCommitter, KafkaTradePublisher, KafkaTradeSource, TradeKafkaError,
    TradePublisherTrait,
};
pub use memory_store::InMemoryTradeStore;
pub use metrics::CaptureMetrics;
pub use offset_tracker::{CommitError, OffsetCommitter, PartitionTracker};
pub use outbox::{OutboxRepositoryTrait, PostgresOutboxRepository};
pub use outbox_dispatcher::{DispatcherHandle, OutboxDispatcher, OutboxDispatcherConfig};
pub use persistence_writer::{FlushOutcome, PersistenceWriter};
pub use safe_store::{IdempotencyMode, PostgresTradeStore, StoreError, TradeStoreTrait};
pub use shutdown::{Shutdown, ShutdownSequence};
pub use trade_batching::{BatchingConfig, FlushScheduler, PortfolioBatchingBuffer};

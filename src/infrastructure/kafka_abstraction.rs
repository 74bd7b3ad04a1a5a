use async_trait::async_trait;
use rdkafka::{
    client::ClientContext,
    config::ClientConfig,
    consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer},
    error::KafkaError,
    producer::{FutureProducer, FutureRecord},
    util::Timeout,
    Message, Offset, TopicPartitionList,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::StreamPosition;
use crate::infrastructure::offset_tracker::{CommitError, OffsetCommitter, PartitionTracker};

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub ingest_topic: String,
    pub publish_topic: String,
    pub auto_offset_reset: String,
    pub consumer_session_timeout_ms: i32,
    pub consumer_max_poll_interval_ms: i32,
    pub producer_linger_ms: u32,
    pub send_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: "trade-capture".to_string(),
            ingest_topic: "trade-events".to_string(),
            publish_topic: "raw-trades".to_string(),
            auto_offset_reset: "earliest".to_string(),
            consumer_session_timeout_ms: 10000,
            consumer_max_poll_interval_ms: 300000,
            producer_linger_ms: 10,
            send_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TradeKafkaError {
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Producer error: {0}")]
    ProducerError(String),
    #[error("Consumer error: {0}")]
    ConsumerError(String),
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<KafkaError> for TradeKafkaError {
    fn from(error: KafkaError) -> Self {
        match error {
            KafkaError::ClientCreation(e) => TradeKafkaError::ConnectionError(e),
            KafkaError::MessageProduction(e) => TradeKafkaError::ProducerError(e.to_string()),
            KafkaError::MessageConsumption(e) => TradeKafkaError::ConsumerError(e.to_string()),
            _ => TradeKafkaError::Unknown(error.to_string()),
        }
    }
}

/// Downstream bus. `publish` resolves only once the broker acknowledged the
/// record.
#[async_trait]
pub trait TradePublisherTrait: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), TradeKafkaError>;
}

#[derive(Clone)]
pub struct KafkaTradePublisher {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaTradePublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self, TradeKafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "1")
            .set("retries", "2147483647")
            .set("linger.ms", config.producer_linger_ms.to_string())
            .set("compression.type", "snappy")
            .create()?;

        tracing::info!(
            "KafkaTradePublisher: ✅ Producer created for {}",
            config.bootstrap_servers
        );
        Ok(Self {
            producer,
            send_timeout: config.send_timeout,
        })
    }
}

#[async_trait]
impl TradePublisherTrait for KafkaTradePublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), TradeKafkaError> {
        self.producer
            .send(
                FutureRecord::to(topic).payload(payload).key(key.as_bytes()),
                Timeout::After(self.send_timeout),
            )
            .await
            .map_err(|(e, _)| TradeKafkaError::ProducerError(format!("{:?}", e)))?;

        Ok(())
    }
}

/// Drops progress of partitions taken away by a rebalance. Messages of those
/// partitions still buffered here will be redelivered to the new owner.
struct TrackingConsumerContext {
    tracker: Arc<PartitionTracker>,
}

impl ClientContext for TrackingConsumerContext {}

impl ConsumerContext for TrackingConsumerContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        tracing::info!("Pre-rebalance: {:?}", rebalance);
        if let Rebalance::Revoke(partitions) = rebalance {
            for element in partitions.elements() {
                self.tracker.forget(element.partition());
            }
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        tracing::info!("Post-rebalance: {:?}", rebalance);
    }
}

type TradeConsumer = StreamConsumer<TrackingConsumerContext>;

/// One upstream record, detached from the consumer's buffers.
#[derive(Debug, Clone)]
pub struct RawTradeMessage {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub position: StreamPosition,
}

/// Upstream trade stream. Auto commit is off; progress is only recorded
/// through `KafkaOffsetCommitter`.
pub struct KafkaTradeSource {
    consumer: Arc<TradeConsumer>,
    tracker: Arc<PartitionTracker>,
    topic: String,
}

impl KafkaTradeSource {
    pub fn new(config: &KafkaConfig, tracker: Arc<PartitionTracker>) -> Result<Self, TradeKafkaError> {
        tracing::info!(
            "KafkaTradeSource: Creating consumer - bootstrap_servers: {}, group_id: {}, topic: {}",
            config.bootstrap_servers,
            config.group_id,
            config.ingest_topic
        );

        let context = TrackingConsumerContext {
            tracker: tracker.clone(),
        };

        let consumer: TradeConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.partition.eof", "false")
            .set(
                "session.timeout.ms",
                config.consumer_session_timeout_ms.to_string(),
            )
            .set(
                "max.poll.interval.ms",
                config.consumer_max_poll_interval_ms.to_string(),
            )
            .set("partition.assignment.strategy", "cooperative-sticky")
            .create_with_context(context)?;

        consumer.subscribe(&[config.ingest_topic.as_str()])?;

        tracing::info!("KafkaTradeSource: ✅ Subscribed to {}", config.ingest_topic);
        Ok(Self {
            consumer: Arc::new(consumer),
            tracker,
            topic: config.ingest_topic.clone(),
        })
    }

    /// Committer sharing this source's consumer and partition tracker.
    pub fn committer(&self) -> KafkaOffsetCommitter {
        KafkaOffsetCommitter {
            consumer: self.consumer.clone(),
            tracker: self.tracker.clone(),
            topic: self.topic.clone(),
        }
    }

    pub async fn recv(&self) -> Result<RawTradeMessage, TradeKafkaError> {
        let message = self.consumer.recv().await?;
        Ok(RawTradeMessage {
            key: message.key().map(|key| key.to_vec()),
            payload: message.payload().map(|p| p.to_vec()).unwrap_or_default(),
            position: StreamPosition::new(message.partition(), message.offset()),
        })
    }
}

/// Commits the partition watermark derived by `PartitionTracker`. Kafka
/// stores the next offset to read, so a durable watermark `w` is committed as
/// `w + 1`.
#[derive(Clone)]
pub struct KafkaOffsetCommitter {
    consumer: Arc<TradeConsumer>,
    tracker: Arc<PartitionTracker>,
    topic: String,
}

impl KafkaOffsetCommitter {
    /// Pushes the tracker's latest watermark for `partition` to the broker.
    /// The tracker serializes sends per partition so flushes finishing out of
    /// order never store an older offset.
    async fn commit_watermark(&self, partition: i32) -> Result<(), CommitError> {
        let consumer = self.consumer.clone();
        let tracker = self.tracker.clone();
        let topic = self.topic.clone();

        let sent = tokio::task::spawn_blocking(move || {
            tracker.sync_upstream(partition, |watermark| {
                let mut offsets = TopicPartitionList::new();
                offsets
                    .add_partition_offset(&topic, partition, Offset::Offset(watermark + 1))
                    .map_err(|e| CommitError::Rejected(e.to_string()))?;
                consumer
                    .commit(&offsets, CommitMode::Sync)
                    .map_err(|e| CommitError::Rejected(e.to_string()))
            })
        })
        .await
        .map_err(|e| CommitError::Task(e.to_string()))??;

        if let Some(watermark) = sent {
            tracing::debug!(
                "KafkaOffsetCommitter: committed {}[{}] through offset {}",
                self.topic,
                partition,
                watermark
            );
        }
        Ok(())
    }
}

#[async_trait]
impl OffsetCommitter for KafkaOffsetCommitter {
    fn observe(&self, position: StreamPosition, routing_key: Option<Uuid>) {
        self.tracker.observe(position, routing_key);
    }

    async fn commit(&self, routing_key: Uuid, position: StreamPosition) -> Result<(), CommitError> {
        match self.tracker.complete(routing_key, position) {
            Some(_) => self.commit_watermark(position.partition).await,
            None => Ok(()),
        }
    }

    async fn release(&self, position: StreamPosition) -> Result<(), CommitError> {
        match self.tracker.release(position.partition) {
            Some(_) => self.commit_watermark(position.partition).await,
            None => Ok(()),
        }
    }
}

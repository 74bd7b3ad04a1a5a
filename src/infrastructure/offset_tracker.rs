use crate::domain::StreamPosition;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("Offset commit rejected by upstream: {0}")]
    Rejected(String),
    #[error("Offset commit task failed: {0}")]
    Task(String),
}

/// Records upstream progress after a flush became durable.
///
/// Commits are cumulative: committing a position means every message of the
/// routing key at or below it is durable.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// Called for every delivered message before it is buffered. `routing_key`
    /// is `None` for input that will never be flushed.
    fn observe(&self, _position: StreamPosition, _routing_key: Option<Uuid>) {}

    async fn commit(&self, routing_key: Uuid, position: StreamPosition) -> Result<(), CommitError>;

    /// Lets progress move past a message that was handled without a flush.
    async fn release(&self, _position: StreamPosition) -> Result<(), CommitError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PartitionProgress {
    /// Delivered offsets that are not durable yet, with their routing key.
    in_flight: BTreeMap<i64, Uuid>,
    lowest_seen: Option<i64>,
    highest_seen: Option<i64>,
    committed: Option<i64>,
}

impl PartitionProgress {
    fn safe_watermark(&self) -> Option<i64> {
        match self.in_flight.keys().next() {
            Some(oldest_in_flight) => Some(oldest_in_flight - 1),
            None => self.highest_seen,
        }
    }

    fn advance(&mut self) -> Option<i64> {
        let watermark = self.safe_watermark()?;
        // Below the first delivered offset there is nothing of ours to commit.
        if self.lowest_seen.map_or(true, |lowest| watermark < lowest)
            || self.committed.map_or(false, |c| c >= watermark)
        {
            return None;
        }
        self.committed = Some(watermark);
        Some(watermark)
    }
}

/// Folds per-routing-key completions into a per-partition watermark.
///
/// Many portfolios share one upstream partition, so a portfolio flushing
/// offset 120 must not commit past offset 100 of another portfolio that is
/// still buffered. The watermark is the offset just below the oldest message
/// that is delivered but not yet durable.
#[derive(Debug, Default)]
pub struct PartitionTracker {
    partitions: DashMap<i32, PartitionProgress>,
    /// Last watermark handed upstream per partition. The mutex is held for
    /// the whole upstream call.
    upstream: DashMap<i32, Arc<Mutex<Option<i64>>>>,
}

impl PartitionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a delivered message. `routing_key` is `None` for messages
    /// that need no flush (dead-lettered input).
    pub fn observe(&self, position: StreamPosition, routing_key: Option<Uuid>) {
        let mut progress = self.partitions.entry(position.partition).or_default();
        progress.lowest_seen = Some(
            progress
                .lowest_seen
                .map_or(position.offset, |seen| seen.min(position.offset)),
        );
        progress.highest_seen = Some(
            progress
                .highest_seen
                .map_or(position.offset, |seen| seen.max(position.offset)),
        );
        if let Some(key) = routing_key {
            progress.in_flight.insert(position.offset, key);
        }
    }

    /// Marks every in-flight message of `routing_key` at or below `position`
    /// durable. Returns the new partition watermark when it moved forward.
    pub fn complete(&self, routing_key: Uuid, position: StreamPosition) -> Option<i64> {
        let mut progress = self.partitions.get_mut(&position.partition)?;
        let finished: Vec<i64> = progress
            .in_flight
            .range(..=position.offset)
            .filter(|(_, key)| **key == routing_key)
            .map(|(offset, _)| *offset)
            .collect();
        for offset in finished {
            progress.in_flight.remove(&offset);
        }
        progress.advance()
    }

    /// Re-evaluates the watermark without completing anything, e.g. after a
    /// dead-lettered message.
    pub fn release(&self, partition: i32) -> Option<i64> {
        self.partitions.get_mut(&partition)?.advance()
    }

    /// Drops state for partitions this consumer no longer owns.
    pub fn forget(&self, partition: i32) {
        self.partitions.remove(&partition);
        self.upstream.remove(&partition);
    }

    /// Sends the partition's current watermark through `send` unless an
    /// equal or later one was already sent. Calls for one partition run one
    /// at a time and read the watermark under that exclusion, so concurrent
    /// flushes cannot make the upstream offset move backwards. Blocks, so
    /// call it from a blocking context.
    pub fn sync_upstream<E>(
        &self,
        partition: i32,
        send: impl FnOnce(i64) -> Result<(), E>,
    ) -> Result<Option<i64>, E> {
        let gate = self.upstream.entry(partition).or_default().clone();
        let mut sent = gate.lock().unwrap_or_else(PoisonError::into_inner);

        let watermark = match self.committed(partition) {
            Some(watermark) if sent.map_or(true, |s| s < watermark) => watermark,
            _ => return Ok(None),
        };
        send(watermark)?;
        *sent = Some(watermark);
        Ok(Some(watermark))
    }

    pub fn in_flight(&self, partition: i32) -> usize {
        self.partitions
            .get(&partition)
            .map_or(0, |progress| progress.in_flight.len())
    }

    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.partitions.get(&partition).and_then(|progress| progress.committed)
    }
}

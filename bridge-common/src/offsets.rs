use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::message::{Message, Partition};
use crate::metrics_consts::{
    CONSUMER_BATCH_SIZE, OFFSETS_MARKED_COMMITTABLE, OFFSET_COMMITS, PARTITION_BLOCKED_OFFSETS,
    PARTITION_LAST_COMMITTED_OFFSET, PARTITION_SKIPPED_OFFSETS,
};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("kafka client error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("no consumer handle was established")]
    NotConnected,
    #[error("broker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// The broker client the coordinator reads from and commits through.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Wait at most `timeout` for up to `max_records` messages. Returns whatever arrived, possibly
    /// nothing.
    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Message>, BrokerError>;

    /// Commit the given positions. Each position is the offset of the next message to read, one
    /// past the last resolved message, following the broker's convention.
    async fn commit(&mut self, positions: &[(Partition, i64)]) -> Result<(), BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Commit progress of one partition.
///
/// `committed` is the offset of the last message covered by a commit. It starts just below the
/// first offset read from the partition, which is where the group's committed position was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionProgress {
    committed: i64,
    committable: BTreeSet<i64>,
    /// Offset ranges, start to end inclusive, that the broker jumped over between two reads.
    skipped: BTreeMap<i64, i64>,
    last_read: Option<i64>,
}

impl PartitionProgress {
    fn new(committed: i64) -> Self {
        Self {
            committed,
            committable: BTreeSet::new(),
            skipped: BTreeMap::new(),
            last_read: None,
        }
    }

    pub fn committed(&self) -> i64 {
        self.committed
    }

    pub fn committable(&self) -> impl Iterator<Item = i64> + '_ {
        self.committable.iter().copied()
    }

    pub fn last_read(&self) -> Option<i64> {
        self.last_read
    }

    /// Walk forward from `committed` over resolved and skipped offsets, stopping at the first
    /// offset that is neither.
    fn contiguous_frontier(&self) -> i64 {
        let mut frontier = self.committed;
        loop {
            let next = frontier + 1;
            if self.committable.contains(&next) {
                frontier = next;
            } else if let Some(end) = self.skipped.get(&next) {
                frontier = *end;
            } else {
                return frontier;
            }
        }
    }

    fn record_read(&mut self, offset: i64) -> u64 {
        let mut skipped = 0;
        if let Some(last_read) = self.last_read {
            if offset > last_read + 1 {
                _ = self.skipped.insert(last_read + 1, offset - 1);
                skipped = (offset - last_read - 1) as u64;
            }
        }
        self.last_read = Some(self.last_read.map_or(offset, |last| last.max(offset)));
        skipped
    }

    fn mark_committed(&mut self, committed: i64) {
        let committed = self.committed.max(committed);
        self.committed = committed;
        self.committable = self.committable.split_off(&(committed + 1));
        self.skipped.retain(|_, end| *end > committed);
    }
}

/// Per-partition commit bookkeeping, independent of any broker client.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: BTreeMap<Partition, PartitionProgress>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `partition` from a known committed message offset.
    pub fn assign(&mut self, partition: Partition, committed: i64) {
        drop(
            self.partitions
                .insert(partition, PartitionProgress::new(committed)),
        );
    }

    pub fn record_read(&mut self, message: &Message) {
        let progress = self
            .partitions
            .entry(message.topic_partition())
            .or_insert_with(|| PartitionProgress::new(message.offset() - 1));

        let skipped = progress.record_read(message.offset());
        if skipped > 0 {
            debug!(
                partition = %message.topic_partition(),
                skipped,
                "broker skipped offsets, they will not block commits"
            );
            metrics::counter!(
                PARTITION_SKIPPED_OFFSETS,
                "topic" => message.topic().to_owned(),
                "partition" => message.partition().to_string()
            )
            .increment(skipped);
        }
    }

    /// Mark the offset of `message` as resolved. Returns false, leaving the tracker untouched,
    /// when the offset is already covered by a commit.
    pub fn set_committable(&mut self, message: &Message) -> bool {
        let progress = self
            .partitions
            .entry(message.topic_partition())
            .or_insert_with(|| PartitionProgress::new(message.offset() - 1));

        if message.offset() <= progress.committed {
            return false;
        }
        _ = progress.committable.insert(message.offset());
        true
    }

    /// The partitions whose contiguous frontier moved past their last commit, with the new
    /// frontier. Does not change any state: call `mark_committed` once the broker accepted it.
    pub fn committable_offsets(&self) -> Vec<(Partition, i64)> {
        self.partitions
            .iter()
            .filter_map(|(partition, progress)| {
                let frontier = progress.contiguous_frontier();
                (frontier > progress.committed).then(|| (partition.clone(), frontier))
            })
            .collect()
    }

    pub fn mark_committed(&mut self, partition: &Partition, committed: i64) {
        if let Some(progress) = self.partitions.get_mut(partition) {
            progress.mark_committed(committed);
        }
    }

    pub fn progress(&self, partition: &Partition) -> Option<&PartitionProgress> {
        self.partitions.get(partition)
    }

    pub fn partitions(&self) -> impl Iterator<Item = (&Partition, &PartitionProgress)> {
        self.partitions.iter()
    }
}

/// Reads batches through the broker consumer and commits only offsets that are accounted for.
///
/// An offset becomes committable either once its message is delivered or once the filter set it
/// aside. Per partition, a commit only ever moves to the highest offset reachable from the last
/// commit without crossing an unresolved one, so a crash re-reads every message whose fate is
/// not settled.
pub struct OffsetCoordinator {
    consumer: Option<Box<dyn BrokerConsumer>>,
    tracker: OffsetTracker,
    max_poll_records: usize,
    poll_timeout: Duration,
}

impl OffsetCoordinator {
    pub fn new(
        consumer: Box<dyn BrokerConsumer>,
        max_poll_records: usize,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            consumer: Some(consumer),
            tracker: OffsetTracker::new(),
            max_poll_records,
            poll_timeout,
        }
    }

    /// A coordinator whose broker connection was never established. It can still be closed.
    pub fn without_consumer(max_poll_records: usize, poll_timeout: Duration) -> Self {
        Self {
            consumer: None,
            tracker: OffsetTracker::new(),
            max_poll_records,
            poll_timeout,
        }
    }

    pub fn tracker(&self) -> &OffsetTracker {
        &self.tracker
    }

    /// Poll one batch, waiting at most the configured timeout. An empty batch means nothing
    /// arrived in time.
    pub async fn read_messages(&mut self) -> Result<Vec<Message>, BrokerError> {
        let consumer = self.consumer.as_mut().ok_or(BrokerError::NotConnected)?;
        let messages = consumer
            .poll(self.max_poll_records, self.poll_timeout)
            .await?;

        for message in &messages {
            self.tracker.record_read(message);
        }
        metrics::histogram!(CONSUMER_BATCH_SIZE).record(messages.len() as f64);

        Ok(messages)
    }

    /// Mark delivered messages as committable.
    pub fn add_offsets_and_set_committable(&mut self, messages: &[Message]) {
        self.set_committable(messages, "delivered");
    }

    /// Mark messages as committable without them going through delivery, for messages the filter
    /// set aside.
    pub fn force_add_offsets_and_set_committable(&mut self, messages: &[Message]) {
        self.set_committable(messages, "filtered");
    }

    fn set_committable(&mut self, messages: &[Message], outcome: &'static str) {
        for message in messages {
            if !self.tracker.set_committable(message) {
                warn!(
                    message = %message,
                    outcome,
                    "offset already committed, ignoring"
                );
            }
        }
        metrics::counter!(OFFSETS_MARKED_COMMITTABLE, "outcome" => outcome)
            .increment(messages.len() as u64);
    }

    /// Commit every partition whose contiguous frontier advanced. Does nothing, and does not call
    /// the broker, when no partition advanced. On failure nothing is marked committed, so the
    /// same offsets are attempted again on the next commit.
    pub async fn commit(&mut self) -> Result<(), BrokerError> {
        let frontiers = self.tracker.committable_offsets();
        if frontiers.is_empty() {
            debug!("no partition advanced, skipping commit");
            return Ok(());
        }

        let consumer = self.consumer.as_mut().ok_or(BrokerError::NotConnected)?;
        let positions: Vec<(Partition, i64)> = frontiers
            .iter()
            .map(|(partition, committed)| (partition.clone(), committed + 1))
            .collect();
        consumer.commit(&positions).await?;
        metrics::counter!(OFFSET_COMMITS).increment(1);

        for (partition, committed) in &frontiers {
            self.tracker.mark_committed(partition, *committed);

            let blocked = self
                .tracker
                .progress(partition)
                .map_or(0, |progress| progress.committable.len());
            let labels = [
                ("topic", partition.topic().to_owned()),
                ("partition", partition.partition_number().to_string()),
            ];
            metrics::gauge!(PARTITION_LAST_COMMITTED_OFFSET, &labels).set(*committed as f64);
            metrics::gauge!(PARTITION_BLOCKED_OFFSETS, &labels).set(blocked as f64);
            debug!(partition = %partition, committed, blocked, "committed offsets");
        }

        Ok(())
    }

    /// Release the consumer handle. A no-op when none was established.
    pub async fn close(&mut self) -> Result<(), BrokerError> {
        match self.consumer.take() {
            Some(mut consumer) => {
                consumer.close().await?;
                info!("broker consumer closed");
                Ok(())
            }
            None => {
                debug!("no broker consumer to close");
                Ok(())
            }
        }
    }
}

use std::time::Duration;

use rdkafka::message::OwnedMessage;

use crate::error::ClientError;
use crate::types::{Partition, PartitionAssignment};

/// Partition ownership changes observed by the client, drained by the
/// receiver loop after each poll.
#[derive(Debug, Clone)]
pub enum RebalanceEvent {
    Assigned(Vec<Partition>),
    Revoked(Vec<Partition>),
}

/// The narrow consumer surface the receiver loop drives.
///
/// Implementations are not required to be thread-safe: the receiver loop is
/// the only caller for the lifetime of the client, including user actions
/// scheduled through [`run_on_loop`](crate::receiver::KafkaReceiver::run_on_loop).
/// The trait is object-safe so queued user actions can be expressed as
/// `FnOnce(&mut dyn ConsumerClient)` regardless of the concrete client.
///
/// Commit offsets follow the Kafka convention: the value committed for a
/// partition is the *next* offset to consume (last processed + 1).
pub trait ConsumerClient: Send {
    /// Join the consumer group for the given topics.
    fn subscribe(&mut self, topics: &[String]) -> Result<(), ClientError>;

    /// Statically assign partitions, bypassing group management.
    fn assign(&mut self, partitions: &[PartitionAssignment]) -> Result<(), ClientError>;

    /// Block up to `timeout` for the next record. `None` means the timeout
    /// elapsed with nothing to deliver.
    fn poll(&mut self, timeout: Duration) -> Option<Result<OwnedMessage, ClientError>>;

    /// Drain partition assignment changes that occurred during recent polls.
    fn take_rebalance_events(&mut self) -> Vec<RebalanceEvent>;

    /// Synchronously commit the given next-offsets.
    fn commit(&mut self, offsets: &[(Partition, i64)]) -> Result<(), ClientError>;

    fn pause(&mut self, partitions: &[Partition]) -> Result<(), ClientError>;

    fn resume(&mut self, partitions: &[Partition]) -> Result<(), ClientError>;

    /// Partitions currently owned by this consumer.
    fn assignment(&self) -> Result<Vec<Partition>, ClientError>;

    /// Next offset this consumer will fetch for the partition.
    fn position(&self, partition: &Partition) -> Result<i64, ClientError>;

    /// Last committed next-offset for the partition, if any.
    fn committed(&self, partition: &Partition) -> Result<Option<i64>, ClientError>;

    /// Reposition the fetch offset for an owned partition.
    fn seek(&mut self, partition: &Partition, offset: i64) -> Result<(), ClientError>;
}

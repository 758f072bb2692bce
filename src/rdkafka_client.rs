//! rdkafka-backed [`ConsumerClient`] built on `BaseConsumer`.
//!
//! The `BaseConsumer` is blocking and not safe for concurrent use; the
//! receiver loop is its only caller. Rebalance callbacks fire on the loop
//! thread from inside `poll`, which is what lets the context flush pending
//! commits for revoked partitions before the revocation is acknowledged to
//! the client.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::OwnedMessage;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::client::{ConsumerClient, RebalanceEvent};
use crate::commit_batch::CommitBatch;
use crate::error::{ClientError, ReceiverError};
use crate::metrics_consts::{COMMIT_ENTRIES_DROPPED, REVOKE_FLUSHES};
use crate::offset::AckState;
use crate::options::ReceiverOptions;
use crate::types::{Partition, PartitionAssignment};

/// Timeout for one-off consumer operations (seek, committed lookups).
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

type EventInbox = Arc<Mutex<Vec<RebalanceEvent>>>;

pub(crate) fn classify_kafka_error(e: KafkaError) -> ClientError {
    match &e {
        KafkaError::MessageConsumptionFatal(code) => {
            ClientError::Fatal(format!("fatal consumption error: {code:?}"))
        }
        KafkaError::Global(RDKafkaErrorCode::Authentication) => {
            ClientError::Fatal(format!("authentication failed: {e}"))
        }
        KafkaError::Canceled => ClientError::Fatal("consumer canceled".to_string()),
        _ => ClientError::Transient(e.to_string()),
    }
}

/// Consumer context that records rebalances and performs the pre-revocation
/// commit flush.
pub struct ReceiverContext {
    events: EventInbox,
    pending: Arc<CommitBatch>,
}

impl ReceiverContext {
    fn push(&self, event: RebalanceEvent) {
        self.events
            .lock()
            .expect("rebalance inbox poisoned")
            .push(event);
    }

    /// Commit still-pending entries for partitions about to be revoked, so
    /// acknowledged offsets are not lost to the next owner. Runs inside the
    /// revocation callback, before the revocation completes.
    fn flush_revoked(&self, base_consumer: &BaseConsumer<Self>, partitions: &[Partition]) {
        let pending = self.pending.take_partitions(partitions);
        if pending.is_empty() {
            return;
        }

        let mut tpl = TopicPartitionList::new();
        for entry in &pending {
            if tpl
                .add_partition_offset(
                    entry.partition.topic(),
                    entry.partition.partition_number(),
                    Offset::Offset(entry.next_offset),
                )
                .is_err()
            {
                warn!(partition = %entry.partition, "invalid offset in revocation flush");
            }
        }

        match base_consumer.commit(&tpl, CommitMode::Sync) {
            Ok(()) => {
                info!(
                    partitions = pending.len(),
                    "flushed pending commits for revoked partitions"
                );
                metrics::counter!(REVOKE_FLUSHES).increment(1);
                for entry in pending {
                    for watcher in entry.watchers {
                        watcher.cell.advance(AckState::Committed);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to commit offsets for revoked partitions, dropping entries");
                metrics::counter!(COMMIT_ENTRIES_DROPPED).increment(pending.len() as u64);
            }
        }
    }
}

impl ClientContext for ReceiverContext {}

impl ConsumerContext for ReceiverContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // Cooperative-sticky sends empty revokes on any group change.
                if partitions.count() == 0 {
                    debug!("skipping empty revoke rebalance");
                    return;
                }

                let revoked: Vec<Partition> = partitions
                    .elements()
                    .into_iter()
                    .map(Partition::from)
                    .collect();
                info!(partitions = revoked.len(), "partitions being revoked");

                self.flush_revoked(base_consumer, &revoked);
                self.push(RebalanceEvent::Revoked(revoked));
            }
            Rebalance::Assign(partitions) => {
                debug!(partitions = partitions.count(), "pre-rebalance assign");
            }
            Rebalance::Error(e) => {
                warn!(error = %e, "rebalance error");
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    debug!("skipping empty assign rebalance");
                    return;
                }
                let assigned: Vec<Partition> = partitions
                    .elements()
                    .into_iter()
                    .map(Partition::from)
                    .collect();
                info!(partitions = assigned.len(), "partitions assigned");
                self.push(RebalanceEvent::Assigned(assigned));
            }
            Rebalance::Revoke(_) => {
                debug!("post-rebalance revoke");
            }
            Rebalance::Error(e) => {
                warn!(error = %e, "post-rebalance error");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "commit acknowledged"),
            Err(e) => warn!(error = %e, "commit failed"),
        }
    }
}

/// [`ConsumerClient`] over an rdkafka `BaseConsumer`.
pub struct RdKafkaConsumer {
    consumer: BaseConsumer<ReceiverContext>,
    events: EventInbox,
}

impl RdKafkaConsumer {
    /// Create the consumer from receiver options, wiring the shared pending
    /// commit table into the rebalance context.
    pub fn from_options(
        options: &ReceiverOptions,
        pending: Arc<CommitBatch>,
    ) -> Result<Self, ReceiverError> {
        let events: EventInbox = Arc::new(Mutex::new(Vec::new()));
        let context = ReceiverContext {
            events: Arc::clone(&events),
            pending,
        };

        let consumer: BaseConsumer<ReceiverContext> = options
            .client_config()
            .create_with_context(context)
            .map_err(|e| ReceiverError::ClientCreation(e.to_string()))?;

        Ok(Self { consumer, events })
    }

    fn partitions_tpl(partitions: &[Partition]) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        for partition in partitions {
            tpl.add_partition(partition.topic(), partition.partition_number());
        }
        tpl
    }
}

impl ConsumerClient for RdKafkaConsumer {
    fn subscribe(&mut self, topics: &[String]) -> Result<(), ClientError> {
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&refs).map_err(classify_kafka_error)
    }

    fn assign(&mut self, partitions: &[PartitionAssignment]) -> Result<(), ClientError> {
        let mut tpl = TopicPartitionList::new();
        for assignment in partitions {
            let offset = match assignment.offset() {
                Some(o) => Offset::Offset(o),
                None => Offset::Invalid,
            };
            tpl.add_partition_offset(assignment.topic(), assignment.partition_number(), offset)
                .map_err(classify_kafka_error)?;
        }
        self.consumer.assign(&tpl).map_err(classify_kafka_error)?;

        // Manual assignment does not go through the rebalance callbacks, so
        // surface it as an event for the loop's assignment bookkeeping.
        self.events
            .lock()
            .expect("rebalance inbox poisoned")
            .push(RebalanceEvent::Assigned(
                partitions.iter().map(|a| a.partition().clone()).collect(),
            ));
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Option<Result<OwnedMessage, ClientError>> {
        self.consumer
            .poll(timeout)
            .map(|result| result.map(|m| m.detach()).map_err(classify_kafka_error))
    }

    fn take_rebalance_events(&mut self) -> Vec<RebalanceEvent> {
        std::mem::take(&mut *self.events.lock().expect("rebalance inbox poisoned"))
    }

    fn commit(&mut self, offsets: &[(Partition, i64)]) -> Result<(), ClientError> {
        let mut tpl = TopicPartitionList::new();
        for (partition, next_offset) in offsets {
            tpl.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*next_offset),
            )
            .map_err(classify_kafka_error)?;
        }
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(classify_kafka_error)
    }

    fn pause(&mut self, partitions: &[Partition]) -> Result<(), ClientError> {
        self.consumer
            .pause(&Self::partitions_tpl(partitions))
            .map_err(classify_kafka_error)
    }

    fn resume(&mut self, partitions: &[Partition]) -> Result<(), ClientError> {
        self.consumer
            .resume(&Self::partitions_tpl(partitions))
            .map_err(classify_kafka_error)
    }

    fn assignment(&self) -> Result<Vec<Partition>, ClientError> {
        let tpl = self.consumer.assignment().map_err(classify_kafka_error)?;
        Ok(tpl.elements().into_iter().map(Partition::from).collect())
    }

    fn position(&self, partition: &Partition) -> Result<i64, ClientError> {
        let positions = self.consumer.position().map_err(classify_kafka_error)?;
        positions
            .elements()
            .into_iter()
            .find(|elem| {
                elem.topic() == partition.topic() && elem.partition() == partition.partition_number()
            })
            .and_then(|elem| elem.offset().to_raw())
            .ok_or_else(|| {
                ClientError::Transient(format!("no position known for partition {partition}"))
            })
    }

    fn committed(&self, partition: &Partition) -> Result<Option<i64>, ClientError> {
        let committed = self
            .consumer
            .committed(DEFAULT_OP_TIMEOUT)
            .map_err(classify_kafka_error)?;
        Ok(committed
            .elements()
            .into_iter()
            .find(|elem| {
                elem.topic() == partition.topic() && elem.partition() == partition.partition_number()
            })
            .and_then(|elem| elem.offset().to_raw()))
    }

    fn seek(&mut self, partition: &Partition, offset: i64) -> Result<(), ClientError> {
        self.consumer
            .seek(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(offset),
                DEFAULT_OP_TIMEOUT,
            )
            .map_err(classify_kafka_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_are_classified_fatal() {
        assert!(classify_kafka_error(KafkaError::MessageConsumptionFatal(
            RDKafkaErrorCode::Fatal
        ))
        .is_fatal());
        assert!(classify_kafka_error(KafkaError::Global(
            RDKafkaErrorCode::Authentication
        ))
        .is_fatal());
        assert!(classify_kafka_error(KafkaError::Canceled).is_fatal());
    }

    #[test]
    fn consumption_hiccups_are_transient() {
        assert!(!classify_kafka_error(KafkaError::MessageConsumption(
            RDKafkaErrorCode::PartitionEOF
        ))
        .is_fatal());
        assert!(!classify_kafka_error(KafkaError::Global(
            RDKafkaErrorCode::AllBrokersDown
        ))
        .is_fatal());
    }
}

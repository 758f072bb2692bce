use std::sync::Arc;

use rdkafka::message::OwnedMessage;
use rdkafka::{Message, Timestamp};
use tracing::debug;

use crate::event_loop::{Command, CommandSender};
use crate::offset::{AckCell, AckState, ReceiverOffset};
use crate::types::Partition;

/// An immutable consumed record: `(partition, offset, key, value, timestamp)`.
#[derive(Debug)]
pub struct Record {
    message: OwnedMessage,
}

impl Record {
    pub(crate) fn new(message: OwnedMessage) -> Self {
        Self { message }
    }

    pub fn topic(&self) -> &str {
        self.message.topic()
    }

    pub fn partition(&self) -> i32 {
        self.message.partition()
    }

    pub fn topic_partition(&self) -> Partition {
        Partition::new(self.message.topic().to_string(), self.message.partition())
    }

    pub fn offset(&self) -> i64 {
        self.message.offset()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.message.key()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.message.payload()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.message.timestamp()
    }

    pub fn into_inner(self) -> OwnedMessage {
        self.message
    }
}

/// A record paired with its offset handle, delivered by the manual-ack mode.
///
/// The application decides per record when to [`acknowledge`](ReceiverOffset::acknowledge)
/// (batched commit) or [`commit`](ReceiverOffset::commit) (immediate,
/// synchronous). Per-partition offset order is preserved as polled; nothing
/// else is implied.
#[derive(Debug)]
pub struct ReceiverRecord {
    record: Record,
    offset: ReceiverOffset,
}

impl ReceiverRecord {
    pub(crate) fn new(record: Record, offset: ReceiverOffset) -> Self {
        Self { record, offset }
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn offset(&self) -> &ReceiverOffset {
        &self.offset
    }

    pub fn into_parts(self) -> (Record, ReceiverOffset) {
        (self.record, self.offset)
    }
}

/// One poll batch delivered by the auto-ack mode.
///
/// Every record in the batch is acknowledged as a unit when the batch
/// completes: either explicitly via [`complete`](Self::complete) or
/// implicitly when the batch is dropped. Acknowledged offsets flow into the
/// periodic commit flush, giving at-least-once semantics: a crash before the
/// flush redelivers from the last committed offset.
#[derive(Debug)]
pub struct RecordBatch {
    records: Vec<Record>,
    acks: Vec<(Partition, i64, Arc<AckCell>)>,
    commands: CommandSender,
    completed: bool,
}

impl RecordBatch {
    pub(crate) fn new(
        records: Vec<Record>,
        acks: Vec<(Partition, i64, Arc<AckCell>)>,
        commands: CommandSender,
    ) -> Self {
        Self {
            records,
            acks,
            commands,
            completed: false,
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Acknowledge the whole batch now instead of waiting for drop.
    pub fn complete(mut self) {
        self.send_acks();
    }

    fn send_acks(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;

        for (partition, offset, cell) in self.acks.drain(..) {
            cell.advance(AckState::Acknowledged);
            if self
                .commands
                .send(Command::Ack {
                    partition,
                    offset,
                    cell,
                })
                .is_err()
            {
                // Receiver already closed; remaining offsets cannot be acked.
                debug!("receiver loop gone, dropping batch acknowledgements");
                return;
            }
        }
    }
}

impl Drop for RecordBatch {
    fn drop(&mut self) {
        self.send_acks();
    }
}

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::ReceiverError;
use crate::event_loop::{Command, CommandSender};
use crate::types::{Partition, PartitionOffset};

/// Acknowledgement lifecycle of a delivered record's offset.
///
/// States only ever advance: `Pending -> Acknowledged -> Committed`.
/// `Invalid` is terminal and entered when the receiver closes with the
/// offset still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AckState {
    Pending = 0,
    Acknowledged = 1,
    Committed = 2,
    Invalid = 3,
}

impl AckState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => AckState::Pending,
            1 => AckState::Acknowledged,
            2 => AckState::Committed,
            _ => AckState::Invalid,
        }
    }
}

/// Shared, monotonically advancing state cell behind an offset handle.
#[derive(Debug)]
pub(crate) struct AckCell(AtomicU8);

impl AckCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(AckState::Pending as u8))
    }

    pub(crate) fn load(&self) -> AckState {
        AckState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Advance to `target` if it is strictly ahead of the current state.
    /// Returns whether the transition happened; a cell never regresses.
    pub(crate) fn advance(&self, target: AckState) -> bool {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            if current >= target as u8 {
                return false;
            }
            match self.0.compare_exchange(
                current,
                target as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Handle to one delivered record's `(partition, offset)` position.
///
/// [`acknowledge`](Self::acknowledge) marks the offset eligible for the next
/// batched commit flush. [`commit`](Self::commit) bypasses batching and
/// resolves once the offset has been synchronously committed on the broker.
/// Both enqueue intents onto the receiver loop; the handle itself never
/// touches the consumer.
#[derive(Debug, Clone)]
pub struct ReceiverOffset {
    partition: Partition,
    offset: i64,
    cell: Arc<AckCell>,
    commands: CommandSender,
}

impl ReceiverOffset {
    pub(crate) fn new(
        partition: Partition,
        offset: i64,
        cell: Arc<AckCell>,
        commands: CommandSender,
    ) -> Self {
        Self {
            partition,
            offset,
            cell,
            commands,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// The `(partition, offset)` position this handle refers to.
    pub fn position(&self) -> PartitionOffset {
        PartitionOffset::new(self.partition.clone(), self.offset)
    }

    pub fn state(&self) -> AckState {
        self.cell.load()
    }

    /// Mark this record as processed so its offset becomes eligible for the
    /// next commit flush. Idempotent; fails only after the receiver closed.
    pub fn acknowledge(&self) -> Result<(), ReceiverError> {
        match self.cell.load() {
            AckState::Invalid => Err(ReceiverError::Closed),
            AckState::Acknowledged | AckState::Committed => Ok(()),
            AckState::Pending => {
                self.cell.advance(AckState::Acknowledged);
                self.commands
                    .send(Command::Ack {
                        partition: self.partition.clone(),
                        offset: self.offset,
                        cell: Arc::clone(&self.cell),
                    })
                    .map_err(|_| ReceiverError::Closed)
            }
        }
    }

    /// Commit this record's offset immediately, bypassing batching.
    ///
    /// Resolves once the synchronous commit has been acknowledged by the
    /// broker. Implies acknowledgement.
    pub async fn commit(&self) -> Result<(), ReceiverError> {
        match self.cell.load() {
            AckState::Invalid => return Err(ReceiverError::Closed),
            AckState::Committed => return Ok(()),
            AckState::Pending | AckState::Acknowledged => {}
        }
        self.cell.advance(AckState::Acknowledged);

        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::CommitNow {
                partition: self.partition.clone(),
                offset: self.offset,
                cell: Arc::clone(&self.cell),
                done: done_tx,
            })
            .map_err(|_| ReceiverError::Closed)?;

        done_rx.await.map_err(|_| ReceiverError::Closed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_cell_never_regresses() {
        let cell = AckCell::new();
        assert_eq!(cell.load(), AckState::Pending);

        assert!(cell.advance(AckState::Acknowledged));
        assert_eq!(cell.load(), AckState::Acknowledged);

        assert!(!cell.advance(AckState::Pending));
        assert_eq!(cell.load(), AckState::Acknowledged);

        assert!(cell.advance(AckState::Committed));
        assert!(!cell.advance(AckState::Acknowledged));
        assert_eq!(cell.load(), AckState::Committed);
    }

    #[test]
    fn acknowledge_is_idempotent_and_sends_one_intent() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = ReceiverOffset::new(
            Partition::new("t".to_string(), 0),
            7,
            Arc::new(AckCell::new()),
            tx,
        );

        handle.acknowledge().unwrap();
        handle.acknowledge().unwrap();

        assert_eq!(
            handle.position(),
            PartitionOffset::new(Partition::new("t".to_string(), 0), 7)
        );

        let mut intents = 0;
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                Command::Ack { offset, .. } => {
                    assert_eq!(offset, 7);
                    intents += 1;
                }
                _ => panic!("unexpected command"),
            }
        }
        assert_eq!(intents, 1);
        assert_eq!(handle.state(), AckState::Acknowledged);
    }

    #[test]
    fn acknowledge_fails_after_loop_is_gone() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = ReceiverOffset::new(
            Partition::new("t".to_string(), 0),
            3,
            Arc::new(AckCell::new()),
            tx,
        );
        drop(rx);

        assert!(matches!(handle.acknowledge(), Err(ReceiverError::Closed)));
    }
}

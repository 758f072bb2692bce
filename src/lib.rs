//! Demand-driven async receiver over a blocking Kafka consumer.
//!
//! The consumer client is confined to one dedicated loop thread; the async
//! side talks to it exclusively through an ordered command queue. Records are
//! fetched only against downstream demand (partitions are paused while
//! demand is exhausted) and exposed through one of three delivery streams:
//!
//! - [`KafkaReceiver::receive`]: per-record offset handles, manual
//!   acknowledgement and commit.
//! - [`KafkaReceiver::receive_auto_ack`]: per-poll batches acknowledged as a
//!   unit, at-least-once.
//! - [`KafkaReceiver::receive_at_most_once`]: offsets committed before
//!   dispatch, never redelivered.
//!
//! Acknowledged offsets accumulate in a commit batch flushed by size or
//! interval, and flushed early for partitions about to be revoked.

pub mod client;
pub mod commit_batch;
pub mod demand;
pub mod error;
pub mod metrics_consts;
pub mod offset;
pub mod options;
pub mod rdkafka_client;
pub mod receiver;
pub mod record;
pub mod test_utils;
pub mod types;

mod event_loop;

pub use client::{ConsumerClient, RebalanceEvent};
pub use error::{ClientError, ReceiverError};
pub use offset::{AckState, ReceiverOffset};
pub use options::{ReceiverOptions, Subscription};
pub use receiver::{AtMostOnceStream, AutoAckStream, KafkaReceiver, ManualRecordStream};
pub use record::{Record, RecordBatch, ReceiverRecord};
pub use types::{Partition, PartitionAssignment, PartitionOffset};

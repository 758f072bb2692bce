//! Public receiver surface: construction, the three delivery streams, and
//! serialized access to the underlying consumer.
//!
//! A [`KafkaReceiver`] owns a background loop thread holding the consumer
//! client. At most one delivery stream can be active over the receiver's
//! lifetime; records flow only while the stream holds unconsumed demand,
//! which the stream replenishes as the application draws records from it.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::client::ConsumerClient;
use crate::commit_batch::CommitBatch;
use crate::error::ReceiverError;
use crate::event_loop::{Command, CommandSender, DeliverySink, ReceiverLoop};
use crate::options::ReceiverOptions;
use crate::rdkafka_client::RdKafkaConsumer;
use crate::record::{Record, RecordBatch, ReceiverRecord};

/// Async handle over a blocking Kafka consumer confined to its own thread.
pub struct KafkaReceiver {
    commands: CommandSender,
    prefetch: usize,
    stream_claimed: AtomicBool,
    loop_thread: Option<JoinHandle<()>>,
}

impl KafkaReceiver {
    /// Create a receiver backed by an rdkafka consumer. The consumer is
    /// created and subscribed on a dedicated loop thread; no records flow
    /// until a delivery stream is attached and polled.
    pub fn create(options: ReceiverOptions) -> Result<Self, ReceiverError> {
        let pending = Arc::new(CommitBatch::new());
        let client = RdKafkaConsumer::from_options(&options, Arc::clone(&pending))?;
        Ok(Self::start(client, options, pending))
    }

    /// Create a receiver over a caller-provided client. Intended for custom
    /// transports and tests; the client is moved onto the loop thread and
    /// never touched from anywhere else.
    pub fn with_client<C: ConsumerClient + 'static>(client: C, options: ReceiverOptions) -> Self {
        Self::start(client, options, Arc::new(CommitBatch::new()))
    }

    fn start<C: ConsumerClient + 'static>(
        client: C,
        options: ReceiverOptions,
        pending: Arc<CommitBatch>,
    ) -> Self {
        let (commands_tx, commands_rx) = channel();
        let loop_thread =
            ReceiverLoop::spawn(client, &options, pending, commands_rx, commands_tx.clone());
        Self {
            commands: commands_tx,
            prefetch: options.prefetch(),
            stream_claimed: AtomicBool::new(false),
            loop_thread: Some(loop_thread),
        }
    }

    /// Manual-ack delivery: every record carries its offset handle and the
    /// application controls acknowledgement and commit per record.
    pub fn receive(&self) -> Result<ManualRecordStream, ReceiverError> {
        let inbox = self.open_stream(DeliverySink::Records)?;
        Ok(ManualRecordStream {
            core: StreamCore::new(inbox, self.commands.clone(), self.prefetch),
        })
    }

    /// Auto-ack delivery: records arrive in per-poll batches that are
    /// acknowledged as a unit when the batch is completed or dropped.
    /// At-least-once: offsets acknowledged but not yet flushed are
    /// redelivered after a crash.
    pub fn receive_auto_ack(&self) -> Result<AutoAckStream, ReceiverError> {
        let inbox = self.open_stream(DeliverySink::Batches)?;
        Ok(AutoAckStream {
            core: StreamCore::new(inbox, self.commands.clone(), self.prefetch),
        })
    }

    /// At-most-once delivery: each record's offset is synchronously committed
    /// before the record is handed over, so nothing is ever redelivered. A
    /// crash between commit and processing loses that record.
    pub fn receive_at_most_once(&self) -> Result<AtMostOnceStream, ReceiverError> {
        let inbox = self.open_stream(DeliverySink::Committed)?;
        Ok(AtMostOnceStream {
            core: StreamCore::new(inbox, self.commands.clone(), self.prefetch),
        })
    }

    fn open_stream<T>(
        &self,
        make_sink: impl FnOnce(mpsc::UnboundedSender<Result<T, ReceiverError>>) -> DeliverySink,
    ) -> Result<mpsc::UnboundedReceiver<Result<T, ReceiverError>>, ReceiverError> {
        if self
            .stream_claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ReceiverError::StreamAlreadyActive);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.commands
            .send(Command::Open {
                sink: make_sink(tx),
            })
            .map_err(|_| ReceiverError::Closed)?;
        Ok(rx)
    }

    /// Run an action with direct access to the consumer, on the loop thread,
    /// serialized after every previously queued operation. This is the only
    /// sanctioned path to consumer methods like `seek`, `position`,
    /// `committed`, `pause` and `resume`.
    pub async fn run_on_loop<F, T>(&self, action: F) -> Result<T, ReceiverError>
    where
        F: FnOnce(&mut dyn ConsumerClient) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        self.commands
            .send(Command::Run(Box::new(move |client| {
                if result_tx.send(action(client)).is_err() {
                    debug!("action caller gave up before completion");
                }
            })))
            .map_err(|_| ReceiverError::Closed)?;
        result_rx.await.map_err(|_| ReceiverError::Closed)
    }

    /// Gracefully shut down: flush pending commits within the configured
    /// close grace period, then release the consumer. Idempotent; returns
    /// `Ok` if the receiver already stopped.
    pub async fn close(mut self) -> Result<(), ReceiverError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Close { done: done_tx }).is_ok() {
            // A dropped acknowledgement means the loop died mid-close; the
            // consumer is released either way.
            if done_rx.await.is_err() {
                debug!("receiver loop exited before acknowledging close");
            }
        }
        if let Some(handle) = self.loop_thread.take() {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                debug!("receiver loop thread did not join cleanly");
            }
        }
        Ok(())
    }
}

impl Drop for KafkaReceiver {
    fn drop(&mut self) {
        // Best effort: ask the loop to flush and stop without waiting.
        let (done_tx, _done_rx) = oneshot::channel();
        if self.commands.send(Command::Close { done: done_tx }).is_err() {
            debug!("receiver loop already stopped");
        }
    }
}

/// Demand accounting shared by the three stream flavors.
///
/// The stream grants `prefetch` records of demand up front and replenishes
/// once half of it has been drawn, so the loop can keep fetching while the
/// application processes.
struct StreamCore<T> {
    inbox: mpsc::UnboundedReceiver<Result<T, ReceiverError>>,
    commands: CommandSender,
    prefetch: u64,
    drawn: u64,
    terminated: bool,
}

impl<T> StreamCore<T> {
    fn new(
        inbox: mpsc::UnboundedReceiver<Result<T, ReceiverError>>,
        commands: CommandSender,
        prefetch: usize,
    ) -> Self {
        let prefetch = prefetch.max(1) as u64;
        if commands.send(Command::Request(prefetch)).is_err() {
            debug!("receiver loop gone before initial demand grant");
        }
        Self {
            inbox,
            commands,
            prefetch,
            drawn: 0,
            terminated: false,
        }
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<T, ReceiverError>>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        match self.inbox.poll_recv(cx) {
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Err(e))) => {
                // Terminal: the loop sends at most one error, then stops.
                self.terminated = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.terminated = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Account for `n` drawn records, replenishing demand at the half-way
    /// mark. Send failures mean the loop stopped; the inbox will surface
    /// that as end-of-stream.
    fn consumed(&mut self, n: u64) {
        self.drawn += n;
        if self.drawn * 2 >= self.prefetch {
            if self.commands.send(Command::Request(self.drawn)).is_err() {
                debug!("receiver loop gone, demand replenishment dropped");
            }
            self.drawn = 0;
        }
    }
}

impl<T> Drop for StreamCore<T> {
    fn drop(&mut self) {
        // Dropping the delivery stream ends the receiver's useful life:
        // flush what was acknowledged and release the consumer.
        let (done_tx, _done_rx) = oneshot::channel();
        if self.commands.send(Command::Close { done: done_tx }).is_err() {
            debug!("receiver loop already stopped");
        }
    }
}

/// Stream of [`ReceiverRecord`]s (manual acknowledgement).
pub struct ManualRecordStream {
    core: StreamCore<ReceiverRecord>,
}

impl Stream for ManualRecordStream {
    type Item = Result<ReceiverRecord, ReceiverError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.core.poll_recv(cx);
        if let Poll::Ready(Some(Ok(_))) = &polled {
            this.core.consumed(1);
        }
        polled
    }
}

/// Stream of [`RecordBatch`]es (batch auto-acknowledgement).
pub struct AutoAckStream {
    core: StreamCore<RecordBatch>,
}

impl Stream for AutoAckStream {
    type Item = Result<RecordBatch, ReceiverError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.core.poll_recv(cx);
        if let Poll::Ready(Some(Ok(batch))) = &polled {
            this.core.consumed(batch.len() as u64);
        }
        polled
    }
}

/// Stream of pre-committed [`Record`]s (at-most-once).
pub struct AtMostOnceStream {
    core: StreamCore<Record>,
}

impl Stream for AtMostOnceStream {
    type Item = Result<Record, ReceiverError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.core.poll_recv(cx);
        if let Poll::Ready(Some(Ok(_))) = &polled {
            this.core.consumed(1);
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockConsumer;
    use futures::StreamExt;
    use std::time::Duration;

    fn test_options() -> ReceiverOptions {
        ReceiverOptions::new("localhost:9092", "test-group")
            .subscribe(["test-topic"])
            .with_poll_timeout(Duration::from_millis(10))
            .with_commit_interval(Duration::from_millis(20))
            .with_prefetch(10)
    }

    #[tokio::test]
    async fn only_one_stream_per_receiver() {
        let (mock, control) = MockConsumer::new();
        control.assign_on_subscribe("test-topic", &[0]);
        let receiver = KafkaReceiver::with_client(mock, test_options());

        let _stream = receiver.receive().unwrap();
        assert!(matches!(
            receiver.receive_auto_ack(),
            Err(ReceiverError::StreamAlreadyActive)
        ));
    }

    #[tokio::test]
    async fn auto_ack_batches_commit_after_completion() {
        let (mock, control) = MockConsumer::new();
        control.assign_on_subscribe("test-topic", &[0]);
        control.add_records("test-topic", 0, 0..4);

        let receiver = KafkaReceiver::with_client(mock, test_options());
        let mut stream = receiver.receive_auto_ack().unwrap();

        let mut seen = 0;
        while seen < 4 {
            let batch = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("timed out waiting for batch")
                .expect("stream ended early")
                .expect("unexpected stream error");
            seen += batch.len();
            batch.complete();
        }

        // The interval flush picks up the acknowledged offsets.
        tokio::time::timeout(Duration::from_secs(2), async {
            while control.committed("test-topic", 0) != Some(4) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("acknowledged offsets were never committed");
    }

    #[tokio::test]
    async fn at_most_once_commits_before_delivery() {
        let (mock, control) = MockConsumer::new();
        control.assign_on_subscribe("test-topic", &[0]);
        control.add_records("test-topic", 0, 0..1);

        let receiver = KafkaReceiver::with_client(mock, test_options());
        let mut stream = receiver.receive_at_most_once().unwrap();

        let record = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for record")
            .expect("stream ended early")
            .expect("unexpected stream error");

        assert_eq!(record.offset(), 0);
        // Commit happened before the record reached us.
        assert_eq!(control.committed("test-topic", 0), Some(1));
    }

    #[tokio::test]
    async fn run_on_loop_reaches_the_consumer() {
        let (mock, control) = MockConsumer::new();
        control.assign_on_subscribe("test-topic", &[0, 1]);

        let receiver = KafkaReceiver::with_client(mock, test_options());

        // Let the subscription settle so the assignment is visible.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let assignment = receiver
            .run_on_loop(|client| client.assignment())
            .await
            .expect("receiver closed")
            .expect("assignment failed");
        assert_eq!(assignment.len(), 2);
    }

    #[tokio::test]
    async fn close_is_idempotent_through_commands() {
        let (mock, control) = MockConsumer::new();
        control.assign_on_subscribe("test-topic", &[0]);

        let receiver = KafkaReceiver::with_client(mock, test_options());
        receiver.close().await.unwrap();
    }
}

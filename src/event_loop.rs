//! The receiver engine: a dedicated thread that owns the consumer client and
//! serializes every consumer-touching operation onto one thread of control.
//!
//! Downstream demand, acknowledgements, immediate commits, user actions and
//! close requests all arrive through a single ordered command queue and are
//! interleaved with polls and commit flushes in strict FIFO order. The loop
//! is the only code that ever calls into the [`ConsumerClient`]; everything
//! else enqueues intents and waits on futures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{Receiver as StdReceiver, Sender as StdSender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::client::{ConsumerClient, RebalanceEvent};
use crate::commit_batch::CommitBatch;
use crate::demand::DemandTracker;
use crate::error::{ClientError, ReceiverError};
use crate::metrics_consts::{
    ACTIONS_EXECUTED, BATCH_SIZE, COMMITS_ISSUED, COMMIT_ENTRIES_DROPPED, COMMIT_FAILURES,
    DEMAND_PAUSES, POLL_ERRORS, RECORDS_DELIVERED, RECORDS_DISCARDED_REVOKED, REVOKE_FLUSHES,
};
use crate::offset::{AckCell, AckState, ReceiverOffset};
use crate::options::{ReceiverOptions, Subscription};
use crate::record::{Record, RecordBatch, ReceiverRecord};
use crate::types::Partition;

/// Closure executed on the loop thread with direct consumer access.
pub(crate) type LoopAction = Box<dyn FnOnce(&mut dyn ConsumerClient) + Send>;

/// Intents enqueued by the async side; executed in strict FIFO order
/// relative to polls and commit flushes.
pub(crate) enum Command {
    /// Attach the (single) delivery stream.
    Open { sink: DeliverySink },
    /// Grant more delivery demand.
    Request(u64),
    /// An acknowledged offset, eligible for the next batched flush.
    Ack {
        partition: Partition,
        offset: i64,
        cell: Arc<AckCell>,
    },
    /// Immediate synchronous commit of a single offset, bypassing batching.
    CommitNow {
        partition: Partition,
        offset: i64,
        cell: Arc<AckCell>,
        done: oneshot::Sender<Result<(), ReceiverError>>,
    },
    /// User action needing direct consumer access.
    Run(LoopAction),
    /// Begin graceful shutdown.
    Close { done: oneshot::Sender<()> },
}

pub(crate) type CommandSender = StdSender<Command>;

/// Where dispatched records go; the variant fixes the delivery mode.
#[derive(Clone)]
pub(crate) enum DeliverySink {
    /// Manual-ack: records with offset handles.
    Records(mpsc::UnboundedSender<Result<ReceiverRecord, ReceiverError>>),
    /// Auto-ack: one batch per poll cycle, acked as a unit on completion.
    Batches(mpsc::UnboundedSender<Result<RecordBatch, ReceiverError>>),
    /// At-most-once: records whose offsets were committed before dispatch.
    Committed(mpsc::UnboundedSender<Result<Record, ReceiverError>>),
}

impl DeliverySink {
    fn send_error(&self, err: ReceiverError) {
        let delivered = match self {
            DeliverySink::Records(tx) => tx.send(Err(err)).is_ok(),
            DeliverySink::Batches(tx) => tx.send(Err(err)).is_ok(),
            DeliverySink::Committed(tx) => tx.send(Err(err)).is_ok(),
        };
        if !delivered {
            debug!("delivery stream already dropped, discarding terminal error");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Initializing,
    Active,
    Paused,
    Closing,
    Closed,
}

enum Cycle {
    Continue,
    Close(Option<oneshot::Sender<()>>),
}

/// Retries for the pre-dispatch commit in at-most-once mode.
const AT_MOST_ONCE_COMMIT_ATTEMPTS: u32 = 3;

pub(crate) struct ReceiverLoop<C: ConsumerClient> {
    client: C,
    commands: StdReceiver<Command>,
    commands_tx: CommandSender,
    pending: Arc<CommitBatch>,
    demand: DemandTracker,
    sink: Option<DeliverySink>,
    assignment: HashSet<Partition>,
    /// Highest next-offset committed per partition in this session. Guards
    /// every commit path from rewinding the broker's committed offset.
    committed: HashMap<Partition, i64>,
    /// Records fetched while demand was exhausted (at most one poll batch).
    holdback: VecDeque<OwnedMessage>,
    state: LoopState,
    paused: bool,
    consecutive_errors: u64,
    subscription: Subscription,
    poll_timeout: Duration,
    max_poll_records: usize,
    commit_interval: Duration,
    commit_batch_size: usize,
    close_timeout: Duration,
}

impl<C: ConsumerClient + 'static> ReceiverLoop<C> {
    pub(crate) fn spawn(
        client: C,
        options: &ReceiverOptions,
        pending: Arc<CommitBatch>,
        commands: StdReceiver<Command>,
        commands_tx: CommandSender,
    ) -> JoinHandle<()> {
        let receiver_loop = ReceiverLoop {
            client,
            commands,
            commands_tx,
            pending,
            demand: DemandTracker::new(),
            sink: None,
            assignment: HashSet::new(),
            committed: HashMap::new(),
            holdback: VecDeque::new(),
            state: LoopState::Initializing,
            paused: false,
            consecutive_errors: 0,
            subscription: options.subscription().clone(),
            poll_timeout: options.poll_timeout(),
            max_poll_records: options.max_poll_records(),
            commit_interval: options.commit_interval(),
            commit_batch_size: options.commit_batch_size(),
            close_timeout: options.close_timeout(),
        };

        std::thread::Builder::new()
            .name("kafka-receiver-loop".to_string())
            .spawn(move || receiver_loop.run())
            .expect("failed to spawn receiver loop thread")
    }

    fn run(mut self) {
        debug!(state = ?self.state, "receiver loop starting");
        if let Err(e) = self.initialize() {
            self.terminate(ReceiverError::Client(e));
            return;
        }
        self.state = LoopState::Active;
        info!("receiver loop active");

        let close_ack = loop {
            match self.cycle() {
                Ok(Cycle::Continue) => {}
                Ok(Cycle::Close(ack)) => break ack,
                Err(err) => {
                    self.terminate(err);
                    return;
                }
            }
        };
        self.shutdown(close_ack);
    }

    fn initialize(&mut self) -> Result<(), ClientError> {
        match &self.subscription {
            Subscription::Topics(topics) => {
                if topics.is_empty() {
                    return Err(ClientError::Fatal(
                        "no topics subscribed and no partitions assigned".to_string(),
                    ));
                }
                info!(topics = ?topics, "subscribing");
                let topics = topics.clone();
                self.client.subscribe(&topics)
            }
            Subscription::Assignment(partitions) => {
                info!(partitions = partitions.len(), "assigning static partitions");
                let partitions = partitions.clone();
                self.client.assign(&partitions)
            }
        }
    }

    fn cycle(&mut self) -> Result<Cycle, ReceiverError> {
        if let Cycle::Close(ack) = self.drain_commands()? {
            return Ok(Cycle::Close(ack));
        }

        self.apply_rebalance_events()?;
        self.reconcile_pause()?;
        self.pump()?;
        self.reconcile_pause()?;

        if self
            .pending
            .should_flush(self.commit_batch_size, self.commit_interval)
        {
            self.flush()?;
        }

        Ok(Cycle::Continue)
    }

    /// Apply every queued command in arrival order.
    fn drain_commands(&mut self) -> Result<Cycle, ReceiverError> {
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    if let Cycle::Close(ack) = self.handle_command(command)? {
                        return Ok(Cycle::Close(ack));
                    }
                }
                Err(TryRecvError::Empty) => return Ok(Cycle::Continue),
                Err(TryRecvError::Disconnected) => return Ok(Cycle::Close(None)),
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> Result<Cycle, ReceiverError> {
        match command {
            Command::Open { sink } => {
                if self.sink.is_some() {
                    warn!("delivery stream already attached, ignoring open request");
                } else {
                    self.sink = Some(sink);
                }
            }
            Command::Request(n) => {
                self.demand.request(n);
            }
            Command::Ack {
                partition,
                offset,
                cell,
            } => {
                self.pending.record_ack(&partition, offset, cell);
            }
            Command::CommitNow {
                partition,
                offset,
                cell,
                done,
            } => {
                let next_offset = offset + 1;
                if self.already_committed(&partition, next_offset) {
                    // A higher offset on this partition is already committed;
                    // issuing this one would rewind the broker. The offset is
                    // covered, so the caller observes success.
                    cell.advance(AckState::Committed);
                    self.pending.mark_flushed(&[(partition, next_offset)]);
                    if done.send(Ok(())).is_err() {
                        debug!("commit caller gave up before completion");
                    }
                    return Ok(Cycle::Continue);
                }

                let target = [(partition, next_offset)];
                match self.client.commit(&target) {
                    Ok(()) => {
                        cell.advance(AckState::Committed);
                        self.note_committed(&target);
                        // Pending entries at or below this offset are now
                        // covered; commits are idempotent and monotonic.
                        self.pending.mark_flushed(&target);
                        metrics::counter!(COMMITS_ISSUED, "kind" => "immediate").increment(1);
                        if done.send(Ok(())).is_err() {
                            debug!("commit caller gave up before completion");
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        if done.send(Err(ReceiverError::Commit(e.clone()))).is_err() {
                            debug!("commit caller gave up before completion");
                        }
                        return Err(ReceiverError::Client(e));
                    }
                    Err(e) => {
                        metrics::counter!(COMMIT_FAILURES, "kind" => "immediate").increment(1);
                        if done.send(Err(ReceiverError::Commit(e))).is_err() {
                            debug!("commit caller gave up before completion");
                        }
                    }
                }
            }
            Command::Run(action) => {
                action(&mut self.client);
                metrics::counter!(ACTIONS_EXECUTED).increment(1);
            }
            Command::Close { done } => return Ok(Cycle::Close(Some(done))),
        }
        Ok(Cycle::Continue)
    }

    /// Record successfully committed next-offsets. The mark only advances.
    fn note_committed(&mut self, offsets: &[(Partition, i64)]) {
        for (partition, next_offset) in offsets {
            let mark = self
                .committed
                .entry(partition.clone())
                .or_insert(*next_offset);
            if *next_offset > *mark {
                *mark = *next_offset;
            }
        }
    }

    fn already_committed(&self, partition: &Partition, next_offset: i64) -> bool {
        self.committed
            .get(partition)
            .is_some_and(|mark| *mark >= next_offset)
    }

    fn apply_rebalance_events(&mut self) -> Result<(), ReceiverError> {
        for event in self.client.take_rebalance_events() {
            match event {
                RebalanceEvent::Assigned(partitions) => {
                    info!(partitions = partitions.len(), "partitions assigned");
                    for partition in &partitions {
                        self.assignment.insert(partition.clone());
                    }
                    // Keep newly assigned partitions quiet while demand is
                    // exhausted.
                    if self.paused {
                        if let Err(e) = self.client.pause(&partitions) {
                            if e.is_fatal() {
                                return Err(ReceiverError::Client(e));
                            }
                            warn!(error = %e, "failed to pause newly assigned partitions");
                        }
                    }
                }
                RebalanceEvent::Revoked(partitions) => {
                    info!(partitions = partitions.len(), "partitions revoked");
                    // No-op when the client context already flushed these
                    // inside the revocation callback.
                    self.flush_revoked(&partitions)?;
                    for partition in &partitions {
                        self.assignment.remove(partition);
                    }
                    let before = self.holdback.len();
                    self.holdback.retain(|msg| {
                        !partitions.iter().any(|p| {
                            p.topic() == msg.topic() && p.partition_number() == msg.partition()
                        })
                    });
                    let discarded = before - self.holdback.len();
                    if discarded > 0 {
                        warn!(discarded, "discarded undelivered records from revoked partitions");
                        metrics::counter!(RECORDS_DISCARDED_REVOKED).increment(discarded as u64);
                    }
                }
            }
        }
        Ok(())
    }

    /// Flush pending commit entries for partitions about to be lost.
    fn flush_revoked(&mut self, partitions: &[Partition]) -> Result<(), ReceiverError> {
        let pending = self.pending.take_partitions(partitions);
        if pending.is_empty() {
            return Ok(());
        }

        let offsets: Vec<(Partition, i64)> = pending
            .iter()
            .map(|entry| (entry.partition.clone(), entry.next_offset))
            .collect();

        match self.client.commit(&offsets) {
            Ok(()) => {
                info!(
                    partitions = offsets.len(),
                    "flushed pending commits for revoked partitions"
                );
                metrics::counter!(REVOKE_FLUSHES).increment(1);
                self.note_committed(&offsets);
                for entry in pending {
                    for watcher in entry.watchers {
                        watcher.cell.advance(AckState::Committed);
                    }
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(ReceiverError::Client(e)),
            Err(e) => {
                warn!(error = %e, "failed to commit offsets for revoked partitions, dropping entries");
                metrics::counter!(COMMIT_ENTRIES_DROPPED).increment(offsets.len() as u64);
                Ok(())
            }
        }
    }

    /// One poll/deliver step. With no attached stream or no demand this is a
    /// liveness poll (partitions paused, nothing expected); otherwise fetch
    /// up to `min(demand, max_poll_records)` records and dispatch them.
    fn pump(&mut self) -> Result<(), ReceiverError> {
        if self.sink.is_none() || self.demand.is_exhausted() {
            match self.client.poll(self.poll_timeout) {
                None => {}
                Some(Ok(msg)) => {
                    // A record can slip through while a pause takes effect;
                    // keep it for the next demand grant.
                    self.holdback.push_back(msg);
                }
                Some(Err(e)) => self.handle_poll_error(e)?,
            }
            return Ok(());
        }

        let budget =
            (self.demand.outstanding().min(self.max_poll_records as u64)) as usize;
        let mut batch: Vec<OwnedMessage> = Vec::with_capacity(budget.min(64));

        while batch.len() < budget {
            match self.holdback.pop_front() {
                Some(msg) => batch.push(msg),
                None => break,
            }
        }
        self.collect_into(&mut batch, budget)?;

        // Revocations observed during the poll invalidate their records.
        self.apply_rebalance_events()?;
        let before = batch.len();
        batch.retain(|msg| {
            self.assignment.contains(&Partition::new(
                msg.topic().to_string(),
                msg.partition(),
            ))
        });
        let discarded = before - batch.len();
        if discarded > 0 {
            warn!(discarded, "discarded records from partitions no longer owned");
            metrics::counter!(RECORDS_DISCARDED_REVOKED).increment(discarded as u64);
        }

        if batch.is_empty() {
            return Ok(());
        }
        self.dispatch(batch)
    }

    /// Collect records until the budget is met or the poll window closes.
    fn collect_into(
        &mut self,
        batch: &mut Vec<OwnedMessage>,
        budget: usize,
    ) -> Result<(), ReceiverError> {
        let deadline = Instant::now() + self.poll_timeout;
        while batch.len() < budget {
            let timeout = if batch.is_empty() {
                self.poll_timeout
            } else {
                deadline.saturating_duration_since(Instant::now())
            };
            if !batch.is_empty() && timeout.is_zero() {
                break;
            }
            match self.client.poll(timeout) {
                None => break,
                Some(Ok(msg)) => {
                    self.consecutive_errors = 0;
                    batch.push(msg);
                }
                Some(Err(e)) => {
                    self.handle_poll_error(e)?;
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_poll_error(&mut self, e: ClientError) -> Result<(), ReceiverError> {
        if e.is_fatal() {
            return Err(ReceiverError::Client(e));
        }
        self.consecutive_errors += 1;
        warn!(error = %e, consecutive = self.consecutive_errors, "transient poll error");
        metrics::counter!(POLL_ERRORS).increment(1);
        std::thread::sleep(Duration::from_millis(
            100 * self.consecutive_errors.min(10),
        ));
        Ok(())
    }

    fn dispatch(&mut self, batch: Vec<OwnedMessage>) -> Result<(), ReceiverError> {
        metrics::histogram!(BATCH_SIZE).record(batch.len() as f64);
        let sink = match &self.sink {
            Some(sink) => sink.clone(),
            None => return Ok(()),
        };

        match sink {
            DeliverySink::Records(tx) => {
                for msg in batch {
                    let partition =
                        Partition::new(msg.topic().to_string(), msg.partition());
                    let offset = msg.offset();
                    let handle = ReceiverOffset::new(
                        partition,
                        offset,
                        Arc::new(AckCell::new()),
                        self.commands_tx.clone(),
                    );
                    let record = ReceiverRecord::new(Record::new(msg), handle);
                    if tx.send(Ok(record)).is_err() {
                        self.stream_gone();
                        return Ok(());
                    }
                    self.demand.consume(1);
                    metrics::counter!(RECORDS_DELIVERED, "mode" => "manual").increment(1);
                }
            }
            DeliverySink::Batches(tx) => {
                let mut records = Vec::with_capacity(batch.len());
                let mut acks = Vec::with_capacity(batch.len());
                for msg in batch {
                    let partition =
                        Partition::new(msg.topic().to_string(), msg.partition());
                    acks.push((partition, msg.offset(), Arc::new(AckCell::new())));
                    records.push(Record::new(msg));
                }
                let delivered = records.len() as u64;
                let unit = RecordBatch::new(records, acks, self.commands_tx.clone());
                if tx.send(Ok(unit)).is_err() {
                    self.stream_gone();
                    return Ok(());
                }
                self.demand.consume(delivered);
                metrics::counter!(RECORDS_DELIVERED, "mode" => "auto_ack").increment(delivered);
            }
            DeliverySink::Committed(tx) => {
                for msg in batch {
                    let partition =
                        Partition::new(msg.topic().to_string(), msg.partition());
                    let next_offset = msg.offset() + 1;
                    match self.commit_before_dispatch(&partition, next_offset) {
                        Ok(()) => {
                            if tx.send(Ok(Record::new(msg))).is_err() {
                                self.stream_gone();
                                return Ok(());
                            }
                            self.demand.consume(1);
                            metrics::counter!(RECORDS_DELIVERED, "mode" => "at_most_once")
                                .increment(1);
                        }
                        Err(e) if e.is_fatal() => return Err(ReceiverError::Client(e)),
                        Err(e) => {
                            metrics::counter!(COMMIT_FAILURES, "kind" => "at_most_once")
                                .increment(1);
                            // A commit rejected because the partition was
                            // revoked mid-batch loses only that record; the
                            // new owner redelivers it.
                            self.apply_rebalance_events()?;
                            if !self.assignment.contains(&partition) {
                                warn!(
                                    partition = %partition,
                                    offset = next_offset - 1,
                                    error = %e,
                                    "partition lost during pre-dispatch commit, discarding record"
                                );
                                metrics::counter!(RECORDS_DISCARDED_REVOKED).increment(1);
                                continue;
                            }
                            // Retries are exhausted on an owned partition:
                            // delivering would break at-most-once, skipping
                            // would seal silent loss. Surface the failure.
                            warn!(
                                partition = %partition,
                                offset = next_offset - 1,
                                error = %e,
                                "pre-dispatch commit failed after retries, stopping delivery"
                            );
                            return Err(ReceiverError::Commit(e));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Synchronous commit that must succeed before an at-most-once record is
    /// handed to the application. Expensive by design: one broker round trip
    /// per record.
    fn commit_before_dispatch(
        &mut self,
        partition: &Partition,
        next_offset: i64,
    ) -> Result<(), ClientError> {
        let mut last_err = None;
        for attempt in 0..AT_MOST_ONCE_COMMIT_ATTEMPTS {
            match self.client.commit(&[(partition.clone(), next_offset)]) {
                Ok(()) => {
                    metrics::counter!(COMMITS_ISSUED, "kind" => "at_most_once").increment(1);
                    self.note_committed(&[(partition.clone(), next_offset)]);
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!(attempt, error = %e, "retrying pre-dispatch commit");
                    last_err = Some(e);
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ClientError::Transient("pre-dispatch commit failed".to_string())
        }))
    }

    /// Pause all owned partitions when demand is exhausted (so the client
    /// does not buffer unboundedly), resume them when demand returns.
    fn reconcile_pause(&mut self) -> Result<(), ReceiverError> {
        let want_paused = self.sink.is_none() || self.demand.is_exhausted();
        if want_paused == self.paused {
            return Ok(());
        }
        if self.assignment.is_empty() {
            self.paused = want_paused;
            return Ok(());
        }

        let partitions: Vec<Partition> = self.assignment.iter().cloned().collect();
        let result = if want_paused {
            self.client.pause(&partitions)
        } else {
            self.client.resume(&partitions)
        };
        match result {
            Ok(()) => {
                self.paused = want_paused;
                if want_paused {
                    debug!("demand exhausted, partitions paused");
                    metrics::counter!(DEMAND_PAUSES).increment(1);
                    self.state = LoopState::Paused;
                } else {
                    debug!("demand available, partitions resumed");
                    self.state = LoopState::Active;
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(ReceiverError::Client(e)),
            Err(e) => {
                warn!(error = %e, "failed to adjust partition pause state");
                Ok(())
            }
        }
    }

    /// Flush the accumulated commit batch. Failed commits keep their entries
    /// and are retried on the next due cycle; entries for partitions no
    /// longer owned are dropped with a diagnostic.
    fn flush(&mut self) -> Result<(), ReceiverError> {
        let snapshot = self.pending.snapshot();
        if snapshot.is_empty() {
            return Ok(());
        }

        let (owned, stale): (Vec<_>, Vec<_>) = snapshot
            .into_iter()
            .partition(|(partition, _)| self.assignment.contains(partition));

        if !stale.is_empty() {
            let partitions: Vec<Partition> =
                stale.iter().map(|(p, _)| p.clone()).collect();
            let dropped = self.pending.drop_partitions(&partitions);
            warn!(dropped, "dropped pending commits for partitions no longer assigned");
            metrics::counter!(COMMIT_ENTRIES_DROPPED).increment(dropped as u64);
        }

        // Entries already covered by a higher immediate commit must not be
        // re-issued: that would rewind the partition's committed offset.
        let (due, covered): (Vec<_>, Vec<_>) = owned
            .into_iter()
            .partition(|(partition, next_offset)| !self.already_committed(partition, *next_offset));
        if !covered.is_empty() {
            self.pending.mark_flushed(&covered);
        }

        if due.is_empty() {
            self.pending.mark_flushed(&[]);
            return Ok(());
        }

        match self.client.commit(&due) {
            Ok(()) => {
                debug!(partitions = due.len(), "committed batched offsets");
                metrics::counter!(COMMITS_ISSUED, "kind" => "batch").increment(1);
                self.note_committed(&due);
                self.pending.mark_flushed(&due);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(ReceiverError::Client(e)),
            Err(e) => {
                // Entries stay pending; the next cycle retries them.
                warn!(error = %e, "batched commit failed, will retry");
                metrics::counter!(COMMIT_FAILURES, "kind" => "batch").increment(1);
                Ok(())
            }
        }
    }

    fn stream_gone(&mut self) {
        debug!("delivery stream dropped, detaching sink");
        self.sink = None;
    }

    /// Graceful shutdown: best-effort final flush within the close grace
    /// period, then fail whatever is still queued and release the client.
    fn shutdown(mut self, close_ack: Option<oneshot::Sender<()>>) {
        self.state = LoopState::Closing;
        info!("receiver loop closing");

        let deadline = Instant::now() + self.close_timeout;
        if !self.pending.is_empty() && Instant::now() < deadline {
            let snapshot = self.pending.snapshot();
            let owned: Vec<(Partition, i64)> = snapshot
                .into_iter()
                .filter(|(partition, next_offset)| {
                    self.assignment.contains(partition)
                        && !self.already_committed(partition, *next_offset)
                })
                .collect();
            if !owned.is_empty() {
                match self.client.commit(&owned) {
                    Ok(()) => {
                        info!(partitions = owned.len(), "final commit flush succeeded");
                        self.pending.mark_flushed(&owned);
                    }
                    Err(e) => warn!(error = %e, "final commit flush failed"),
                }
            }
        }

        self.fail_queued_commands();
        self.pending.invalidate_all();
        if let Some(ack) = close_ack {
            if ack.send(()).is_err() {
                debug!("close caller gave up before completion");
            }
        }
        self.state = LoopState::Closed;
        info!("receiver loop closed, consumer handle released");
        // Dropping self releases the client.
    }

    fn terminate(&mut self, err: ReceiverError) {
        error!(error = %err, "receiver loop terminating");
        if let Some(sink) = self.sink.take() {
            sink.send_error(err);
        }
        self.fail_queued_commands();
        self.pending.invalidate_all();
        self.state = LoopState::Closed;
    }

    /// Complete every still-queued command with a closed failure. Queued
    /// actions are dropped unexecuted; their callers observe the dropped
    /// result channel as a closed error.
    fn fail_queued_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::CommitNow { cell, done, .. } => {
                    cell.advance(AckState::Invalid);
                    if done.send(Err(ReceiverError::Closed)).is_err() {
                        debug!("commit caller gave up before completion");
                    }
                }
                Command::Ack { cell, .. } => {
                    cell.advance(AckState::Invalid);
                }
                Command::Close { done } => {
                    if done.send(()).is_err() {
                        debug!("close caller gave up before completion");
                    }
                }
                Command::Run(_) | Command::Open { .. } | Command::Request(_) => {}
            }
        }
    }
}

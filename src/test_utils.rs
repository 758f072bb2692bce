//! Test support: a fully scriptable in-memory [`ConsumerClient`].
//!
//! The mock records which thread every consumer call arrives on, honors
//! pause/resume when serving records, and lets tests inject rebalances and
//! commit/poll failures. Used by unit tests in this crate and by the
//! integration suite.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::ThreadId;
use std::time::Duration;

use rdkafka::message::OwnedMessage;
use rdkafka::{Message, Timestamp};

use crate::client::{ConsumerClient, RebalanceEvent};
use crate::error::ClientError;
use crate::types::{Partition, PartitionAssignment};

#[derive(Default)]
struct MockState {
    queues: HashMap<Partition, VecDeque<OwnedMessage>>,
    assignment: HashSet<Partition>,
    paused: HashSet<Partition>,
    committed: HashMap<Partition, i64>,
    next_offsets: HashMap<Partition, i64>,
    events: Vec<RebalanceEvent>,
    grant_on_subscribe: Vec<Partition>,
    fetched: usize,
    commit_count: usize,
    fail_next_commits: usize,
    fatal_next_poll: bool,
    observed_threads: Vec<ThreadId>,
}

impl MockState {
    fn record_thread(&mut self) {
        self.observed_threads.push(std::thread::current().id());
    }
}

/// Scripted consumer handed to the receiver loop.
pub struct MockConsumer {
    state: Arc<Mutex<MockState>>,
}

/// Test-side handle sharing state with a [`MockConsumer`].
#[derive(Clone)]
pub struct MockController {
    state: Arc<Mutex<MockState>>,
}

impl MockConsumer {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MockConsumer, MockController) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            MockConsumer {
                state: Arc::clone(&state),
            },
            MockController { state },
        )
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }
}

impl MockController {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    /// Partitions granted (as an `Assigned` event) when `subscribe` is called.
    pub fn assign_on_subscribe(&self, topic: &str, partitions: &[i32]) {
        let mut state = self.lock();
        for &p in partitions {
            state
                .grant_on_subscribe
                .push(Partition::new(topic.to_string(), p));
        }
    }

    /// Queue records with consecutive offsets on one partition.
    pub fn add_records(&self, topic: &str, partition: i32, offsets: std::ops::Range<i64>) {
        let key = Partition::new(topic.to_string(), partition);
        let mut state = self.lock();
        let queue = state.queues.entry(key).or_default();
        for offset in offsets {
            queue.push_back(OwnedMessage::new(
                Some(format!("payload-{offset}").into_bytes()),
                Some(format!("key-{offset}").into_bytes()),
                topic.to_string(),
                Timestamp::CreateTime(1_700_000_000_000 + offset),
                partition,
                offset,
                None,
            ));
        }
    }

    /// Inject a revocation, as a group rebalance would.
    pub fn revoke(&self, topic: &str, partitions: &[i32]) {
        let revoked: Vec<Partition> = partitions
            .iter()
            .map(|&p| Partition::new(topic.to_string(), p))
            .collect();
        let mut state = self.lock();
        for partition in &revoked {
            state.assignment.remove(partition);
        }
        state.events.push(RebalanceEvent::Revoked(revoked));
    }

    /// Inject an assignment of additional partitions.
    pub fn assign_more(&self, topic: &str, partitions: &[i32]) {
        let assigned: Vec<Partition> = partitions
            .iter()
            .map(|&p| Partition::new(topic.to_string(), p))
            .collect();
        let mut state = self.lock();
        for partition in &assigned {
            state.assignment.insert(partition.clone());
        }
        state.events.push(RebalanceEvent::Assigned(assigned));
    }

    /// The next poll fails with a fatal error.
    pub fn fail_next_poll_fatal(&self) {
        self.lock().fatal_next_poll = true;
    }

    /// The next `n` commits fail with a transient error.
    pub fn fail_next_commits(&self, n: usize) {
        self.lock().fail_next_commits = n;
    }

    /// Last committed next-offset for the partition.
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&Partition::new(topic.to_string(), partition))
            .copied()
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commit_count
    }

    /// How many records polls have handed out so far.
    pub fn fetched_count(&self) -> usize {
        self.lock().fetched
    }

    pub fn paused_partitions(&self) -> Vec<Partition> {
        self.lock().paused.iter().cloned().collect()
    }

    pub fn current_assignment(&self) -> Vec<Partition> {
        self.lock().assignment.iter().cloned().collect()
    }

    /// Threads on which consumer calls were observed, in call order.
    pub fn observed_threads(&self) -> Vec<ThreadId> {
        self.lock().observed_threads.clone()
    }
}

impl ConsumerClient for MockConsumer {
    fn subscribe(&mut self, _topics: &[String]) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record_thread();
        let granted = std::mem::take(&mut state.grant_on_subscribe);
        if !granted.is_empty() {
            for partition in &granted {
                state.assignment.insert(partition.clone());
            }
            state.events.push(RebalanceEvent::Assigned(granted));
        }
        Ok(())
    }

    fn assign(&mut self, partitions: &[PartitionAssignment]) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record_thread();
        let mut assigned = Vec::with_capacity(partitions.len());
        for assignment in partitions {
            let partition = assignment.partition().clone();
            if let Some(start) = assignment.offset() {
                if let Some(queue) = state.queues.get_mut(&partition) {
                    queue.retain(|msg| msg.offset() >= start);
                }
                state.next_offsets.insert(partition.clone(), start);
            }
            state.assignment.insert(partition.clone());
            assigned.push(partition);
        }
        state.events.push(RebalanceEvent::Assigned(assigned));
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Option<Result<OwnedMessage, ClientError>> {
        {
            let mut state = self.lock();
            state.record_thread();
            if state.fatal_next_poll {
                state.fatal_next_poll = false;
                return Some(Err(ClientError::Fatal("scripted fatal poll".to_string())));
            }

            let candidates: Vec<Partition> = state
                .assignment
                .iter()
                .filter(|p| !state.paused.contains(*p))
                .cloned()
                .collect();
            for partition in candidates {
                if let Some(queue) = state.queues.get_mut(&partition) {
                    if let Some(msg) = queue.pop_front() {
                        state.fetched += 1;
                        state.next_offsets.insert(partition, msg.offset() + 1);
                        return Some(Ok(msg));
                    }
                }
            }
        }
        // Nothing to serve: block like a real consumer would, briefly.
        std::thread::sleep(timeout.min(Duration::from_millis(20)));
        None
    }

    fn take_rebalance_events(&mut self) -> Vec<RebalanceEvent> {
        let mut state = self.lock();
        state.record_thread();
        std::mem::take(&mut state.events)
    }

    fn commit(&mut self, offsets: &[(Partition, i64)]) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record_thread();
        if state.fail_next_commits > 0 {
            state.fail_next_commits -= 1;
            return Err(ClientError::Transient("scripted commit failure".to_string()));
        }
        for (partition, next_offset) in offsets {
            state.committed.insert(partition.clone(), *next_offset);
        }
        state.commit_count += 1;
        Ok(())
    }

    fn pause(&mut self, partitions: &[Partition]) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record_thread();
        for partition in partitions {
            state.paused.insert(partition.clone());
        }
        Ok(())
    }

    fn resume(&mut self, partitions: &[Partition]) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record_thread();
        for partition in partitions {
            state.paused.remove(partition);
        }
        Ok(())
    }

    fn assignment(&self) -> Result<Vec<Partition>, ClientError> {
        let mut state = self.lock();
        state.record_thread();
        Ok(state.assignment.iter().cloned().collect())
    }

    fn position(&self, partition: &Partition) -> Result<i64, ClientError> {
        let mut state = self.lock();
        state.record_thread();
        if let Some(next) = state.next_offsets.get(partition) {
            return Ok(*next);
        }
        state
            .queues
            .get(partition)
            .and_then(|q| q.front())
            .map(|msg| msg.offset())
            .ok_or_else(|| {
                ClientError::Transient(format!("no position known for partition {partition}"))
            })
    }

    fn committed(&self, partition: &Partition) -> Result<Option<i64>, ClientError> {
        let mut state = self.lock();
        state.record_thread();
        Ok(state.committed.get(partition).copied())
    }

    fn seek(&mut self, partition: &Partition, offset: i64) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record_thread();
        if !state.assignment.contains(partition) {
            return Err(ClientError::Transient(format!(
                "cannot seek unassigned partition {partition}"
            )));
        }
        if let Some(queue) = state.queues.get_mut(partition) {
            queue.retain(|msg| msg.offset() >= offset);
        }
        state.next_offsets.insert(partition.clone(), offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paused_partitions_serve_nothing() {
        let (mut mock, control) = MockConsumer::new();
        control.assign_on_subscribe("t", &[0]);
        control.add_records("t", 0, 0..3);
        mock.subscribe(&["t".to_string()]).unwrap();

        mock.pause(&[Partition::new("t".to_string(), 0)]).unwrap();
        assert!(mock.poll(Duration::from_millis(1)).is_none());

        mock.resume(&[Partition::new("t".to_string(), 0)]).unwrap();
        let msg = mock.poll(Duration::from_millis(1)).unwrap().unwrap();
        assert_eq!(msg.offset(), 0);
        assert_eq!(control.fetched_count(), 1);
    }

    #[test]
    fn seek_skips_queued_records() {
        let (mut mock, control) = MockConsumer::new();
        control.assign_on_subscribe("t", &[0]);
        control.add_records("t", 0, 0..5);
        mock.subscribe(&["t".to_string()]).unwrap();

        let partition = Partition::new("t".to_string(), 0);
        mock.seek(&partition, 3).unwrap();
        assert_eq!(mock.position(&partition).unwrap(), 3);

        let msg = mock.poll(Duration::from_millis(1)).unwrap().unwrap();
        assert_eq!(msg.offset(), 3);
    }
}

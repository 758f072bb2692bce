//! Commit batch manager: accumulates acknowledged offsets per partition and
//! decides when the receiver loop should flush them as one commit request.
//!
//! Entries track the highest acknowledged next-offset per partition and only
//! ever advance. A flush snapshots the entries without clearing them; entries
//! are cleared by `mark_flushed` after the commit succeeds, so a failed
//! commit retries the same offsets instead of silently dropping them.
//!
//! The table is shared between the receiver loop and the rdkafka rebalance
//! context (which flushes revoked partitions from inside the revocation
//! callback), hence the concurrent map.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::offset::{AckCell, AckState};
use crate::types::Partition;

/// An offset handle waiting to observe its commit.
#[derive(Debug)]
pub(crate) struct OffsetWatcher {
    pub(crate) offset: i64,
    pub(crate) cell: Arc<AckCell>,
}

#[derive(Debug, Default)]
struct CommitEntry {
    /// Highest acknowledged offset + 1 (the next offset to consume).
    next_offset: i64,
    /// Handles to mark `Committed` once a commit covers their offset.
    watchers: Vec<OffsetWatcher>,
}

/// Pending entry extracted for an immediate revocation flush.
#[derive(Debug)]
pub(crate) struct PendingCommit {
    pub(crate) partition: Partition,
    pub(crate) next_offset: i64,
    pub(crate) watchers: Vec<OffsetWatcher>,
}

pub struct CommitBatch {
    entries: DashMap<Partition, CommitEntry>,
    acked_since_flush: AtomicUsize,
    last_flush: Mutex<Instant>,
}

impl Default for CommitBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitBatch {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            acked_since_flush: AtomicUsize::new(0),
            last_flush: Mutex::new(Instant::now()),
        }
    }

    /// Record an acknowledged offset. The tracked next-offset only advances;
    /// acknowledging below the current high-water mark still registers the
    /// watcher (it is already covered by the pending commit).
    pub(crate) fn record_ack(&self, partition: &Partition, offset: i64, cell: Arc<AckCell>) {
        let next = offset + 1;
        self.entries
            .entry(partition.clone())
            .and_modify(|entry| {
                if next > entry.next_offset {
                    entry.next_offset = next;
                }
                entry.watchers.push(OffsetWatcher {
                    offset,
                    cell: Arc::clone(&cell),
                });
            })
            .or_insert_with(|| CommitEntry {
                next_offset: next,
                watchers: vec![OffsetWatcher { offset, cell }],
            });
        self.acked_since_flush.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether a flush is due: accumulated acknowledgements reached the batch
    /// size (0 disables the size trigger), or the commit interval elapsed.
    pub fn should_flush(&self, batch_size: usize, interval: Duration) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        if batch_size > 0 && self.acked_since_flush.load(Ordering::SeqCst) >= batch_size {
            return true;
        }
        self.last_flush
            .lock()
            .expect("commit batch clock poisoned")
            .elapsed()
            >= interval
    }

    /// Snapshot of all pending next-offsets. Entries stay in place until a
    /// successful commit is reported via [`mark_flushed`].
    pub fn snapshot(&self) -> Vec<(Partition, i64)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().next_offset))
            .collect()
    }

    /// Report a successful commit. Watchers covered by the committed offset
    /// are marked `Committed`; entries with no newer acknowledgements since
    /// the snapshot are removed.
    pub(crate) fn mark_flushed(&self, flushed: &[(Partition, i64)]) {
        for (partition, committed_next) in flushed {
            let remove = if let Some(mut entry) = self.entries.get_mut(partition) {
                entry.watchers.retain(|watcher| {
                    if watcher.offset < *committed_next {
                        watcher.cell.advance(AckState::Committed);
                        false
                    } else {
                        true
                    }
                });
                entry.next_offset <= *committed_next && entry.watchers.is_empty()
            } else {
                false
            };
            if remove {
                self.entries.remove(partition);
            }
        }

        let remaining: usize = self.entries.iter().map(|e| e.value().watchers.len()).sum();
        self.acked_since_flush.store(remaining, Ordering::SeqCst);
        *self
            .last_flush
            .lock()
            .expect("commit batch clock poisoned") = Instant::now();
    }

    /// Extract pending entries for the given partitions, for an immediate
    /// flush ahead of revocation.
    pub(crate) fn take_partitions(&self, partitions: &[Partition]) -> Vec<PendingCommit> {
        let mut taken = Vec::new();
        for partition in partitions {
            if let Some((partition, entry)) = self.entries.remove(partition) {
                taken.push(PendingCommit {
                    partition,
                    next_offset: entry.next_offset,
                    watchers: entry.watchers,
                });
            }
        }
        taken
    }

    /// Drop entries for partitions this consumer no longer owns. Returns how
    /// many entries were discarded.
    pub(crate) fn drop_partitions(&self, partitions: &[Partition]) -> usize {
        let mut dropped = 0;
        for partition in partitions {
            if self.entries.remove(partition).is_some() {
                debug!(partition = %partition, "dropped pending commit entry for unowned partition");
                dropped += 1;
            }
        }
        dropped
    }

    /// Invalidate every outstanding watcher. Called when the loop terminates;
    /// acknowledge/commit on the corresponding handles fails afterwards.
    pub(crate) fn invalidate_all(&self) {
        for entry in self.entries.iter() {
            for watcher in &entry.value().watchers {
                watcher.cell.advance(AckState::Invalid);
            }
        }
        self.entries.clear();
        self.acked_since_flush.store(0, Ordering::SeqCst);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn partition_count(&self) -> usize {
        self.entries.len()
    }

    pub fn pending_acks(&self) -> usize {
        self.acked_since_flush.load(Ordering::SeqCst)
    }
}

//! Flow control over delivered-but-unacknowledged records.
//!
//! Each partition keeps the sizes of the records handed to the host in
//! delivery order. Acknowledgements must arrive in the same order, so an
//! acknowledgement always releases the oldest pending record.
//!
//! Pause and resume use different thresholds. A partition that was paused
//! at 1000 pending records stays paused until the host drains it down to
//! 500, which keeps partitions near the limit from flapping.

use std::collections::{HashMap, HashSet, VecDeque};

use common_kafka::TopicPartition;
use tracing::debug;

use crate::error::PollerError;

/// Pause/resume thresholds. Defaults match the long-standing constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Below this many pending records a partition is never paused.
    pub pause_min_messages: usize,
    pub pause_bytes: usize,
    pub pause_messages: usize,
    pub resume_bytes: usize,
    pub resume_messages: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            pause_min_messages: 2,
            pause_bytes: 1_000_000,
            pause_messages: 1000,
            resume_bytes: 500_000,
            resume_messages: 500,
        }
    }
}

#[derive(Debug, Default)]
struct BufferUsage {
    sizes: VecDeque<usize>,
    total_bytes: usize,
}

impl BufferUsage {
    fn push(&mut self, size: usize) {
        self.sizes.push_back(size);
        self.total_bytes += size;
    }

    fn pop(&mut self) -> Option<usize> {
        let size = self.sizes.pop_front()?;
        self.total_bytes -= size;
        Some(size)
    }

    fn pending(&self) -> usize {
        self.sizes.len()
    }
}

/// Pause and resume calls the poll loop should issue to the broker.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub pause: Vec<TopicPartition>,
    pub resume: Vec<TopicPartition>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.pause.is_empty() && self.resume.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct BackpressureTracker {
    thresholds: Thresholds,
    usage: HashMap<TopicPartition, BufferUsage>,
    paused: HashSet<TopicPartition>,
    /// Given up in a rebalance and not delivered from since.
    released: HashSet<TopicPartition>,
}

impl BackpressureTracker {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            usage: HashMap::new(),
            paused: HashSet::new(),
            released: HashSet::new(),
        }
    }

    pub fn record_delivered(&mut self, partition: &TopicPartition, size_bytes: usize) {
        self.released.remove(partition);
        match self.usage.get_mut(partition) {
            Some(usage) => usage.push(size_bytes),
            None => {
                let mut usage = BufferUsage::default();
                usage.push(size_bytes);
                self.usage.insert(partition.clone(), usage);
            }
        }
    }

    /// Releases the oldest pending record of `partition`.
    pub fn record_acknowledged(&mut self, partition: &TopicPartition) -> Result<(), PollerError> {
        self.usage
            .get_mut(partition)
            .and_then(BufferUsage::pop)
            .map(|_| ())
            .ok_or_else(|| PollerError::ProtocolViolation(partition.clone()))
    }

    /// Whether any state exists for `partition`, i.e. it delivered records
    /// since it was last assigned.
    pub fn is_tracked(&self, partition: &TopicPartition) -> bool {
        self.usage.contains_key(partition)
    }

    /// Whether `partition` was revoked or lost with no delivery since, so
    /// acknowledgements for it may still be in flight from the host.
    pub fn was_released(&self, partition: &TopicPartition) -> bool {
        self.released.contains(partition)
    }

    pub fn pending(&self, partition: &TopicPartition) -> usize {
        self.usage.get(partition).map_or(0, BufferUsage::pending)
    }

    pub fn pending_bytes(&self, partition: &TopicPartition) -> usize {
        self.usage.get(partition).map_or(0, |usage| usage.total_bytes)
    }

    pub fn should_pause(&self, partition: &TopicPartition) -> bool {
        let pending = self.pending(partition);
        let bytes = self.pending_bytes(partition);
        let t = &self.thresholds;

        pending >= t.pause_min_messages && (bytes >= t.pause_bytes || pending >= t.pause_messages)
    }

    pub fn should_resume(&self, partition: &TopicPartition) -> bool {
        let pending = self.pending(partition);
        let bytes = self.pending_bytes(partition);
        let t = &self.thresholds;

        pending < t.pause_min_messages || (bytes <= t.resume_bytes && pending <= t.resume_messages)
    }

    pub fn is_paused(&self, partition: &TopicPartition) -> bool {
        self.paused.contains(partition)
    }

    pub fn paused_count(&self) -> usize {
        self.paused.len()
    }

    /// Decides which of the `assigned` partitions change pause state. Partitions
    /// that are not assigned keep whatever state they have.
    pub fn reconcile<'a, I>(&mut self, assigned: I) -> Reconciliation
    where
        I: IntoIterator<Item = &'a TopicPartition>,
    {
        let mut reconciliation = Reconciliation::default();

        for partition in assigned {
            if self.paused.contains(partition) {
                if self.should_resume(partition) {
                    self.paused.remove(partition);
                    reconciliation.resume.push(partition.clone());
                }
            } else if self.should_pause(partition) {
                self.paused.insert(partition.clone());
                reconciliation.pause.push(partition.clone());
            }
        }

        reconciliation.pause.sort();
        reconciliation.resume.sort();
        reconciliation
    }

    /// Forgets everything about `partitions`, including whether they were
    /// paused, and marks them released until their next delivery.
    pub fn remove_partitions(&mut self, partitions: &[TopicPartition]) {
        for partition in partitions {
            self.released.insert(partition.clone());
            if let Some(usage) = self.usage.remove(partition) {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    pending = usage.pending(),
                    "Dropped buffer usage for partition"
                );
            }
            self.paused.remove(partition);
        }
    }
}

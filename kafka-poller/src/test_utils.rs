//! In-memory stand-ins for the broker and the host, used by unit tests and
//! the scenarios under `tests/`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use common_kafka::{
    BrokerClient, BrokerError, Committer, ConsumerRecord, PartitionOffsets, RebalanceListener,
    TopicPartition,
};

use crate::error::NotifyError;
use crate::notifications::{Notification, Notifier};

/// What the next call to [`FakeBroker::poll`] does.
#[derive(Debug, Clone)]
pub enum PollStep {
    Records(Vec<ConsumerRecord>),
    Assign(Vec<TopicPartition>),
    Revoke(Vec<TopicPartition>),
    Lost(Vec<TopicPartition>),
    /// A rebalance error: the whole assignment is reported lost and dropped.
    Failed,
}

/// Broker client that replays a script of poll results and records every
/// call made against it. Commits are stored the way Kafka stores them, as
/// the next offset to read.
#[derive(Debug, Default)]
pub struct FakeBroker {
    /// End offset of each partition, indexed by partition number.
    pub topics: BTreeMap<String, Vec<i64>>,
    pub script: VecDeque<PollStep>,
    pub assignment: Vec<TopicPartition>,
    pub subscribed: Vec<String>,
    pub paused: BTreeSet<TopicPartition>,
    pub pause_calls: Vec<Vec<TopicPartition>>,
    pub resume_calls: Vec<Vec<TopicPartition>>,
    /// Offsets passed to each successful commit call.
    pub commits: Vec<PartitionOffsets>,
    pub committed_positions: PartitionOffsets,
    pub fail_commits: bool,
    pub polls: usize,
    pub closed: bool,
}

impl FakeBroker {
    pub fn with_topic(mut self, topic: &str, end_offsets: &[i64]) -> Self {
        self.topics.insert(topic.to_owned(), end_offsets.to_vec());
        self
    }

    pub fn then(mut self, step: PollStep) -> Self {
        self.script.push_back(step);
        self
    }

    pub fn push_step(&mut self, step: PollStep) {
        self.script.push_back(step);
    }

    pub fn is_paused(&self, partition: &TopicPartition) -> bool {
        self.paused.contains(partition)
    }

    fn release(&mut self, partitions: &[TopicPartition]) {
        self.assignment.retain(|p| !partitions.contains(p));
        for partition in partitions {
            self.paused.remove(partition);
        }
    }
}

impl Committer for FakeBroker {
    fn commit_sync(&mut self, offsets: &PartitionOffsets) -> Result<(), BrokerError> {
        if self.fail_commits {
            return Err(BrokerError::Rejected {
                operation: "commit",
                reason: "commits disabled for test".to_owned(),
            });
        }
        for (partition, offset) in offsets {
            self.committed_positions.insert(partition.clone(), offset + 1);
        }
        self.commits.push(offsets.clone());
        Ok(())
    }
}

impl BrokerClient for FakeBroker {
    fn assign(&mut self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        self.assignment = partitions.to_vec();
        Ok(())
    }

    fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        self.subscribed = topics.to_vec();
        Ok(())
    }

    fn poll<L: RebalanceListener>(
        &mut self,
        _timeout: Duration,
        listener: &mut L,
    ) -> Result<Vec<ConsumerRecord>, L::Error> {
        self.polls += 1;

        match self.script.pop_front() {
            None => Ok(Vec::new()),
            Some(PollStep::Records(records)) => Ok(records),
            Some(PollStep::Assign(partitions)) => {
                listener.on_partitions_assigned(&partitions)?;
                self.assignment.extend(partitions);
                Ok(Vec::new())
            }
            Some(PollStep::Revoke(partitions)) => {
                listener.on_partitions_revoked(self, &partitions)?;
                self.release(&partitions);
                Ok(Vec::new())
            }
            Some(PollStep::Lost(partitions)) => {
                listener.on_partitions_lost(&partitions)?;
                self.release(&partitions);
                Ok(Vec::new())
            }
            Some(PollStep::Failed) => {
                let owned = self.assignment.clone();
                listener.on_partitions_lost(&owned)?;
                self.release(&owned);
                Ok(Vec::new())
            }
        }
    }

    fn pause(&mut self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        self.paused.extend(partitions.iter().cloned());
        self.pause_calls.push(partitions.to_vec());
        Ok(())
    }

    fn resume(&mut self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        for partition in partitions {
            self.paused.remove(partition);
        }
        self.resume_calls.push(partitions.to_vec());
        Ok(())
    }

    fn committed(&mut self, partitions: &[TopicPartition]) -> Result<PartitionOffsets, BrokerError> {
        Ok(partitions
            .iter()
            .filter_map(|p| {
                self.committed_positions
                    .get(p)
                    .map(|offset| (p.clone(), *offset))
            })
            .collect())
    }

    fn end_offsets(&mut self, partitions: &[TopicPartition]) -> Result<PartitionOffsets, BrokerError> {
        partitions
            .iter()
            .map(|p| {
                self.topics
                    .get(p.topic())
                    .and_then(|ends| ends.get(p.partition() as usize))
                    .map(|end| (p.clone(), *end))
                    .ok_or_else(|| BrokerError::UnknownTopic(p.topic().to_owned()))
            })
            .collect()
    }

    fn partitions_for(&mut self, topic: &str) -> Result<Vec<TopicPartition>, BrokerError> {
        let ends = self
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_owned()))?;

        Ok((0..ends.len() as i32)
            .map(|partition| TopicPartition::new(topic, partition))
            .collect())
    }

    fn assignment(&self) -> Result<Vec<TopicPartition>, BrokerError> {
        Ok(self.assignment.clone())
    }

    fn close(&mut self) -> Result<(), BrokerError> {
        self.closed = true;
        Ok(())
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub notifications: Vec<Notification>,
}

impl RecordingNotifier {
    pub fn count(&self, kind: &str) -> usize {
        self.notifications
            .iter()
            .filter(|n| n.kind() == kind)
            .count()
    }

    pub fn records(&self) -> Vec<(TopicPartition, i64)> {
        self.notifications
            .iter()
            .filter_map(|n| match n {
                Notification::Record {
                    topic,
                    partition,
                    offset,
                    ..
                } => Some((TopicPartition::new(topic.as_str(), *partition), *offset)),
                _ => None,
            })
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn emit(&mut self, notification: Notification) -> Result<(), NotifyError> {
        self.notifications.push(notification);
        Ok(())
    }
}

pub fn record(topic: &str, partition: i32, offset: i64, value: &[u8]) -> ConsumerRecord {
    ConsumerRecord {
        partition: TopicPartition::new(topic, partition),
        offset,
        timestamp_millis: 1_700_000_000_000 + offset,
        value: value.to_vec(),
    }
}

/// `count` one-byte records starting at `first_offset`.
pub fn records(topic: &str, partition: i32, first_offset: i64, count: usize) -> Vec<ConsumerRecord> {
    (0..count as i64)
        .map(|i| record(topic, partition, first_offset + i, b"x"))
        .collect()
}

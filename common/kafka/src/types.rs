use std::fmt;

use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionListElem;
use serde::{Deserialize, Serialize};

/// A single partition of a topic. Key of every piece of per-partition state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    topic: String,
    partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl From<TopicPartitionListElem<'_>> for TopicPartition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// An offset within a partition.
///
/// Used both for acknowledgements ("processed up to and including this offset")
/// and for end-of-log targets ("first offset past the last record").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    partition: TopicPartition,
    offset: i64,
}

impl Position {
    pub fn new(partition: TopicPartition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// The position immediately after this one in the same partition.
    /// Saturates at `i64::MAX`, which Kafka never hands out.
    pub fn next(&self) -> Self {
        Self::new(self.partition.clone(), self.offset.saturating_add(1))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// A record polled from the broker, detached from the client's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub partition: TopicPartition,
    pub offset: i64,
    /// Milliseconds since the epoch, `-1` when the broker supplied none.
    pub timestamp_millis: i64,
    pub value: Vec<u8>,
}

impl ConsumerRecord {
    pub fn position(&self) -> Position {
        Position::new(self.partition.clone(), self.offset)
    }

    /// Size accounted against the partition's buffer budget.
    pub fn size_bytes(&self) -> usize {
        self.value.len()
    }

    /// Copies the parts the host cares about out of a client message.
    pub fn from_message<M: Message>(message: &M) -> Self {
        Self {
            partition: TopicPartition::new(message.topic(), message.partition()),
            offset: message.offset(),
            timestamp_millis: message.timestamp().to_millis().unwrap_or(-1),
            value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }
}

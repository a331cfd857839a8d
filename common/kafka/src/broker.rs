use std::collections::BTreeMap;
use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::types::{ConsumerRecord, TopicPartition};

/// Offsets keyed by partition. Ordered so commits and logs are deterministic.
pub type PartitionOffsets = BTreeMap<TopicPartition, i64>;

/// Failures surfaced by a broker client. None of them are retried by callers.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("kafka error during {operation}: {source}")]
    Kafka {
        operation: &'static str,
        #[source]
        source: KafkaError,
    },

    #[error("no partition metadata found for topic {0}")]
    UnknownTopic(String),

    #[error("broker rejected {operation}: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },
}

impl BrokerError {
    pub fn kafka(operation: &'static str, source: KafkaError) -> Self {
        BrokerError::Kafka { operation, source }
    }

    /// Returns the operation tag for metrics
    pub fn operation(&self) -> &'static str {
        match self {
            BrokerError::Kafka { operation, .. } => operation,
            BrokerError::UnknownTopic(_) => "partitions_for",
            BrokerError::Rejected { operation, .. } => operation,
        }
    }
}

/// Synchronous offset commits.
///
/// Offsets are the last *processed* offset of each partition; implementations
/// translate them to whatever position convention the broker stores.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait Committer {
    fn commit_sync(&mut self, offsets: &PartitionOffsets) -> Result<(), BrokerError>;
}

/// Receives partition ownership changes of a subscribed consumer.
///
/// Callbacks run on the polling thread, from inside [`BrokerClient::poll`],
/// before the client completes the assignment change. Revoked partitions are
/// therefore still owned while `on_partitions_revoked` runs and may be
/// committed through the supplied committer.
pub trait RebalanceListener {
    type Error: From<BrokerError>;

    fn on_partitions_assigned(&mut self, partitions: &[TopicPartition]) -> Result<(), Self::Error>;

    fn on_partitions_revoked(
        &mut self,
        committer: &mut dyn Committer,
        partitions: &[TopicPartition],
    ) -> Result<(), Self::Error>;

    /// Ownership was lost without a clean hand-off (e.g. session timeout).
    /// Committing for these partitions is no longer allowed.
    fn on_partitions_lost(&mut self, partitions: &[TopicPartition]) -> Result<(), Self::Error>;
}

/// The consumer operations the poller needs from a broker client.
///
/// A client is owned by exactly one thread and is never shared.
pub trait BrokerClient: Committer {
    fn assign(&mut self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError>;

    /// Polls for records, waiting at most `timeout`. Rebalance callbacks are
    /// delivered to `listener` during the call.
    fn poll<L: RebalanceListener>(
        &mut self,
        timeout: Duration,
        listener: &mut L,
    ) -> Result<Vec<ConsumerRecord>, L::Error>;

    fn pause(&mut self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    fn resume(&mut self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    /// Committed group positions. Partitions without a committed offset are omitted.
    fn committed(&mut self, partitions: &[TopicPartition]) -> Result<PartitionOffsets, BrokerError>;

    /// The offset one past the last record of each partition.
    fn end_offsets(&mut self, partitions: &[TopicPartition]) -> Result<PartitionOffsets, BrokerError>;

    fn partitions_for(&mut self, topic: &str) -> Result<Vec<TopicPartition>, BrokerError>;

    fn assignment(&self) -> Result<Vec<TopicPartition>, BrokerError>;

    fn close(&mut self) -> Result<(), BrokerError>;
}

//! Broker-facing half of the poller: partition types, the client contract
//! the poll loop is written against, and its librdkafka implementation.

pub mod broker;
pub mod config;
pub mod kafka_consumer;
pub mod types;

pub use broker::{BrokerClient, BrokerError, Committer, PartitionOffsets, RebalanceListener};
pub use kafka_consumer::KafkaBroker;
pub use types::{ConsumerRecord, Position, TopicPartition};

#[cfg(any(test, feature = "mock"))]
pub use broker::MockCommitter;

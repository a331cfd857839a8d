//! Messages sent from the poll loop to the host.

use common_kafka::{ConsumerRecord, PartitionOffsets, TopicPartition};
use serde::{Deserialize, Serialize};

use crate::error::NotifyError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Record {
        topic: String,
        partition: i32,
        offset: i64,
        /// Milliseconds since the epoch, -1 when the broker gave none
        timestamp: i64,
        #[serde(with = "base64_bytes")]
        value: Vec<u8>,
    },
    /// Grouped consumer received its first assignment
    Consuming,
    /// Anonymous consumer read everything that existed at startup
    CaughtUp,
    Assigned {
        partitions: Vec<TopicPartition>,
    },
    Unassigned {
        partitions: Vec<TopicPartition>,
    },
    Committed {
        offsets: Vec<CommittedOffset>,
    },
}

impl Notification {
    pub fn record(record: &ConsumerRecord) -> Self {
        Notification::Record {
            topic: record.partition.topic().to_owned(),
            partition: record.partition.partition(),
            offset: record.offset,
            timestamp: record.timestamp_millis,
            value: record.value.clone(),
        }
    }

    pub fn committed(offsets: &PartitionOffsets) -> Self {
        Notification::Committed {
            offsets: offsets
                .iter()
                .map(|(partition, offset)| CommittedOffset {
                    topic: partition.topic().to_owned(),
                    partition: partition.partition(),
                    offset: *offset,
                })
                .collect(),
        }
    }

    /// Tag used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Record { .. } => "record",
            Notification::Consuming => "consuming",
            Notification::CaughtUp => "caught_up",
            Notification::Assigned { .. } => "assigned",
            Notification::Unassigned { .. } => "unassigned",
            Notification::Committed { .. } => "committed",
        }
    }
}

/// Outbound channel to the host. Writes are synchronous: the poll loop does
/// not continue until the host has the message.
pub trait Notifier {
    fn emit(&mut self, notification: Notification) -> Result<(), NotifyError>;
}

mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(D::Error::custom)
    }
}

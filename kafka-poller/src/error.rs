use common_kafka::{BrokerError, TopicPartition};
use thiserror::Error;

/// Failures writing to the host's notification stream.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("failed to encode notification")]
    Encode(#[from] serde_json::Error),
    #[error("notification of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    #[error("failed to write notification to host")]
    Io(#[from] std::io::Error),
}

/// Enumeration of errors that end the poll loop. Every one of them is fatal:
/// the process logs it and exits with a failure status.
#[derive(Error, Debug)]
pub enum PollerError {
    #[error("protocol violation: acknowledgement for {0} with no pending records")]
    ProtocolViolation(TopicPartition),
    #[error("broker communication failed")]
    Broker(#[from] BrokerError),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("failed to notify host")]
    Notify(#[from] NotifyError),
}

impl PollerError {
    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            PollerError::ProtocolViolation(_) => "protocol_violation",
            PollerError::Broker(_) => "broker",
            PollerError::UnknownCommand(_) => "unknown_command",
            PollerError::Notify(_) => "notify",
        }
    }
}

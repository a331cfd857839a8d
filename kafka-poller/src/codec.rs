//! Length-prefixed JSON framing between the poller and its host.
//!
//! Each frame is a 4-byte big-endian body length followed by a JSON body.
//! Inbound frames are split by `LengthDelimitedCodec` in `main`; this module
//! only deals with frame bodies and with writing outbound frames.

use std::io::Write;

use bytes::{BufMut, BytesMut};
use common_kafka::{Position, TopicPartition};
use serde::Deserialize;
use tracing::{trace, warn};

use crate::commands::Command;
use crate::error::NotifyError;
use crate::notifications::{Notification, Notifier};

const LENGTH_PREFIX_BYTES: usize = 4;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostCommand {
    Ack {
        topic: String,
        partition: i32,
        offset: i64,
    },
    Stop,
    CommittedOffsets,
}

impl TryFrom<HostCommand> for Command {
    type Error = String;

    fn try_from(command: HostCommand) -> Result<Self, Self::Error> {
        match command {
            HostCommand::Ack {
                topic,
                partition,
                offset,
            } => {
                // Committing stores offset + 1, so the last offset is unusable
                if !(0..i64::MAX).contains(&offset) {
                    return Err(format!("ack offset {offset} is out of range"));
                }
                Ok(Command::Ack(Position::new(
                    TopicPartition::new(topic, partition),
                    offset,
                )))
            }
            HostCommand::Stop => Ok(Command::Stop),
            HostCommand::CommittedOffsets => Ok(Command::CommittedOffsets),
        }
    }
}

/// Decodes one inbound frame body. Anything that is not a known, valid
/// command is passed on as [`Command::Unrecognized`] for the loop to reject.
pub fn decode_command(body: &[u8]) -> Command {
    let decoded = serde_json::from_slice::<HostCommand>(body)
        .map_err(|e| e.to_string())
        .and_then(Command::try_from);

    match decoded {
        Ok(command) => command,
        Err(reason) => {
            let raw = String::from_utf8_lossy(body).into_owned();
            warn!(reason = %reason, "Failed to decode host command");
            Command::Unrecognized(raw)
        }
    }
}

/// Writes notifications as frames to `W`, flushing after each one.
pub struct FrameWriter<W> {
    writer: W,
    buf: BytesMut,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buf: BytesMut::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Notifier for FrameWriter<W> {
    fn emit(&mut self, notification: Notification) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(&notification)?;
        let length = u32::try_from(body.len()).map_err(|_| NotifyError::FrameTooLarge(body.len()))?;

        self.buf.clear();
        self.buf.reserve(LENGTH_PREFIX_BYTES + body.len());
        self.buf.put_u32(length);
        self.buf.put_slice(&body);

        self.writer.write_all(&self.buf)?;
        self.writer.flush()?;
        trace!(kind = notification.kind(), bytes = body.len(), "Sent notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn frames(mut bytes: &[u8]) -> Vec<serde_json::Value> {
        let mut decoded = Vec::new();
        while !bytes.is_empty() {
            let (prefix, rest) = bytes.split_at(LENGTH_PREFIX_BYTES);
            let length = u32::from_be_bytes(prefix.try_into().unwrap()) as usize;
            let (body, rest) = rest.split_at(length);
            decoded.push(serde_json::from_slice(body).unwrap());
            bytes = rest;
        }
        decoded
    }

    #[test]
    fn test_decode_ack() {
        let command = decode_command(br#"{"type":"ack","topic":"events","partition":2,"offset":17}"#);

        assert_eq!(
            command,
            Command::Ack(Position::new(TopicPartition::new("events", 2), 17))
        );
    }

    #[test]
    fn test_decode_unit_commands() {
        assert_eq!(decode_command(br#"{"type":"stop"}"#), Command::Stop);
        assert_eq!(
            decode_command(br#"{"type":"committed_offsets"}"#),
            Command::CommittedOffsets
        );
    }

    #[test]
    fn test_unknown_type_is_unrecognized() {
        let body = br#"{"type":"rewind","topic":"events"}"#;

        assert_eq!(
            decode_command(body),
            Command::Unrecognized(String::from_utf8_lossy(body).into_owned())
        );
    }

    #[test]
    fn test_malformed_body_is_unrecognized() {
        assert!(matches!(decode_command(b"\x00\x01"), Command::Unrecognized(_)));
        assert!(matches!(
            decode_command(br#"{"type":"ack","topic":"events"}"#),
            Command::Unrecognized(_)
        ));
    }

    #[test_case(-1; "negative")]
    #[test_case(i64::MIN; "minimum")]
    #[test_case(i64::MAX; "no next offset")]
    fn test_out_of_range_ack_offset_is_unrecognized(offset: i64) {
        let body = format!(r#"{{"type":"ack","topic":"events","partition":0,"offset":{offset}}}"#);

        assert_eq!(
            decode_command(body.as_bytes()),
            Command::Unrecognized(body.clone())
        );
    }

    #[test]
    fn test_largest_committable_ack_offset_is_accepted() {
        let body = format!(
            r#"{{"type":"ack","topic":"events","partition":0,"offset":{}}}"#,
            i64::MAX - 1
        );

        assert_eq!(
            decode_command(body.as_bytes()),
            Command::Ack(Position::new(TopicPartition::new("events", 0), i64::MAX - 1))
        );
    }

    #[test]
    fn test_frame_writer_prefixes_each_notification() {
        let mut writer = FrameWriter::new(Vec::new());

        writer.emit(Notification::Consuming).unwrap();
        writer
            .emit(Notification::Unassigned {
                partitions: vec![TopicPartition::new("events", 1)],
            })
            .unwrap();

        let output = writer.into_inner();
        assert_eq!(&output[..LENGTH_PREFIX_BYTES], &[0, 0, 0, 20]);
        assert_eq!(
            frames(&output),
            vec![
                json!({"type": "consuming"}),
                json!({"type": "unassigned", "partitions": [{"topic": "events", "partition": 1}]}),
            ]
        );
    }
}

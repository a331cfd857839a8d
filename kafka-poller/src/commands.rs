//! Hand-off of host commands to the poll loop thread.
//!
//! Producers (the stdin reader, signal handlers, tests) may live on any
//! thread. The loop drains everything queued once per iteration without
//! blocking, and applies commands strictly in the order they were sent.

use common_kafka::Position;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// The host processed every record of the partition up to and including
    /// this offset.
    Ack(Position),
    Stop,
    /// Report the group's committed offsets for the current assignment.
    CommittedOffsets,
    /// A frame that could not be decoded, kept in order so the loop can fail
    /// on it at the right point.
    Unrecognized(String),
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Ack(_) => "ack",
            Command::Stop => "stop",
            Command::CommittedOffsets => "committed_offsets",
            Command::Unrecognized(_) => "unrecognized",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandSender {
    /// Queues `command`. Once the loop is gone there is nobody left to obey
    /// it, so a closed queue just drops it.
    pub fn send(&self, command: Command) {
        if let Err(e) = self.tx.send(command) {
            debug!(command = e.0.kind(), "Poller stopped, dropping command");
        }
    }
}

#[derive(Debug)]
pub struct CommandQueue {
    rx: mpsc::UnboundedReceiver<Command>,
}

impl CommandQueue {
    /// Takes every command queued so far.
    pub fn drain(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(command) => commands.push(command),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        commands
    }
}

pub fn command_channel() -> (CommandSender, CommandQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandSender { tx }, CommandQueue { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_kafka::TopicPartition;

    #[test]
    fn test_drain_preserves_order() {
        let (sender, mut queue) = command_channel();
        let ack = Command::Ack(Position::new(TopicPartition::new("events", 0), 1));

        sender.send(ack.clone());
        sender.send(Command::CommittedOffsets);
        sender.clone().send(Command::Stop);

        assert_eq!(
            queue.drain(),
            vec![ack, Command::CommittedOffsets, Command::Stop]
        );
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_send_from_other_threads() {
        let (sender, mut queue) = command_channel();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sender = sender.clone();
                std::thread::spawn(move || sender.send(Command::CommittedOffsets))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.drain().len(), 4);
    }

    #[test]
    fn test_send_after_queue_dropped_does_not_fail() {
        let (sender, queue) = command_channel();
        drop(queue);

        sender.send(Command::Stop);
    }
}

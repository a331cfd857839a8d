//! The poll loop.
//!
//! One thread owns the broker client and every piece of per-partition state.
//! Each iteration applies queued host commands, adjusts pause state, flushes
//! commits when due, polls, and forwards the polled records to the host.

use std::ops::ControlFlow;
use std::time::Duration;

use common_kafka::{BrokerClient, Position, TopicPartition};
use tracing::{debug, error, info, warn};

use crate::backpressure::{BackpressureTracker, Thresholds};
use crate::catch_up::CatchUpTracker;
use crate::commands::{Command, CommandQueue};
use crate::commits::CommitBatcher;
use crate::error::PollerError;
use crate::metrics_consts::{
    COMMANDS_APPLIED, PARTITIONS_PAUSED, PARTITIONS_RESUMED, PAUSED_PARTITIONS, POLLER_FATAL_ERRORS,
    POLL_BATCH_SIZE, RECORDS_DELIVERED, STALE_ACKNOWLEDGEMENTS,
};
use crate::notifications::{Notification, Notifier};
use crate::rebalance::RebalanceHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerSettings {
    pub topics: Vec<String>,
    /// `None` consumes anonymously: all partitions, no group, no commits.
    pub group_id: Option<String>,
    pub poll_timeout: Duration,
    pub commit_interval: Duration,
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Starting,
    Consuming,
    Stopped,
}

enum ConsumerMode {
    Grouped { commits: CommitBatcher },
    Anonymous { catch_up: CatchUpTracker },
}

pub struct Poller<B, N> {
    broker: B,
    notifier: N,
    commands: CommandQueue,
    topics: Vec<String>,
    mode: ConsumerMode,
    backpressure: BackpressureTracker,
    poll_timeout: Duration,
    state: PollerState,
}

impl<B: BrokerClient, N: Notifier> Poller<B, N> {
    pub fn new(broker: B, notifier: N, commands: CommandQueue, settings: PollerSettings) -> Self {
        let mode = match settings.group_id {
            Some(_) => ConsumerMode::Grouped {
                commits: CommitBatcher::new(settings.commit_interval),
            },
            None => ConsumerMode::Anonymous {
                catch_up: CatchUpTracker::disabled(),
            },
        };

        Self {
            broker,
            notifier,
            commands,
            topics: settings.topics,
            mode,
            backpressure: BackpressureTracker::new(settings.thresholds),
            poll_timeout: settings.poll_timeout,
            state: PollerState::Starting,
        }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    /// Starts consuming and loops until the host asks to stop or something
    /// fails. Every error is fatal.
    pub fn run(&mut self) -> Result<(), PollerError> {
        let result = self.start().and_then(|()| {
            while self.run_once()?.is_continue() {}
            Ok(())
        });

        if let Err(e) = &result {
            error!(error = ?e, "Poller failed");
            metrics::counter!(POLLER_FATAL_ERRORS, "error_type" => e.error_type()).increment(1);
            self.state = PollerState::Stopped;
        }
        result
    }

    /// Subscribes a grouped consumer, or assigns an anonymous one every
    /// partition of its topics.
    pub fn start(&mut self) -> Result<(), PollerError> {
        match &mut self.mode {
            ConsumerMode::Grouped { .. } => {
                info!(topics = ?self.topics, "Starting group consumer");
                self.broker.subscribe(&self.topics)?;
            }
            ConsumerMode::Anonymous { catch_up } => {
                info!(topics = ?self.topics, "Starting anonymous consumer");
                let mut partitions = Vec::new();
                for topic in &self.topics {
                    partitions.extend(self.broker.partitions_for(topic)?);
                }

                self.broker.assign(&partitions)?;
                let end_offsets = self.broker.end_offsets(&partitions)?;
                self.notifier.emit(Notification::Assigned { partitions })?;

                *catch_up = CatchUpTracker::from_end_offsets(&end_offsets);
                if catch_up.take_caught_up() {
                    info!("Nothing to catch up on");
                    self.notifier.emit(Notification::CaughtUp)?;
                }
                self.state = PollerState::Consuming;
            }
        }
        Ok(())
    }

    /// One loop iteration. Breaks once a stop command has been applied.
    pub fn run_once(&mut self) -> Result<ControlFlow<()>, PollerError> {
        for command in self.commands.drain() {
            if self.handle_command(command)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }

        self.apply_backpressure()?;

        if let ConsumerMode::Grouped { commits } = &mut self.mode {
            commits.flush(&mut self.broker, false)?;
        }

        let mut handler = RebalanceHandler {
            backpressure: &mut self.backpressure,
            commits: match &mut self.mode {
                ConsumerMode::Grouped { commits } => Some(commits),
                ConsumerMode::Anonymous { .. } => None,
            },
            notifier: &mut self.notifier,
        };
        let records = self.broker.poll(self.poll_timeout, &mut handler)?;

        self.maybe_emit_consuming()?;

        if records.is_empty() {
            return Ok(ControlFlow::Continue(()));
        }
        metrics::histogram!(POLL_BATCH_SIZE).record(records.len() as f64);
        debug!(count = records.len(), "Delivering records");

        for record in &records {
            self.notifier.emit(Notification::record(record))?;
            self.backpressure
                .record_delivered(&record.partition, record.size_bytes());
        }
        metrics::counter!(RECORDS_DELIVERED).increment(records.len() as u64);

        Ok(ControlFlow::Continue(()))
    }

    fn handle_command(&mut self, command: Command) -> Result<ControlFlow<()>, PollerError> {
        metrics::counter!(COMMANDS_APPLIED, "command" => command.kind()).increment(1);

        match command {
            Command::Ack(position) => self.acknowledge(&position)?,
            Command::CommittedOffsets => {
                let assignment = self.broker.assignment()?;
                let committed = self.broker.committed(&assignment)?;
                self.notifier.emit(Notification::committed(&committed))?;
            }
            Command::Stop => {
                info!("Stopping poller");
                if let ConsumerMode::Grouped { commits } = &mut self.mode {
                    commits.flush(&mut self.broker, true)?;
                }
                self.broker.close()?;
                self.state = PollerState::Stopped;
                return Ok(ControlFlow::Break(()));
            }
            Command::Unrecognized(raw) => return Err(PollerError::UnknownCommand(raw)),
        }

        Ok(ControlFlow::Continue(()))
    }

    fn acknowledge(&mut self, position: &Position) -> Result<(), PollerError> {
        let partition = position.partition();

        match &mut self.mode {
            ConsumerMode::Grouped { commits } => {
                if self.backpressure.was_released(partition) {
                    // Revoked or lost after the record was delivered
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        offset = position.offset(),
                        "Ignoring acknowledgement for partition no longer owned"
                    );
                    metrics::counter!(STALE_ACKNOWLEDGEMENTS).increment(1);
                    return Ok(());
                }
                self.backpressure.record_acknowledged(partition)?;
                commits.record(partition, position.offset());
            }
            ConsumerMode::Anonymous { catch_up } => {
                self.backpressure.record_acknowledged(partition)?;
                if catch_up.acknowledge(position) {
                    info!("Caught up with end offsets captured at startup");
                    self.notifier.emit(Notification::CaughtUp)?;
                }
            }
        }
        Ok(())
    }

    fn apply_backpressure(&mut self) -> Result<(), PollerError> {
        let assignment = self.broker.assignment()?;
        let reconciliation = self.backpressure.reconcile(&assignment);
        if reconciliation.is_empty() {
            return Ok(());
        }

        if !reconciliation.pause.is_empty() {
            log_partitions("Pausing partitions", &reconciliation.pause);
            self.broker.pause(&reconciliation.pause)?;
            metrics::counter!(PARTITIONS_PAUSED).increment(reconciliation.pause.len() as u64);
        }
        if !reconciliation.resume.is_empty() {
            log_partitions("Resuming partitions", &reconciliation.resume);
            self.broker.resume(&reconciliation.resume)?;
            metrics::counter!(PARTITIONS_RESUMED).increment(reconciliation.resume.len() as u64);
        }
        metrics::gauge!(PAUSED_PARTITIONS).set(self.backpressure.paused_count() as f64);
        Ok(())
    }

    fn maybe_emit_consuming(&mut self) -> Result<(), PollerError> {
        if self.state != PollerState::Starting {
            return Ok(());
        }
        if self.broker.assignment()?.is_empty() {
            return Ok(());
        }

        info!("Group assignment received, consuming");
        self.notifier.emit(Notification::Consuming)?;
        self.state = PollerState::Consuming;
        Ok(())
    }
}

fn log_partitions(message: &str, partitions: &[TopicPartition]) {
    for partition in partitions {
        debug!(
            topic = partition.topic(),
            partition = partition.partition(),
            "{}",
            message
        );
    }
}

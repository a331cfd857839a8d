//! Kafka poller: consumes Kafka on behalf of a host process.
//!
//! Records go to the host as length-prefixed frames on stdout; the host
//! acknowledges them (and asks to stop) through frames on stdin. The poller
//! pauses partitions the host falls behind on and, in group mode, commits
//! acknowledged offsets in batches.

pub mod backpressure;
pub mod catch_up;
pub mod codec;
pub mod commands;
pub mod commits;
pub mod config;
pub mod error;
pub mod metrics_consts;
pub mod notifications;
pub mod poller;
pub mod rebalance;
pub mod test_utils;

pub use commands::{command_channel, Command, CommandQueue, CommandSender};
pub use error::PollerError;
pub use poller::{Poller, PollerSettings, PollerState};

//! Detects when an anonymous consumer has read everything that existed at
//! startup.

use std::collections::HashSet;

use common_kafka::{PartitionOffsets, Position};
use tracing::info;

/// Tracks the end positions captured when an anonymous consumer started.
///
/// A target is met when the host acknowledges the record just before it, so
/// targets are compared against [`Position::next`] of each acknowledgement.
/// Empty partitions (end offset 0) have nothing to catch up on and are left out.
#[derive(Debug, Default)]
pub struct CatchUpTracker {
    targets: Option<HashSet<Position>>,
}

impl CatchUpTracker {
    /// A tracker that never reports anything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_end_offsets(end_offsets: &PartitionOffsets) -> Self {
        let targets: HashSet<Position> = end_offsets
            .iter()
            .filter(|(_, offset)| **offset > 0)
            .map(|(partition, offset)| Position::new(partition.clone(), *offset))
            .collect();

        info!(partitions = targets.len(), "Tracking catch-up targets");
        Self {
            targets: Some(targets),
        }
    }

    /// Whether a caught-up notification is still owed.
    pub fn is_active(&self) -> bool {
        self.targets.is_some()
    }

    pub fn remaining(&self) -> usize {
        self.targets.as_ref().map_or(0, HashSet::len)
    }

    /// Records an acknowledgement. Returns true exactly once, when the last
    /// outstanding target is reached.
    pub fn acknowledge(&mut self, acknowledged: &Position) -> bool {
        let Some(targets) = self.targets.as_mut() else {
            return false;
        };
        if !targets.remove(&acknowledged.next()) || !targets.is_empty() {
            return false;
        }

        self.targets = None;
        true
    }

    /// Reports completion when there was nothing to read in the first place.
    /// Like [`CatchUpTracker::acknowledge`], returns true at most once.
    pub fn take_caught_up(&mut self) -> bool {
        if self.targets.as_ref().is_some_and(HashSet::is_empty) {
            self.targets = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_kafka::TopicPartition;

    fn position(num: i32, offset: i64) -> Position {
        Position::new(TopicPartition::new("test-topic", num), offset)
    }

    fn end_offsets(entries: &[(i32, i64)]) -> PartitionOffsets {
        entries
            .iter()
            .map(|&(num, offset)| (TopicPartition::new("test-topic", num), offset))
            .collect()
    }

    #[test]
    fn test_caught_up_after_last_target_acknowledged() {
        let mut tracker = CatchUpTracker::from_end_offsets(&end_offsets(&[(0, 10), (1, 0), (2, 5)]));
        assert_eq!(tracker.remaining(), 2);
        assert!(!tracker.take_caught_up());

        assert!(!tracker.acknowledge(&position(0, 9)));
        assert_eq!(tracker.remaining(), 1);
        assert!(tracker.acknowledge(&position(2, 4)));

        assert!(!tracker.is_active());
    }

    #[test]
    fn test_caught_up_reported_once() {
        let mut tracker = CatchUpTracker::from_end_offsets(&end_offsets(&[(0, 3)]));

        assert!(tracker.acknowledge(&position(0, 2)));
        assert!(!tracker.acknowledge(&position(0, 2)));
        assert!(!tracker.take_caught_up());
    }

    #[test]
    fn test_acknowledgements_short_of_target_do_not_count() {
        let mut tracker = CatchUpTracker::from_end_offsets(&end_offsets(&[(0, 3)]));

        assert!(!tracker.acknowledge(&position(0, 0)));
        assert!(!tracker.acknowledge(&position(0, 1)));
        assert!(!tracker.acknowledge(&position(1, 2)));
        assert_eq!(tracker.remaining(), 1);
    }

    #[test]
    fn test_all_partitions_empty_is_immediately_caught_up() {
        let mut tracker = CatchUpTracker::from_end_offsets(&end_offsets(&[(0, 0), (1, 0)]));

        assert!(tracker.is_active());
        assert!(tracker.take_caught_up());
        assert!(!tracker.take_caught_up());
        assert!(!tracker.is_active());
    }

    #[test]
    fn test_disabled_tracker_never_fires() {
        let mut tracker = CatchUpTracker::disabled();

        assert!(!tracker.take_caught_up());
        assert!(!tracker.acknowledge(&position(0, 0)));
        assert_eq!(tracker.remaining(), 0);
    }
}

//! Batches acknowledged offsets into periodic group commits.

use std::time::{Duration, Instant};

use common_kafka::{BrokerError, Committer, PartitionOffsets, TopicPartition};
use tracing::{debug, info, warn};

use crate::metrics_consts::{COMMITS_DISCARDED, OFFSET_COMMITS};

/// Highest acknowledged offset per partition since the last flush.
pub struct CommitBatcher {
    pending: PartitionOffsets,
    interval: Duration,
    last_flush: Instant,
}

impl CommitBatcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            pending: PartitionOffsets::new(),
            interval,
            last_flush: Instant::now(),
        }
    }

    /// Remembers `offset` as processed unless a higher one is already pending.
    pub fn record(&mut self, partition: &TopicPartition, offset: i64) {
        match self.pending.get_mut(partition) {
            Some(pending) if *pending >= offset => {}
            Some(pending) => *pending = offset,
            None => {
                self.pending.insert(partition.clone(), offset);
            }
        }
    }

    pub fn pending(&self) -> &PartitionOffsets {
        &self.pending
    }

    /// Commits everything pending. Unless `force` is set this is a no-op until
    /// the commit interval has elapsed since the previous flush.
    ///
    /// Returns whether a commit was issued.
    pub fn flush<C: Committer + ?Sized>(
        &mut self,
        committer: &mut C,
        force: bool,
    ) -> Result<bool, BrokerError> {
        if !force && self.last_flush.elapsed() < self.interval {
            return Ok(false);
        }
        self.last_flush = Instant::now();

        if self.pending.is_empty() {
            return Ok(false);
        }

        let trigger = if force { "forced" } else { "interval" };
        if let Err(e) = committer.commit_sync(&self.pending) {
            metrics::counter!(OFFSET_COMMITS, "trigger" => trigger, "outcome" => "failure")
                .increment(1);
            return Err(e);
        }
        metrics::counter!(OFFSET_COMMITS, "trigger" => trigger, "outcome" => "success")
            .increment(1);

        debug!(partitions = self.pending.len(), trigger, "Committed offsets");
        self.pending.clear();
        Ok(true)
    }

    /// Commits whatever is pending for `partitions` before they change owner,
    /// then forgets them. Failures are logged only: the partitions are about
    /// to be reassigned either way.
    pub fn partitions_revoked<C: Committer + ?Sized>(
        &mut self,
        committer: &mut C,
        partitions: &[TopicPartition],
    ) {
        let revoked = self.take(partitions);
        if revoked.is_empty() {
            return;
        }

        match committer.commit_sync(&revoked) {
            Ok(()) => {
                info!(
                    partitions = revoked.len(),
                    "Committed offsets of revoked partitions"
                );
                metrics::counter!(OFFSET_COMMITS, "trigger" => "revoke", "outcome" => "success")
                    .increment(1);
            }
            Err(e) => {
                warn!(
                    error = ?e,
                    partitions = revoked.len(),
                    "Failed to commit offsets of revoked partitions"
                );
                metrics::counter!(OFFSET_COMMITS, "trigger" => "revoke", "outcome" => "failure")
                    .increment(1);
            }
        }
    }

    /// Forgets pending offsets of `partitions` without committing them; we may
    /// no longer be allowed to.
    pub fn partitions_lost(&mut self, partitions: &[TopicPartition]) {
        let lost = self.take(partitions);
        if !lost.is_empty() {
            warn!(
                partitions = lost.len(),
                "Discarded uncommitted offsets of lost partitions"
            );
            metrics::counter!(COMMITS_DISCARDED).increment(lost.len() as u64);
        }
    }

    fn take(&mut self, partitions: &[TopicPartition]) -> PartitionOffsets {
        partitions
            .iter()
            .filter_map(|partition| {
                self.pending
                    .remove(partition)
                    .map(|offset| (partition.clone(), offset))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_kafka::MockCommitter;

    fn partition(num: i32) -> TopicPartition {
        TopicPartition::new("test-topic", num)
    }

    fn offsets(entries: &[(i32, i64)]) -> PartitionOffsets {
        entries
            .iter()
            .map(|&(num, offset)| (partition(num), offset))
            .collect()
    }

    #[test]
    fn test_record_keeps_highest_offset() {
        let mut batcher = CommitBatcher::new(Duration::from_secs(5));

        batcher.record(&partition(0), 10);
        batcher.record(&partition(0), 4);
        batcher.record(&partition(1), 3);
        batcher.record(&partition(1), 7);

        assert_eq!(batcher.pending(), &offsets(&[(0, 10), (1, 7)]));
    }

    #[test]
    fn test_flush_waits_for_interval() {
        let mut batcher = CommitBatcher::new(Duration::from_secs(3600));
        let mut committer = MockCommitter::new();
        committer.expect_commit_sync().times(0);

        batcher.record(&partition(0), 1);

        assert!(!batcher.flush(&mut committer, false).unwrap());
        assert_eq!(batcher.pending().len(), 1);
    }

    #[test]
    fn test_forced_flush_commits_everything() {
        let mut batcher = CommitBatcher::new(Duration::from_secs(3600));
        let mut committer = MockCommitter::new();
        let expected = offsets(&[(0, 5), (1, 9)]);
        committer
            .expect_commit_sync()
            .withf(move |committed| *committed == expected)
            .times(1)
            .returning(|_| Ok(()));

        batcher.record(&partition(0), 5);
        batcher.record(&partition(1), 9);

        assert!(batcher.flush(&mut committer, true).unwrap());
        assert!(batcher.pending().is_empty());
    }

    #[test]
    fn test_reflush_without_new_acknowledgements_is_noop() {
        let mut batcher = CommitBatcher::new(Duration::ZERO);
        let mut committer = MockCommitter::new();
        committer.expect_commit_sync().times(1).returning(|_| Ok(()));

        batcher.record(&partition(0), 5);

        assert!(batcher.flush(&mut committer, false).unwrap());
        assert!(!batcher.flush(&mut committer, false).unwrap());
        assert!(!batcher.flush(&mut committer, true).unwrap());
    }

    #[test]
    fn test_failed_flush_surfaces_error_and_keeps_offsets() {
        let mut batcher = CommitBatcher::new(Duration::ZERO);
        let mut committer = MockCommitter::new();
        committer.expect_commit_sync().times(1).returning(|_| {
            Err(BrokerError::Rejected {
                operation: "commit",
                reason: "coordinator unavailable".to_string(),
            })
        });

        batcher.record(&partition(0), 5);

        let result = batcher.flush(&mut committer, false);
        assert!(matches!(result, Err(BrokerError::Rejected { .. })));
        assert_eq!(batcher.pending(), &offsets(&[(0, 5)]));
    }

    #[test]
    fn test_revoked_partitions_are_committed_and_dropped() {
        let mut batcher = CommitBatcher::new(Duration::from_secs(3600));
        let mut committer = MockCommitter::new();
        let expected = offsets(&[(0, 5)]);
        committer
            .expect_commit_sync()
            .withf(move |committed| *committed == expected)
            .times(1)
            .returning(|_| Ok(()));

        batcher.record(&partition(0), 5);
        batcher.record(&partition(1), 8);

        batcher.partitions_revoked(&mut committer, &[partition(0), partition(2)]);

        assert_eq!(batcher.pending(), &offsets(&[(1, 8)]));
    }

    #[test]
    fn test_revoke_commit_failure_is_not_fatal() {
        let mut batcher = CommitBatcher::new(Duration::from_secs(3600));
        let mut committer = MockCommitter::new();
        committer.expect_commit_sync().times(1).returning(|_| {
            Err(BrokerError::Rejected {
                operation: "commit",
                reason: "rebalance in progress".to_string(),
            })
        });

        batcher.record(&partition(0), 5);
        batcher.partitions_revoked(&mut committer, &[partition(0)]);

        assert!(batcher.pending().is_empty());
    }

    #[test]
    fn test_revoke_without_pending_offsets_does_not_commit() {
        let mut batcher = CommitBatcher::new(Duration::from_secs(3600));
        let mut committer = MockCommitter::new();
        committer.expect_commit_sync().times(0);

        batcher.record(&partition(1), 5);
        batcher.partitions_revoked(&mut committer, &[partition(0)]);

        assert_eq!(batcher.pending(), &offsets(&[(1, 5)]));
    }

    #[test]
    fn test_lost_partition_is_never_committed() {
        let mut batcher = CommitBatcher::new(Duration::ZERO);
        let mut committer = MockCommitter::new();
        let expected = offsets(&[(1, 3)]);
        committer
            .expect_commit_sync()
            .withf(move |committed| *committed == expected)
            .times(1)
            .returning(|_| Ok(()));

        batcher.record(&partition(0), 5);
        batcher.record(&partition(1), 3);
        batcher.partitions_lost(&[partition(0)]);

        batcher.flush(&mut committer, true).unwrap();
    }

    #[test]
    fn test_new_acknowledgement_after_loss_is_committed() {
        let mut batcher = CommitBatcher::new(Duration::ZERO);
        let mut committer = MockCommitter::new();
        let expected = offsets(&[(0, 2)]);
        committer
            .expect_commit_sync()
            .withf(move |committed| *committed == expected)
            .times(1)
            .returning(|_| Ok(()));

        batcher.record(&partition(0), 5);
        batcher.partitions_lost(&[partition(0)]);
        // Reassigned and consumed again from an older committed position
        batcher.record(&partition(0), 2);

        batcher.flush(&mut committer, false).unwrap();
    }
}

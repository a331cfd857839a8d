use common_kafka::{Committer, RebalanceListener, TopicPartition};
use tracing::{info, warn};

use crate::backpressure::BackpressureTracker;
use crate::commits::CommitBatcher;
use crate::error::PollerError;
use crate::metrics_consts::{PAUSED_PARTITIONS, REBALANCE_EMPTY_SKIPPED, REBALANCE_EVENTS};
use crate::notifications::{Notification, Notifier};

/// Keeps the loop's per-partition state in step with group rebalances.
///
/// Built by the loop around each poll call, borrowing its state for the
/// duration of that call only. Anonymous consumers pass no commit batcher.
pub struct RebalanceHandler<'a, N> {
    pub backpressure: &'a mut BackpressureTracker,
    pub commits: Option<&'a mut CommitBatcher>,
    pub notifier: &'a mut N,
}

impl<N: Notifier> RebalanceHandler<'_, N> {
    fn skip_empty(&self, event: &'static str, partitions: &[TopicPartition]) -> bool {
        if partitions.is_empty() {
            info!(event, "Skipping rebalance with no partitions");
            metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event" => event).increment(1);
            return true;
        }
        metrics::counter!(REBALANCE_EVENTS, "event" => event).increment(1);
        false
    }

    fn release(&mut self, partitions: &[TopicPartition]) -> Result<(), PollerError> {
        self.backpressure.remove_partitions(partitions);
        metrics::gauge!(PAUSED_PARTITIONS).set(self.backpressure.paused_count() as f64);

        self.notifier.emit(Notification::Unassigned {
            partitions: partitions.to_vec(),
        })?;
        Ok(())
    }
}

impl<N: Notifier> RebalanceListener for RebalanceHandler<'_, N> {
    type Error = PollerError;

    fn on_partitions_assigned(&mut self, partitions: &[TopicPartition]) -> Result<(), PollerError> {
        if self.skip_empty("assign", partitions) {
            return Ok(());
        }
        info!(count = partitions.len(), "Partitions assigned: {:?}", partitions);

        self.notifier.emit(Notification::Assigned {
            partitions: partitions.to_vec(),
        })?;
        Ok(())
    }

    fn on_partitions_revoked(
        &mut self,
        committer: &mut dyn Committer,
        partitions: &[TopicPartition],
    ) -> Result<(), PollerError> {
        if self.skip_empty("revoke", partitions) {
            return Ok(());
        }
        info!(count = partitions.len(), "Partitions revoked: {:?}", partitions);

        if let Some(commits) = self.commits.as_deref_mut() {
            commits.partitions_revoked(committer, partitions);
        }
        self.release(partitions)
    }

    fn on_partitions_lost(&mut self, partitions: &[TopicPartition]) -> Result<(), PollerError> {
        if self.skip_empty("lost", partitions) {
            return Ok(());
        }
        warn!(count = partitions.len(), "Partitions lost: {:?}", partitions);

        if let Some(commits) = self.commits.as_deref_mut() {
            commits.partitions_lost(partitions);
        }
        self.release(partitions)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::RecordingNotifier;
    use common_kafka::MockCommitter;

    fn partition(num: i32) -> TopicPartition {
        TopicPartition::new("test-topic", num)
    }

    #[test]
    fn test_assigned_notifies_host() {
        let mut backpressure = BackpressureTracker::default();
        let mut notifier = RecordingNotifier::default();
        let mut handler = RebalanceHandler {
            backpressure: &mut backpressure,
            commits: None,
            notifier: &mut notifier,
        };

        handler.on_partitions_assigned(&[partition(0)]).unwrap();

        assert_eq!(
            notifier.notifications,
            vec![Notification::Assigned {
                partitions: vec![partition(0)]
            }]
        );
    }

    #[test]
    fn test_revoked_commits_then_forgets_partitions() {
        let mut backpressure = BackpressureTracker::default();
        let mut commits = CommitBatcher::new(Duration::from_secs(3600));
        let mut notifier = RecordingNotifier::default();
        let mut committer = MockCommitter::new();
        committer
            .expect_commit_sync()
            .withf(|offsets| offsets.get(&partition(0)) == Some(&4) && offsets.len() == 1)
            .times(1)
            .returning(|_| Ok(()));

        for _ in 0..600 {
            backpressure.record_delivered(&partition(0), 1);
        }
        backpressure.reconcile(&[partition(0)]);
        commits.record(&partition(0), 4);

        let mut handler = RebalanceHandler {
            backpressure: &mut backpressure,
            commits: Some(&mut commits),
            notifier: &mut notifier,
        };
        handler
            .on_partitions_revoked(&mut committer, &[partition(0)])
            .unwrap();

        assert!(!backpressure.is_tracked(&partition(0)));
        assert!(!backpressure.is_paused(&partition(0)));
        assert!(commits.pending().is_empty());
        assert_eq!(
            notifier.notifications,
            vec![Notification::Unassigned {
                partitions: vec![partition(0)]
            }]
        );
    }

    #[test]
    fn test_lost_discards_without_committing() {
        let mut backpressure = BackpressureTracker::default();
        let mut commits = CommitBatcher::new(Duration::from_secs(3600));
        let mut notifier = RecordingNotifier::default();

        backpressure.record_delivered(&partition(1), 10);
        commits.record(&partition(1), 0);

        let mut handler = RebalanceHandler {
            backpressure: &mut backpressure,
            commits: Some(&mut commits),
            notifier: &mut notifier,
        };
        handler.on_partitions_lost(&[partition(1)]).unwrap();

        assert!(!backpressure.is_tracked(&partition(1)));
        assert!(commits.pending().is_empty());
        assert_eq!(notifier.notifications.len(), 1);
    }

    #[test]
    fn test_empty_rebalances_are_skipped() {
        let mut backpressure = BackpressureTracker::default();
        let mut notifier = RecordingNotifier::default();
        let mut committer = MockCommitter::new();
        committer.expect_commit_sync().times(0);

        let mut handler = RebalanceHandler {
            backpressure: &mut backpressure,
            commits: None,
            notifier: &mut notifier,
        };
        handler.on_partitions_assigned(&[]).unwrap();
        handler.on_partitions_revoked(&mut committer, &[]).unwrap();
        handler.on_partitions_lost(&[]).unwrap();

        assert!(notifier.notifications.is_empty());
    }
}

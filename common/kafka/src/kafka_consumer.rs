use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, RebalanceProtocol};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::types::RDKafkaRespErr;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, BrokerError, Committer, PartitionOffsets, RebalanceListener};
use crate::types::{ConsumerRecord, TopicPartition};

/// Rebalance callbacks captured inside librdkafka's poll, replayed by
/// [`KafkaBroker::poll`] once the poll call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RebalanceEvent {
    Assign(Vec<TopicPartition>),
    Revoke(Vec<TopicPartition>),
    Lost(Vec<TopicPartition>),
    Failed(RDKafkaErrorCode),
}

/// Consumer context that defers assignment changes to the polling code.
///
/// librdkafka keeps the group waiting until the application calls
/// assign/unassign, so the listener gets to run (and commit revoked
/// partitions) while ownership is still ours. Once the client is closing
/// nothing replays the queue any more, so changes are completed in place.
pub struct PollerContext {
    rebalance_tx: mpsc::UnboundedSender<RebalanceEvent>,
    closing: AtomicBool,
}

impl ClientContext for PollerContext {}

impl ConsumerContext for PollerContext {
    fn rebalance(
        &self,
        base_consumer: &BaseConsumer<Self>,
        err: RDKafkaRespErr,
        tpl: &mut TopicPartitionList,
    ) {
        let partitions: Vec<TopicPartition> = tpl
            .elements()
            .into_iter()
            .map(TopicPartition::from)
            .collect();

        let event = match err {
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__ASSIGN_PARTITIONS => {
                RebalanceEvent::Assign(partitions)
            }
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__REVOKE_PARTITIONS
                if base_consumer.assignment_lost() =>
            {
                RebalanceEvent::Lost(partitions)
            }
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__REVOKE_PARTITIONS => {
                RebalanceEvent::Revoke(partitions)
            }
            other => {
                let code = RDKafkaErrorCode::from(other);
                error!("Rebalance error: {}", code);
                RebalanceEvent::Failed(code)
            }
        };

        if self.closing.load(Ordering::Acquire) {
            debug!("Completing rebalance event while closing: {:?}", event);
            if let Err(e) = complete_rebalance(base_consumer, &event) {
                error!(error = ?e, "Failed to complete rebalance while closing");
            }
            return;
        }

        debug!("Queued rebalance event: {:?}", event);
        if let Err(e) = self.rebalance_tx.send(event) {
            error!("Failed to queue rebalance event: {}", e);
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        if let Err(e) = result {
            warn!(
                "Failed to commit offsets for {} partitions: {}",
                offsets.count(),
                e
            );
        }
    }
}

const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// [`BrokerClient`] backed by an rdkafka `BaseConsumer`.
pub struct KafkaBroker {
    consumer: BaseConsumer<PollerContext>,
    rebalance_rx: mpsc::UnboundedReceiver<RebalanceEvent>,
    operation_timeout: Duration,
    max_poll_records: usize,
    subscribed: bool,
}

impl KafkaBroker {
    pub fn new(
        config: &ClientConfig,
        operation_timeout: Duration,
        max_poll_records: usize,
    ) -> Result<Self, BrokerError> {
        let (rebalance_tx, rebalance_rx) = mpsc::unbounded_channel();
        let consumer: BaseConsumer<PollerContext> = config
            .create_with_context(PollerContext {
                rebalance_tx,
                closing: AtomicBool::new(false),
            })
            .map_err(|e| BrokerError::kafka("create_consumer", e))?;

        Ok(Self {
            consumer,
            rebalance_rx,
            operation_timeout,
            max_poll_records: max_poll_records.max(1),
            subscribed: false,
        })
    }

    /// Replays queued rebalance callbacks to `listener`, completing each
    /// assignment change afterwards. Returns the partitions given up.
    ///
    /// The change is completed even when the listener fails, otherwise
    /// librdkafka keeps waiting for it and the consumer never closes.
    fn dispatch_rebalances<L: RebalanceListener>(
        &mut self,
        listener: &mut L,
    ) -> Result<HashSet<TopicPartition>, L::Error> {
        let mut released = HashSet::new();

        while let Ok(event) = self.rebalance_rx.try_recv() {
            let notified = self.notify_listener(&event, listener, &mut released);
            complete_rebalance(&self.consumer, &event)?;
            notified?;
        }

        Ok(released)
    }

    fn notify_listener<L: RebalanceListener>(
        &mut self,
        event: &RebalanceEvent,
        listener: &mut L,
        released: &mut HashSet<TopicPartition>,
    ) -> Result<(), L::Error> {
        match event {
            RebalanceEvent::Assign(partitions) => listener.on_partitions_assigned(partitions),
            RebalanceEvent::Revoke(partitions) => {
                released.extend(partitions.iter().cloned());
                listener.on_partitions_revoked(&mut *self, partitions)
            }
            RebalanceEvent::Lost(partitions) => {
                released.extend(partitions.iter().cloned());
                listener.on_partitions_lost(partitions)
            }
            RebalanceEvent::Failed(code) => {
                // The whole assignment is dropped below
                let owned = self.assignment()?;
                warn!(
                    "Rebalance failed ({}), dropping {} assigned partitions",
                    code,
                    owned.len()
                );
                released.extend(owned.iter().cloned());
                listener.on_partitions_lost(&owned)
            }
        }
    }

    /// Completes assignment changes that were queued but never replayed.
    fn complete_pending_rebalances(&mut self) {
        while let Ok(event) = self.rebalance_rx.try_recv() {
            debug!("Completing undelivered rebalance event: {:?}", event);
            if let Err(e) = complete_rebalance(&self.consumer, &event) {
                error!(error = ?e, "Failed to complete pending rebalance");
            }
        }
    }

    fn start_closing(&mut self) {
        self.consumer
            .context()
            .closing
            .store(true, Ordering::Release);
        self.complete_pending_rebalances();
    }
}

impl Drop for KafkaBroker {
    /// Dropping the rdkafka consumer polls until the group leave finishes,
    /// which needs every revoke completed.
    fn drop(&mut self) {
        self.start_closing();
    }
}

fn complete_rebalance<C: ConsumerContext>(
    consumer: &BaseConsumer<C>,
    event: &RebalanceEvent,
) -> Result<(), BrokerError> {
    let cooperative = matches!(consumer.rebalance_protocol(), RebalanceProtocol::Cooperative);

    let result = match event {
        RebalanceEvent::Assign(partitions) => {
            let tpl = partition_list(partitions);
            if cooperative {
                consumer.incremental_assign(&tpl)
            } else {
                consumer.assign(&tpl)
            }
        }
        RebalanceEvent::Revoke(partitions) | RebalanceEvent::Lost(partitions) => {
            if cooperative {
                consumer.incremental_unassign(&partition_list(partitions))
            } else {
                consumer.unassign()
            }
        }
        RebalanceEvent::Failed(_) => consumer.unassign(),
    };

    result.map_err(|e| BrokerError::kafka("rebalance", e))
}

fn partition_list(partitions: &[TopicPartition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for partition in partitions {
        tpl.add_partition(partition.topic(), partition.partition());
    }
    tpl
}

impl Committer for KafkaBroker {
    /// Stores `offset + 1` for each partition: the group position is the next
    /// offset to read.
    fn commit_sync(&mut self, offsets: &PartitionOffsets) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in offsets {
            let next = match offset.checked_add(1) {
                Some(next) if *offset >= 0 => next,
                _ => {
                    return Err(BrokerError::Rejected {
                        operation: "commit",
                        reason: format!("invalid offset {offset} for {partition}"),
                    })
                }
            };
            tpl.add_partition_offset(partition.topic(), partition.partition(), Offset::Offset(next))
                .map_err(|e| BrokerError::kafka("commit", e))?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| BrokerError::kafka("commit", e))
    }
}

impl BrokerClient for KafkaBroker {
    fn assign(&mut self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        info!("Assigning {} partitions", partitions.len());
        self.consumer
            .assign(&partition_list(partitions))
            .map_err(|e| BrokerError::kafka("assign", e))
    }

    fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        info!("Subscribing to topics {:?}", topics);
        self.consumer
            .subscribe(&topics)
            .map_err(|e| BrokerError::kafka("subscribe", e))?;
        self.subscribed = true;
        Ok(())
    }

    fn poll<L: RebalanceListener>(
        &mut self,
        timeout: Duration,
        listener: &mut L,
    ) -> Result<Vec<ConsumerRecord>, L::Error> {
        let mut records = Vec::new();
        let mut wait = timeout;

        while records.len() < self.max_poll_records {
            let polled = match self.consumer.poll(wait) {
                None => None,
                Some(Ok(message)) => Some(ConsumerRecord::from_message(&message)),
                Some(Err(e)) => return Err(BrokerError::kafka("poll", e).into()),
            };

            let released = self.dispatch_rebalances(listener)?;
            let exhausted = polled.is_none();
            records.extend(polled);

            if !released.is_empty() {
                // Whatever was fetched for those partitions belongs to the next owner
                records.retain(|record| !released.contains(&record.partition));
                break;
            }
            if exhausted {
                break;
            }
            wait = Duration::ZERO;
        }

        Ok(records)
    }

    fn pause(&mut self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        self.consumer
            .pause(&partition_list(partitions))
            .map_err(|e| BrokerError::kafka("pause", e))
    }

    fn resume(&mut self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        self.consumer
            .resume(&partition_list(partitions))
            .map_err(|e| BrokerError::kafka("resume", e))
    }

    fn committed(&mut self, partitions: &[TopicPartition]) -> Result<PartitionOffsets, BrokerError> {
        let committed = self
            .consumer
            .committed_offsets(partition_list(partitions), self.operation_timeout)
            .map_err(|e| BrokerError::kafka("committed", e))?;

        Ok(committed
            .elements()
            .into_iter()
            .filter_map(|elem| match elem.offset() {
                Offset::Offset(offset) => Some((TopicPartition::from(elem), offset)),
                _ => None,
            })
            .collect())
    }

    fn end_offsets(&mut self, partitions: &[TopicPartition]) -> Result<PartitionOffsets, BrokerError> {
        let mut end_offsets = PartitionOffsets::new();
        for partition in partitions {
            let (_low, high) = self
                .consumer
                .fetch_watermarks(partition.topic(), partition.partition(), self.operation_timeout)
                .map_err(|e| BrokerError::kafka("end_offsets", e))?;
            end_offsets.insert(partition.clone(), high);
        }
        Ok(end_offsets)
    }

    fn partitions_for(&mut self, topic: &str) -> Result<Vec<TopicPartition>, BrokerError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), self.operation_timeout)
            .map_err(|e| BrokerError::kafka("partitions_for", e))?;

        let topic_metadata = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_owned()))?;

        if let Some(err) = topic_metadata.error() {
            return Err(BrokerError::Rejected {
                operation: "partitions_for",
                reason: format!("{topic}: {}", RDKafkaErrorCode::from(err)),
            });
        }
        if topic_metadata.partitions().is_empty() {
            return Err(BrokerError::UnknownTopic(topic.to_owned()));
        }

        Ok(topic_metadata
            .partitions()
            .iter()
            .map(|p| TopicPartition::new(topic, p.id()))
            .collect())
    }

    fn assignment(&self) -> Result<Vec<TopicPartition>, BrokerError> {
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| BrokerError::kafka("assignment", e))?;

        Ok(assignment
            .elements()
            .into_iter()
            .map(TopicPartition::from)
            .collect())
    }

    /// Leaves the group (or drops the manual assignment) and waits, up to
    /// the operation timeout, for the revoke to go through. Records fetched
    /// meanwhile are discarded.
    fn close(&mut self) -> Result<(), BrokerError> {
        info!("Closing kafka consumer");
        self.start_closing();

        if !self.subscribed {
            return self
                .consumer
                .unassign()
                .map_err(|e| BrokerError::kafka("close", e));
        }

        self.consumer.unsubscribe();
        let deadline = Instant::now() + self.operation_timeout;
        while !self.assignment()?.is_empty() {
            if Instant::now() >= deadline {
                warn!("Consumer still holds partitions after the close timeout");
                break;
            }
            if let Some(Err(e)) = self.consumer.poll(CLOSE_POLL_INTERVAL) {
                debug!("Ignoring poll error while closing: {}", e);
            }
        }
        Ok(())
    }
}

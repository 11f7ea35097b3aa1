use std::collections::HashMap;
use std::sync::Arc;

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::health::HealthHandle;
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::Partition;
use crate::metrics_consts::{KAFKA_OFFSET_COMMITS_COUNTER, REBALANCE_EMPTY_SKIPPED};

/// Consumer context of the deduplication consumer.
///
/// Before partitions are revoked, whatever the offset tracker considers safe
/// for them is committed synchronously, then their tracking is dropped.
pub struct DedupConsumerContext {
    tracker: Arc<OffsetTracker>,
    liveness: Option<HealthHandle>,
}

impl DedupConsumerContext {
    pub fn new(tracker: Arc<OffsetTracker>) -> Self {
        Self {
            tracker,
            liveness: None,
        }
    }

    /// Report the rdkafka statistics callback as a liveness signal
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    fn commit_revoked(&self, base_consumer: &BaseConsumer<Self>, revoked: &[Partition]) {
        let offsets = revoked_offsets(&self.tracker, revoked);
        if offsets.is_empty() {
            debug!("No committable offsets for revoked partitions");
            return;
        }

        let result = to_topic_partition_list(&offsets)
            .and_then(|tpl| base_consumer.commit(&tpl, CommitMode::Sync));
        match result {
            Ok(()) => {
                self.tracker.mark_committed(&offsets);
                metrics::counter!(
                    KAFKA_OFFSET_COMMITS_COUNTER,
                    "status" => "success",
                    "trigger" => "revoke"
                )
                .increment(1);
                info!("Committed offsets of {} revoked partitions", offsets.len());
            }
            Err(e) => {
                metrics::counter!(
                    KAFKA_OFFSET_COMMITS_COUNTER,
                    "status" => "error",
                    "trigger" => "revoke"
                )
                .increment(1);
                error!("Failed to commit offsets of revoked partitions: {}", e);
            }
        }
    }
}

impl ClientContext for DedupConsumerContext {
    fn stats(&self, _: rdkafka::Statistics) {
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy_blocking();
        }
    }
}

impl ConsumerContext for DedupConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Pre-rebalance event: {:?}", rebalance);

        if let Rebalance::Revoke(partitions) = rebalance {
            // cooperative-sticky sends empty revokes whenever group membership changes
            if partitions.count() == 0 {
                debug!("Skipping empty revoke rebalance");
                metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "revoke").increment(1);
                return;
            }

            let revoked: Vec<Partition> = partitions
                .elements()
                .into_iter()
                .map(Partition::from)
                .collect();
            info!("Revoking {} partitions", revoked.len());

            self.commit_revoked(base_consumer, &revoked);
            self.tracker.clear_partitions(&revoked);
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) if partitions.count() == 0 => {
                debug!("Skipping empty assign rebalance");
                metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "assign").increment(1);
            }
            Rebalance::Assign(partitions) => {
                info!("Assigned {} partitions", partitions.count());
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => {
                error!("Rebalance failed: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                debug!(
                    "Successfully committed offsets for {} partitions",
                    offsets.count()
                );
            }
            Err(e) => {
                warn!("Failed to commit offsets: {}", e);
            }
        }
    }
}

/// Offsets still owed to Kafka for partitions that are about to be revoked
fn revoked_offsets(tracker: &OffsetTracker, revoked: &[Partition]) -> HashMap<Partition, i64> {
    tracker
        .committable_offsets()
        .into_iter()
        .filter(|(partition, _)| revoked.contains(partition))
        .collect()
}

/// Build the list handed to `commit` from tracker offsets
pub fn to_topic_partition_list(
    offsets: &HashMap<Partition, i64>,
) -> KafkaResult<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for (partition, offset) in offsets {
        tpl.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(*offset),
        )?;
    }
    Ok(tpl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_become_topic_partition_list() {
        let offsets = HashMap::from([
            (Partition::new("docs.article".to_string(), 0), 12),
            (Partition::new("docs.article".to_string(), 3), 40),
        ]);

        let tpl = to_topic_partition_list(&offsets).unwrap();

        assert_eq!(tpl.count(), 2);
        assert_eq!(
            tpl.find_partition("docs.article", 3).map(|e| e.offset()),
            Some(Offset::Offset(40))
        );
    }

    #[test]
    fn test_empty_topic_partition_list_has_zero_count() {
        let tpl = to_topic_partition_list(&HashMap::new()).unwrap();
        assert_eq!(tpl.count(), 0);
    }

    fn partition(number: i32) -> Partition {
        Partition::new("docs.article".to_string(), number)
    }

    #[test]
    fn test_revoke_only_commits_revoked_partitions() {
        let tracker = OffsetTracker::new();
        for number in 0..3 {
            tracker.track(&partition(number), 10);
            tracker.complete(&partition(number), 10, true);
        }
        tracker.track(&partition(2), 11);

        let offsets = revoked_offsets(&tracker, &[partition(0), partition(2)]);

        assert_eq!(
            offsets,
            HashMap::from([(partition(0), 11), (partition(2), 11)])
        );
    }

    #[test]
    fn test_revoke_skips_partitions_already_committed() {
        let tracker = OffsetTracker::new();
        tracker.track(&partition(0), 4);
        tracker.complete(&partition(0), 4, true);
        tracker.mark_committed(&HashMap::from([(partition(0), 5)]));

        assert!(revoked_offsets(&tracker, &[partition(0)]).is_empty());
    }

    #[test]
    fn test_revoked_partitions_are_forgotten() {
        let tracker = OffsetTracker::new();
        tracker.track(&partition(0), 1);
        tracker.track(&partition(1), 1);

        tracker.clear_partitions(&[partition(0)]);
        // A late completion of a revoked record must not bring the partition back
        tracker.complete(&partition(0), 1, true);

        assert_eq!(tracker.committable_offset(&partition(0)), None);
        assert!(revoked_offsets(&tracker, &[partition(0)]).is_empty());
        assert_eq!(tracker.in_flight_count(), 1);
    }
}

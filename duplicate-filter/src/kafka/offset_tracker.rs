//! Offset Tracker - Tracks which pulled offsets are safe to commit per partition
//!
//! Records of one input partition are spread over several shard workers (they
//! are routed by value, not by partition), so they complete out of order. The
//! tracker keeps the set of in-flight offsets per partition and only lets the
//! committed offset advance up to the lowest offset that is still in flight or
//! whose processing failed.

use std::collections::{BTreeSet, HashMap};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::kafka::types::Partition;
use crate::metrics_consts::KAFKA_CONSUMER_IN_FLIGHT_RECORDS;

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    /// Lowest offset whose processing failed. Commits never pass it.
    lowest_failed: Option<i64>,
    /// One past the highest offset ever tracked
    next_offset: Option<i64>,
    /// Last offset handed to a successful commit
    committed: Option<i64>,
}

impl PartitionOffsets {
    fn committable(&self) -> Option<i64> {
        [
            self.in_flight.first().copied(),
            self.lowest_failed,
            self.next_offset,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

/// Thread-safe tracker of in-flight offsets per partition
#[derive(Default)]
pub struct OffsetTracker {
    partitions: DashMap<Partition, PartitionOffsets>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an offset that was pulled from Kafka and handed to the stage
    pub fn track(&self, partition: &Partition, offset: i64) {
        let mut state = self.partitions.entry(partition.clone()).or_default();
        state.in_flight.insert(offset);
        state.next_offset = Some(state.next_offset.map_or(offset + 1, |n| n.max(offset + 1)));
        drop(state);
        self.report_in_flight();
    }

    /// Mark a tracked offset as done. A failed offset is never committed past.
    pub fn complete(&self, partition: &Partition, offset: i64, success: bool) {
        let Some(mut state) = self.partitions.get_mut(partition) else {
            debug!(
                partition = %partition,
                offset,
                "Completion for untracked partition ignored (revoked?)"
            );
            return;
        };

        if !state.in_flight.remove(&offset) {
            warn!(
                partition = %partition,
                offset,
                "Completion for offset that was not in flight"
            );
            return;
        }

        if !success {
            state.lowest_failed = Some(state.lowest_failed.map_or(offset, |f| f.min(offset)));
        }
        drop(state);
        self.report_in_flight();
    }

    /// The next offset to consume that can be committed for one partition
    pub fn committable_offset(&self, partition: &Partition) -> Option<i64> {
        self.partitions.get(partition).and_then(|s| s.committable())
    }

    /// Offsets that moved since the last commit, ready to be committed
    pub fn committable_offsets(&self) -> HashMap<Partition, i64> {
        self.partitions
            .iter()
            .filter_map(|entry| {
                let next = entry.value().committable()?;
                match entry.value().committed {
                    Some(committed) if committed >= next => None,
                    _ => Some((entry.key().clone(), next)),
                }
            })
            .collect()
    }

    /// Record offsets that Kafka accepted
    pub fn mark_committed(&self, offsets: &HashMap<Partition, i64>) {
        for (partition, offset) in offsets {
            if let Some(mut state) = self.partitions.get_mut(partition) {
                state.committed = Some(state.committed.map_or(*offset, |c| c.max(*offset)));
            }
        }
    }

    /// Forget revoked partitions. Completions still arriving for them are ignored.
    pub fn clear_partitions(&self, partitions: &[Partition]) {
        for partition in partitions {
            if let Some((_, state)) = self.partitions.remove(partition) {
                info!(
                    partition = %partition,
                    in_flight = state.in_flight.len(),
                    "Cleared offset tracking for revoked partition"
                );
            }
        }
        self.report_in_flight();
    }

    pub fn in_flight_count(&self) -> usize {
        self.partitions.iter().map(|s| s.in_flight.len()).sum()
    }

    pub fn has_failures(&self, partition: &Partition) -> bool {
        self.partitions
            .get(partition)
            .is_some_and(|s| s.lowest_failed.is_some())
    }

    fn report_in_flight(&self) {
        metrics::gauge!(KAFKA_CONSUMER_IN_FLIGHT_RECORDS).set(self.in_flight_count() as f64);
    }
}

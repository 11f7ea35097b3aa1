use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::Partition;
use crate::metrics_consts::KAFKA_RECORDS_AUTO_NACKED;
use crate::record::Record;

/// Ties a record back to the offset bookkeeping of the partition it was read from
pub struct AckHandle {
    tracker: Arc<OffsetTracker>,
    partition: Partition,
    offset: i64,
}

impl AckHandle {
    /// Register `offset` as in flight and return the handle that completes it
    pub fn track(tracker: Arc<OffsetTracker>, partition: Partition, offset: i64) -> Self {
        tracker.track(&partition, offset);
        Self {
            tracker,
            partition,
            offset,
        }
    }

    fn complete(&self, success: bool) {
        self.tracker.complete(&self.partition, self.offset, success);
    }
}

/// A record that must be acknowledged once the stage is done with it.
///
/// Records that did not come from Kafka are `detached`: acking them is a no-op.
/// Dropping a tracked record without acking it nacks it, which pins the
/// partition's committable offset so the record is redelivered after a restart.
pub struct AckableRecord {
    record: Record,
    handle: Option<AckHandle>,
    acked: bool,
}

impl AckableRecord {
    pub fn new(record: Record, handle: AckHandle) -> Self {
        Self {
            record,
            handle: Some(handle),
            acked: false,
        }
    }

    pub fn detached(record: Record) -> Self {
        Self {
            record,
            handle: None,
            acked: false,
        }
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Acknowledge successful processing of this record
    pub fn ack(mut self) {
        if let Some(handle) = &self.handle {
            handle.complete(true);
            debug!(
                partition = %handle.partition,
                offset = handle.offset,
                "Acked record"
            );
        }
        self.acked = true;
    }

    /// Acknowledge failed processing of this record
    pub fn nack(mut self, reason: &str) {
        if let Some(handle) = &self.handle {
            handle.complete(false);
            warn!(
                partition = %handle.partition,
                offset = handle.offset,
                reason,
                "Nacked record"
            );
        }
        self.acked = true;
    }

    pub fn is_tracked(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for AckableRecord {
    fn drop(&mut self) {
        if self.acked {
            return;
        }
        if let Some(handle) = &self.handle {
            error!(
                partition = %handle.partition,
                offset = handle.offset,
                "Record dropped without ack, nacking it"
            );
            handle.complete(false);
            metrics::counter!(KAFKA_RECORDS_AUTO_NACKED).increment(1);
        }
    }
}

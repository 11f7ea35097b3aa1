//! Deduplication Stage - Sharded first-seen-wins filter
//!
//! Records are routed to one of `shard_count` workers by a stable hash of their
//! value. Every worker owns its own count table, so all records with the same
//! value are observed by a single writer in arrival order and no table is ever
//! locked. Shard channels are bounded: when a worker falls behind (usually
//! because the output is slow) `submit` waits, which in turn stops the consumer
//! from pulling more input.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::deduplicator::{Decision, Deduplicator, FirstSeen};
use crate::kafka::message::AckableRecord;
use crate::metrics_consts::{
    COUNT_TABLE_VALUES_GAUGE, DUPLICATES_DROPPED_COUNTER, EMIT_DURATION_HISTOGRAM,
    EMIT_FAILURES_COUNTER, FIRST_SEEN_EMITTED_COUNTER, RECORDS_PROCESSED_COUNTER,
};
use crate::record::Record;
use crate::sink::{ChannelSink, RecordSink};
use crate::store::RetentionPolicy;

/// How often a worker refreshes its count table gauge, in processed records
const TABLE_GAUGE_INTERVAL: u64 = 1_000;

// Fixed seeds keep routing identical across stage instances in one process
const ROUTING_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

#[derive(Debug, Clone)]
pub struct StageConfig {
    pub shard_count: usize,
    /// Capacity of each shard's input channel
    pub shard_buffer: usize,
    /// Retention of the whole stage; capacity is split across shards
    pub retention: RetentionPolicy,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            shard_count: 4,
            shard_buffer: 1_000,
            retention: RetentionPolicy::Unbounded,
        }
    }
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("shard {0} is no longer accepting records")]
    ShardClosed(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageStats {
    pub processed: u64,
    pub emitted: u64,
    pub duplicates: u64,
    pub emit_failures: u64,
}

#[derive(Debug, Default)]
struct StageCounters {
    processed: AtomicU64,
    emitted: AtomicU64,
    duplicates: AtomicU64,
    emit_failures: AtomicU64,
}

impl StageCounters {
    fn snapshot(&self) -> StageStats {
        StageStats {
            processed: self.processed.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            emit_failures: self.emit_failures.load(Ordering::Relaxed),
        }
    }
}

struct Shard {
    sender: mpsc::Sender<AckableRecord>,
    handle: JoinHandle<()>,
}

pub struct DeduplicationStage {
    shards: Vec<Shard>,
    router: ahash::RandomState,
    counters: Arc<StageCounters>,
}

impl DeduplicationStage {
    /// Spawn the shard workers. Must be called from within a tokio runtime.
    pub fn new(config: StageConfig, sink: Arc<dyn RecordSink>) -> Self {
        let shard_count = config.shard_count.max(1);
        let shard_policy = config.retention.per_shard(shard_count);
        let counters = Arc::new(StageCounters::default());

        info!(
            shard_count,
            shard_buffer = config.shard_buffer,
            retention = ?config.retention,
            "Starting deduplication stage"
        );

        let shards = (0..shard_count)
            .map(|shard| {
                let (sender, receiver) = mpsc::channel(config.shard_buffer.max(1));
                let worker = ShardWorker {
                    shard,
                    deduplicator: Deduplicator::new(shard_policy),
                    sink: sink.clone(),
                    counters: counters.clone(),
                };
                let handle = tokio::spawn(worker.run(receiver));
                Shard { sender, handle }
            })
            .collect();

        let (k0, k1, k2, k3) = ROUTING_SEEDS;
        Self {
            shards,
            router: ahash::RandomState::with_seeds(k0, k1, k2, k3),
            counters,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Index of the shard that owns `value`
    pub fn shard_for(&self, value: &str) -> usize {
        (self.router.hash_one(value) % self.shards.len() as u64) as usize
    }

    /// Hand a record to the shard owning its value, waiting while that shard is full
    pub async fn submit(&self, record: AckableRecord) -> Result<(), StageError> {
        let shard = self.shard_for(record.record().value());
        // A rejected record is dropped here, which nacks it
        self.shards[shard]
            .sender
            .send(record)
            .await
            .map_err(|_| StageError::ShardClosed(shard))
    }

    pub fn stats(&self) -> StageStats {
        self.counters.snapshot()
    }

    /// Stop accepting records, let every worker drain its channel and wait for them
    pub async fn shutdown(self) -> StageStats {
        let mut handles = Vec::with_capacity(self.shards.len());
        for shard in self.shards {
            drop(shard.sender);
            handles.push(shard.handle);
        }

        for (shard, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(shard, error = %e, "Shard worker did not finish cleanly");
            }
        }

        let stats = self.counters.snapshot();
        info!(
            processed = stats.processed,
            emitted = stats.emitted,
            duplicates = stats.duplicates,
            emit_failures = stats.emit_failures,
            "Deduplication stage drained"
        );
        stats
    }
}

struct ShardWorker {
    shard: usize,
    deduplicator: Deduplicator,
    sink: Arc<dyn RecordSink>,
    counters: Arc<StageCounters>,
}

impl ShardWorker {
    async fn run(mut self, mut receiver: mpsc::Receiver<AckableRecord>) {
        debug!(shard = self.shard, "Shard worker started");
        let mut seen = 0u64;

        while let Some(record) = receiver.recv().await {
            self.handle(record).await;

            seen += 1;
            if seen % TABLE_GAUGE_INTERVAL == 0 {
                self.report_table_size();
            }
        }

        self.report_table_size();
        debug!(shard = self.shard, seen, "Shard worker stopped");
    }

    async fn handle(&mut self, record: AckableRecord) {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(RECORDS_PROCESSED_COUNTER).increment(1);

        let count = match self.deduplicator.observe(record.record().value()) {
            Decision::Duplicate { count } => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(DUPLICATES_DROPPED_COUNTER).increment(1);
                debug!(shard = self.shard, count, "Dropped duplicate record");
                record.ack();
                return;
            }
            Decision::FirstSeen { count } => count,
        };

        let first_seen = FirstSeen {
            record: record.record().clone(),
            count,
        };

        let started = Instant::now();
        let result = self.sink.emit(&first_seen).await;
        metrics::histogram!(EMIT_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                self.counters.emitted.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(FIRST_SEEN_EMITTED_COUNTER).increment(1);
                record.ack();
            }
            Err(e) => {
                self.deduplicator.rollback(first_seen.record.value());
                self.counters.emit_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(EMIT_FAILURES_COUNTER).increment(1);
                error!(
                    shard = self.shard,
                    origin = ?first_seen.record.origin(),
                    "Failed to emit first-seen record, count rolled back: {e:#}"
                );
                record.nack(&e.to_string());
            }
        }
    }

    fn report_table_size(&self) {
        metrics::gauge!(COUNT_TABLE_VALUES_GAUGE, "shard" => self.shard.to_string())
            .set(self.deduplicator.distinct_values() as f64);
    }
}

/// Run a stream of records through a fresh stage and return the stream of
/// first-seen records. The output stream ends once the input ended and every
/// shard drained. Dropping the output stream stops pulling input and shuts
/// the stage down.
pub fn process_stream<S>(config: StageConfig, input: S) -> impl Stream<Item = FirstSeen> + Send
where
    S: Stream<Item = Record> + Send + 'static,
{
    let (sender, receiver) = mpsc::channel(config.shard_buffer.max(1));
    let output = sender.clone();
    let stage = DeduplicationStage::new(config, Arc::new(ChannelSink::new(sender)));

    tokio::spawn(async move {
        let mut input = Box::pin(input);
        loop {
            let record = tokio::select! {
                biased;
                _ = output.closed() => {
                    debug!("Output of stream stage dropped, stopping input");
                    break;
                }
                next = input.next() => match next {
                    Some(record) => record,
                    None => break,
                },
            };

            let submitted = tokio::select! {
                biased;
                _ = output.closed() => {
                    debug!("Output of stream stage dropped, stopping input");
                    break;
                }
                submitted = stage.submit(AckableRecord::detached(record)) => submitted,
            };
            if let Err(e) = submitted {
                warn!("Stopping input of stream stage: {e}");
                break;
            }
        }
        drop(input);
        drop(output);
        stage.shutdown().await;
    });

    futures::stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|first_seen| (first_seen, receiver))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingSink;

    #[tokio::test]
    async fn test_same_value_always_routes_to_same_shard() {
        let sink = Arc::new(CollectingSink::new());
        let stage = DeduplicationStage::new(
            StageConfig {
                shard_count: 8,
                ..Default::default()
            },
            sink,
        );

        let shard = stage.shard_for("article-42");
        for _ in 0..10 {
            assert_eq!(stage.shard_for("article-42"), shard);
        }
        assert!(shard < stage.shard_count());

        stage.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_shards_is_treated_as_one() {
        let sink = Arc::new(CollectingSink::new());
        let stage = DeduplicationStage::new(
            StageConfig {
                shard_count: 0,
                shard_buffer: 0,
                retention: RetentionPolicy::Unbounded,
            },
            sink.clone(),
        );
        assert_eq!(stage.shard_count(), 1);

        stage
            .submit(AckableRecord::detached(Record::from_value("a")))
            .await
            .unwrap();
        let stats = stage.shutdown().await;

        assert_eq!(stats.processed, 1);
        assert_eq!(sink.emitted_values(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_stats_split_emitted_and_duplicates() {
        let sink = Arc::new(CollectingSink::new());
        let stage = DeduplicationStage::new(StageConfig::default(), sink);

        for value in ["a", "b", "a", "a"] {
            stage
                .submit(AckableRecord::detached(Record::from_value(value)))
                .await
                .unwrap();
        }
        let stats = stage.shutdown().await;

        assert_eq!(
            stats,
            StageStats {
                processed: 4,
                emitted: 2,
                duplicates: 2,
                emit_failures: 0,
            }
        );
    }
}

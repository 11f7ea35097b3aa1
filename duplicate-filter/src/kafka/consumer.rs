use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::Message;
use tokio::sync::oneshot;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::health::{ComponentStatus, HealthHandle};
use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::context::{to_topic_partition_list, DedupConsumerContext};
use crate::kafka::message::{AckHandle, AckableRecord};
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::Partition;
use crate::metrics_consts::{
    KAFKA_CONSUMER_ERROR_COUNTER, KAFKA_OFFSET_COMMITS_COUNTER, UNDECODABLE_RECORDS_COUNTER,
};
use crate::record::{Record, RecordError};
use crate::stage::{DeduplicationStage, StageStats};

/// Pulls records into the deduplication stage and commits the offsets the
/// stage finished with. Reads the repartition topic while repartitioning is
/// enabled, the input topic otherwise.
pub struct DeduplicationConsumer {
    consumer: StreamConsumer<DedupConsumerContext>,
    tracker: Arc<OffsetTracker>,
    stage: DeduplicationStage,
    liveness: HealthHandle,
    commit_interval: Duration,
    repartitioned: bool,
    shutdown_rx: oneshot::Receiver<()>,
}

impl DeduplicationConsumer {
    /// Create the consumer and subscribe it to its topic.
    ///
    /// `liveness` is reported by the consume loop, `client_liveness` by the
    /// rdkafka statistics callback.
    pub fn new(
        config: &Config,
        stage: DeduplicationStage,
        liveness: HealthHandle,
        client_liveness: HealthHandle,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<Self> {
        let tracker = Arc::new(OffsetTracker::new());
        let context = DedupConsumerContext::new(tracker.clone()).with_liveness(client_liveness);
        let topic = config.dedup_topic();
        let group = config.dedup_group();

        let client_config = ConsumerConfigBuilder::for_consumer(&config.kafka_hosts, &group)
            .with_tls(config.kafka_tls)
            .with_offset_reset(&config.kafka_consumer_offset_reset)
            .with_statistics_interval_ms(10_000)
            .build();

        let consumer: StreamConsumer<DedupConsumerContext> = client_config
            .create_with_context(context)
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[topic.as_str()])
            .with_context(|| format!("Failed to subscribe to {topic}"))?;

        info!(
            topic = %topic,
            group = %group,
            repartitioned = config.repartition_enabled,
            "Subscribed deduplication consumer"
        );

        Ok(Self {
            consumer,
            tracker,
            stage,
            liveness,
            commit_interval: config.commit_interval(),
            repartitioned: config.repartition_enabled,
            shutdown_rx,
        })
    }

    /// Consume until shutdown is signalled or a fatal Kafka error occurs.
    ///
    /// On either exit the stage is drained first and the offsets it finished
    /// with are committed once more.
    pub async fn run(self) -> Result<StageStats> {
        let Self {
            consumer,
            tracker,
            stage,
            liveness,
            commit_interval,
            repartitioned,
            mut shutdown_rx,
        } = self;

        let mut commit_ticker = interval(commit_interval);
        commit_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_errors = 0u64;
        let mut fatal = None;

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received, stopping consumer");
                    break;
                }

                _ = commit_ticker.tick() => {
                    commit_tracked_offsets(&consumer, &tracker, CommitMode::Async, "interval");
                    report_health(&liveness, stage.stats()).await;
                }

                message = consumer.recv() => match message.map(|m| decode(&m, repartitioned)) {
                    Ok(incoming) => {
                        consecutive_errors = 0;
                        if let Err(e) = dispatch(incoming, &tracker, &stage).await {
                            error!("Failed to hand record to deduplication stage: {e:#}");
                            fatal = Some(e);
                            break;
                        }
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        if let Some(e) = handle_kafka_error(e, consecutive_errors).await {
                            fatal = Some(anyhow::Error::new(e).context("Kafka consumer stopped"));
                            break;
                        }
                    }
                }
            }
        }

        let stats = stage.shutdown().await;
        commit_tracked_offsets(&consumer, &tracker, CommitMode::Sync, "shutdown");

        if tracker.in_flight_count() > 0 {
            warn!(
                in_flight = tracker.in_flight_count(),
                "Consumer stopped with records still in flight"
            );
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

/// A pulled message, copied out of the consumer's buffer
struct Incoming {
    partition: Partition,
    offset: i64,
    record: Result<Record, RecordError>,
}

fn decode<M: Message>(message: &M, repartitioned: bool) -> Incoming {
    let record = if repartitioned {
        Record::from_repartitioned_message(message)
    } else {
        Record::from_kafka_message(message)
    };

    Incoming {
        partition: Partition::new(message.topic().to_string(), message.partition()),
        offset: message.offset(),
        record,
    }
}

async fn dispatch(
    incoming: Incoming,
    tracker: &Arc<OffsetTracker>,
    stage: &DeduplicationStage,
) -> Result<()> {
    let Incoming {
        partition,
        offset,
        record,
    } = incoming;

    match record {
        Ok(record) => {
            let handle = AckHandle::track(tracker.clone(), partition, offset);
            stage.submit(AckableRecord::new(record, handle)).await?;
        }
        Err(e) => skip_undecodable(tracker, &partition, offset, &e),
    }
    Ok(())
}

/// Nothing to retry for a record that never decodes, let the offset move past it
fn skip_undecodable(
    tracker: &OffsetTracker,
    partition: &Partition,
    offset: i64,
    error: &RecordError,
) {
    warn!("Skipping undecodable record: {error}");
    metrics::counter!(UNDECODABLE_RECORDS_COUNTER).increment(1);
    tracker.track(partition, offset);
    tracker.complete(partition, offset, true);
}

async fn report_health(liveness: &HealthHandle, stats: StageStats) {
    // A failed emission pins its partition's offset until a restart redelivers it
    if stats.emit_failures > 0 {
        liveness.report_status(ComponentStatus::Unhealthy).await;
    } else {
        liveness.report_healthy().await;
    }
}

fn commit_tracked_offsets(
    consumer: &StreamConsumer<DedupConsumerContext>,
    tracker: &OffsetTracker,
    mode: CommitMode,
    trigger: &'static str,
) {
    let offsets = tracker.committable_offsets();
    if offsets.is_empty() {
        return;
    }

    match to_topic_partition_list(&offsets).and_then(|tpl| consumer.commit(&tpl, mode)) {
        Ok(()) => {
            tracker.mark_committed(&offsets);
            metrics::counter!(
                KAFKA_OFFSET_COMMITS_COUNTER,
                "status" => "success",
                "trigger" => trigger
            )
            .increment(1);
            debug!(partitions = offsets.len(), trigger, "Committed tracked offsets");
        }
        Err(e) => {
            metrics::counter!(
                KAFKA_OFFSET_COMMITS_COUNTER,
                "status" => "error",
                "trigger" => trigger
            )
            .increment(1);
            warn!(trigger, "Failed to commit tracked offsets: {}", e);
        }
    }
}

/// How a consume loop reacts to a Kafka error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    /// Part of normal operation, e.g. reaching the end of a partition
    Benign,
    /// Logged, then polling resumes after a pause
    Transient,
    /// Stops the loop
    Fatal,
}

impl ErrorClass {
    fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Benign => "benign",
            ErrorClass::Transient => "transient",
            ErrorClass::Fatal => "fatal",
        }
    }
}

fn classify(e: &KafkaError) -> (ErrorClass, &'static str) {
    use RDKafkaErrorCode as Code;

    match e {
        KafkaError::MessageConsumption(Code::PartitionEOF) => (ErrorClass::Benign, "partition_eof"),
        KafkaError::MessageConsumption(Code::OperationTimedOut) => {
            (ErrorClass::Benign, "op_timed_out")
        }
        // auto.offset.reset seeks to the head or tail of the partition
        KafkaError::MessageConsumption(Code::OffsetOutOfRange) => {
            (ErrorClass::Transient, "offset_out_of_range")
        }
        KafkaError::MessageConsumption(_) => (ErrorClass::Transient, "consumer"),
        KafkaError::Global(Code::AllBrokersDown | Code::BrokerTransportFailure) => {
            (ErrorClass::Transient, "broker_unreachable")
        }
        KafkaError::Global(Code::Authentication) => (ErrorClass::Fatal, "authentication"),
        KafkaError::Global(_) => (ErrorClass::Transient, "global"),
        KafkaError::MessageConsumptionFatal(_) => (ErrorClass::Fatal, "consumer_fatal"),
        KafkaError::Canceled => (ErrorClass::Fatal, "canceled"),
        _ => (ErrorClass::Transient, "unexpected"),
    }
}

/// Pause after the n-th transient error in a row, growing to at most 3 seconds
fn backoff(consecutive: u64) -> Duration {
    Duration::from_millis(200 * consecutive.clamp(1, 15))
}

/// Count and log a consumer error. Returns the error when the loop must stop,
/// after pausing for transient ones.
pub(crate) async fn handle_kafka_error(e: KafkaError, consecutive: u64) -> Option<KafkaError> {
    let (class, kind) = classify(&e);
    metrics::counter!(KAFKA_CONSUMER_ERROR_COUNTER, "class" => class.as_str(), "error" => kind)
        .increment(1);

    match class {
        ErrorClass::Benign => {
            debug!(kind, "Kafka consumer notice: {e}");
            None
        }
        ErrorClass::Transient => {
            let pause = backoff(consecutive);
            warn!(kind, consecutive, ?pause, "Kafka consumer error, backing off: {e}");
            sleep(pause).await;
            None
        }
        ErrorClass::Fatal => {
            error!(kind, "Fatal Kafka consumer error: {e}");
            Some(e)
        }
    }
}

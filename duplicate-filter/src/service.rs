use std::future::{pending, Future};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::health::HealthRegistry;
use crate::kafka::consumer::DeduplicationConsumer;
use crate::kafka::producer::{create_kafka_producer, KafkaSink};
use crate::kafka::repartitioner::ValueRepartitioner;
use crate::listener::FilteredTopicListener;
use crate::signals::wait_for_shutdown_signal;
use crate::stage::{DeduplicationStage, StageStats};

/// Deadline of the rdkafka statistics callbacks, which fire every 10 seconds
const KAFKA_CLIENT_DEADLINE: Duration = Duration::from_secs(30);

/// A spawned loop together with the sender that asks it to stop
struct Task<T> {
    name: &'static str,
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<Result<T>>,
}

impl<T> Task<T> {
    /// Signal the loop and wait for it, aborting it after `timeout`
    async fn stop(mut self, timeout: Duration) -> Result<T> {
        let _ = self.stop_tx.send(());
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(joined) => task_outcome(self.name, joined),
            Err(_) => {
                self.handle.abort();
                Err(anyhow::anyhow!(
                    "{} shutdown timed out after {timeout:?}",
                    self.name
                ))
            }
        }
    }
}

/// Which part of the service ended the run
enum Stopped {
    Signal,
    Consumer(Result<StageStats>),
    Repartitioner(Result<u64>),
}

/// The duplicate filter service: value repartitioner, deduplication
/// consumer and stage, output producer and the optional filtered-topic
/// listener.
pub struct DuplicateFilterService {
    config: Config,
    liveness: HealthRegistry,
}

impl DuplicateFilterService {
    pub fn new(config: Config, liveness: HealthRegistry) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Invalid configuration for consumer topic '{}' and group '{}'",
                config.kafka_consumer_topic, config.kafka_consumer_group
            )
        })?;

        Ok(Self { config, liveness })
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(wait_for_shutdown_signal()).await
    }

    /// Run until `shutdown_signal` resolves or one of the loops stops on its own.
    ///
    /// Shutdown order: stop repartitioning, stop consuming and drain the
    /// stage, commit, flush the producer, then stop the listener.
    pub async fn run_with_shutdown(self, shutdown_signal: impl Future<Output = ()>) -> Result<()> {
        let config = self.config;

        let producer_liveness = self
            .liveness
            .register("rdkafka_producer", KAFKA_CLIENT_DEADLINE)
            .await;
        let producer = create_kafka_producer(&config, producer_liveness)
            .await
            .with_context(|| {
                format!("Failed to create Kafka producer for {}", config.kafka_hosts)
            })?;

        let mut repartitioner = if config.repartition_enabled {
            let repartitioner = ValueRepartitioner::new(&config, producer.clone())?;
            let (stop_tx, stop_rx) = oneshot::channel();
            Some(Task {
                name: "Value repartitioner",
                stop_tx,
                handle: tokio::spawn(repartitioner.run(stop_rx)),
            })
        } else {
            None
        };

        let sink = Arc::new(KafkaSink::new(producer, &config));
        let consumer_liveness = self
            .liveness
            .register("consumer_loop", consumer_loop_deadline(&config))
            .await;
        let client_liveness = self
            .liveness
            .register("rdkafka_consumer", KAFKA_CLIENT_DEADLINE)
            .await;

        let listener = if config.listener_enabled {
            let listener = FilteredTopicListener::new(&config)?;
            let (stop_tx, stop_rx) = oneshot::channel();
            Some(Task {
                name: "Filtered topic listener",
                stop_tx,
                handle: tokio::spawn(listener.run(stop_rx)),
            })
        } else {
            None
        };

        let stage = DeduplicationStage::new(config.stage_config(), sink.clone());
        let (stop_tx, stop_rx) = oneshot::channel();
        let consumer = DeduplicationConsumer::new(
            &config,
            stage,
            consumer_liveness,
            client_liveness,
            stop_rx,
        )
        .with_context(|| {
            format!(
                "Failed to create Kafka consumer for topic '{}' with group '{}'",
                config.dedup_topic(),
                config.dedup_group()
            )
        })?;

        info!(
            input = %config.kafka_consumer_topic,
            output = %config.output_topic,
            format = ?config.output_format,
            repartitioned = config.repartition_enabled,
            "Starting duplicate filter service"
        );

        let mut consumer = Task {
            name: "Deduplication consumer",
            stop_tx,
            handle: tokio::spawn(consumer.run()),
        };

        let stopped = tokio::select! {
            _ = shutdown_signal => Stopped::Signal,
            joined = &mut consumer.handle => {
                Stopped::Consumer(task_outcome(consumer.name, joined))
            }
            joined = join_optional(repartitioner.as_mut()) => {
                Stopped::Repartitioner(task_outcome("Value repartitioner", joined))
            }
        };

        let timeout = config.shutdown_timeout();
        let (repartitioned, consumed) = match stopped {
            Stopped::Signal => {
                info!("Received shutdown signal, shutting down gracefully...");
                let repartitioned = stop_optional(repartitioner, timeout).await;
                (repartitioned, consumer.stop(timeout).await)
            }
            Stopped::Consumer(consumed) => {
                (stop_optional(repartitioner, timeout).await, consumed)
            }
            Stopped::Repartitioner(repartitioned) => {
                (Some(repartitioned), consumer.stop(timeout).await)
            }
        };

        match &consumed {
            Ok(stats) => info!(
                processed = stats.processed,
                emitted = stats.emitted,
                duplicates = stats.duplicates,
                emit_failures = stats.emit_failures,
                "Consumer stopped normally"
            ),
            Err(e) => error!("Consumer stopped with error: {e:#}"),
        }
        let repartitioned = repartitioned.transpose();
        match &repartitioned {
            Ok(Some(forwarded)) => info!(forwarded, "Repartitioner stopped normally"),
            Ok(None) => {}
            Err(e) => error!("Repartitioner stopped with error: {e:#}"),
        }

        if let Err(e) = sink.flush(config.kafka_message_timeout()) {
            warn!("Failed to flush producer: {e}");
        }

        if let Some(listener) = listener {
            if let Err(e) = listener.stop(timeout).await {
                warn!("Filtered topic listener stopped with error: {e:#}");
            }
        }

        info!("Duplicate filter service stopped");
        consumed.and(repartitioned).map(|_| ())
    }
}

/// The loop reports on every commit tick; allow a few missed ticks
fn consumer_loop_deadline(config: &Config) -> Duration {
    (config.commit_interval() * 3).max(Duration::from_secs(30))
}

fn task_outcome<T>(name: &str, joined: Result<Result<T>, JoinError>) -> Result<T> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(anyhow::Error::new(e).context(format!("{name} task panicked"))),
    }
}

/// Wait for an optional task, never resolving when there is none
async fn join_optional<T>(task: Option<&mut Task<T>>) -> Result<Result<T>, JoinError> {
    match task {
        Some(task) => (&mut task.handle).await,
        None => pending().await,
    }
}

async fn stop_optional<T>(task: Option<Task<T>>, timeout: Duration) -> Option<Result<T>> {
    match task {
        Some(task) => Some(task.stop(timeout).await),
        None => None,
    }
}

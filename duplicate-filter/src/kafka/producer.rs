use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::deduplicator::FirstSeen;
use crate::health::HealthHandle;
use crate::metrics_consts::PRODUCER_SEND_RETRIES_COUNTER;
use crate::sink::{EmitError, OutputFormat, RecordSink};

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy_blocking();
    }
}

pub async fn create_kafka_producer(
    config: &Config,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(liveness.into())?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

/// Writes first-seen records to the output topic.
///
/// A send is awaited until the broker acknowledged it. Failed sends are retried
/// with a linear backoff before the error is handed back to the shard worker.
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    format: OutputFormat,
    send_timeout: Duration,
    retries: u32,
    retry_backoff: Duration,
}

impl KafkaSink {
    pub fn new(producer: FutureProducer<KafkaContext>, config: &Config) -> Self {
        Self {
            producer,
            topic: config.output_topic.clone(),
            format: config.output_format,
            send_timeout: config.kafka_message_timeout(),
            retries: config.producer_send_retries,
            retry_backoff: config.producer_retry_backoff(),
        }
    }

    /// Wait for every queued message to be delivered
    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.producer.flush(Timeout::After(timeout))
    }

    async fn send_once(&self, key: Option<&[u8]>, payload: &[u8]) -> Result<(), KafkaError> {
        let mut record = FutureRecord::<[u8], [u8]>::to(&self.topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok(_) => Ok(()),
            Err((error, _)) => Err(error),
        }
    }
}

/// Errors that no retry can fix
fn is_permanent(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(RDKafkaErrorCode::MessageSizeTooLarge)
            | Some(RDKafkaErrorCode::InvalidMessage)
            | Some(RDKafkaErrorCode::UnknownTopicOrPartition)
            | Some(RDKafkaErrorCode::TopicAuthorizationFailed)
    )
}

#[async_trait]
impl RecordSink for KafkaSink {
    async fn emit(&self, first_seen: &FirstSeen) -> Result<(), EmitError> {
        let message = self.format.encode(first_seen);
        let mut attempt = 0;

        loop {
            let error = match self
                .send_once(message.key.as_deref(), &message.payload)
                .await
            {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            if attempt >= self.retries || is_permanent(&error) {
                return Err(EmitError::Kafka {
                    topic: self.topic.clone(),
                    error,
                });
            }

            attempt += 1;
            metrics::counter!(PRODUCER_SEND_RETRIES_COUNTER).increment(1);
            warn!(
                topic = %self.topic,
                attempt,
                max_retries = self.retries,
                "Failed to produce first-seen record, retrying: {error}"
            );
            tokio::time::sleep(self.retry_backoff * attempt).await;
        }
    }
}

//! Value Repartitioner - Re-keys input records by their value
//!
//! Input partitions follow whatever routing key the upstream producer chose,
//! so equal values can land on different partitions and therefore on
//! different instances of this service. The repartitioner reads the input
//! topic and writes every record to the repartition topic keyed by its value.
//! The default partitioner hashes that key, which puts equal values on one
//! partition with exactly one owner in the deduplication consumer group.
//! The original routing key travels in the [`SOURCE_KEY_HEADER`] header.

use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Message;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::Config;
use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::consumer::handle_kafka_error;
use crate::kafka::producer::KafkaContext;
use crate::metrics_consts::{
    PRODUCER_SEND_RETRIES_COUNTER, RECORDS_REPARTITIONED_COUNTER, UNDECODABLE_RECORDS_COUNTER,
};
use crate::record::{Record, SOURCE_KEY_HEADER};

/// A record as written to the repartition topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepartitionedMessage {
    /// The record's value, which decides its partition
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    pub source_key: Option<Vec<u8>>,
}

impl RepartitionedMessage {
    pub fn from_record(record: &Record) -> Self {
        Self {
            key: record.value().as_bytes().to_vec(),
            payload: record.value().as_bytes().to_vec(),
            source_key: record.key().map(<[u8]>::to_vec),
        }
    }

    fn headers(&self) -> Option<OwnedHeaders> {
        self.source_key.as_deref().map(|source_key| {
            OwnedHeaders::new().insert(Header {
                key: SOURCE_KEY_HEADER,
                value: Some(source_key),
            })
        })
    }
}

pub struct ValueRepartitioner {
    consumer: StreamConsumer,
    producer: FutureProducer<KafkaContext>,
    source_topic: String,
    repartition_topic: String,
    send_timeout: Duration,
    retries: u32,
    retry_backoff: Duration,
}

impl ValueRepartitioner {
    /// Subscribe to the input topic with the input consumer group.
    ///
    /// Offsets are stored once the repartitioned copy was acknowledged and
    /// rdkafka commits the stored offsets in the background.
    pub fn new(config: &Config, producer: FutureProducer<KafkaContext>) -> Result<Self> {
        let auto_commit_interval_ms = (config.commit_interval_secs * 1000).to_string();
        let client_config =
            ConsumerConfigBuilder::for_consumer(&config.kafka_hosts, &config.kafka_consumer_group)
                .with_tls(config.kafka_tls)
                .with_offset_reset(&config.kafka_consumer_offset_reset)
                .set("enable.auto.commit", "true")
                .set("auto.commit.interval.ms", &auto_commit_interval_ms)
                .build();

        let consumer: StreamConsumer = client_config
            .create()
            .context("Failed to create repartitioner consumer")?;
        consumer
            .subscribe(&[config.kafka_consumer_topic.as_str()])
            .with_context(|| {
                format!("Failed to subscribe repartitioner to {}", config.kafka_consumer_topic)
            })?;

        Ok(Self {
            consumer,
            producer,
            source_topic: config.kafka_consumer_topic.clone(),
            repartition_topic: config.repartition_topic_name(),
            send_timeout: config.kafka_message_timeout(),
            retries: config.producer_send_retries,
            retry_backoff: config.producer_retry_backoff(),
        })
    }

    /// Forward records until shutdown is signalled.
    ///
    /// A record that cannot be forwarded after all retries stops the loop
    /// without storing its offset, so it is read again after a restart.
    pub async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<u64> {
        info!(
            source = %self.source_topic,
            destination = %self.repartition_topic,
            "Starting value repartitioner"
        );
        let mut consecutive_errors = 0u64;
        let mut forwarded = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => {
                    info!(forwarded, "Stopping value repartitioner");
                    return Ok(forwarded);
                }

                message = self.consumer.recv() => match message.map(|m| m.detach()) {
                    Ok(message) => {
                        consecutive_errors = 0;
                        if self.forward(&message).await? {
                            forwarded += 1;
                        }
                        let next = message.offset() + 1;
                        self.consumer
                            .store_offset(message.topic(), message.partition(), next)
                            .context("Failed to store repartitioner offset")?;
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        if let Some(e) = handle_kafka_error(e, consecutive_errors).await {
                            return Err(e).context("Value repartitioner stopped");
                        }
                    }
                }
            }
        }
    }

    /// Write one input message to the repartition topic. Returns false for
    /// messages that were skipped because they carry no usable value.
    async fn forward(&self, message: &OwnedMessage) -> Result<bool> {
        let record = match Record::from_kafka_message(message) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping undecodable record: {e}");
                metrics::counter!(UNDECODABLE_RECORDS_COUNTER).increment(1);
                return Ok(false);
            }
        };

        let repartitioned = RepartitionedMessage::from_record(&record);
        let mut attempt = 0;
        loop {
            let error = match self.send_once(&repartitioned).await {
                Ok(()) => {
                    metrics::counter!(RECORDS_REPARTITIONED_COUNTER).increment(1);
                    return Ok(true);
                }
                Err(error) => error,
            };

            if attempt >= self.retries {
                return Err(error).with_context(|| {
                    format!(
                        "Failed to forward {}:{} offset {} to {}",
                        message.topic(),
                        message.partition(),
                        message.offset(),
                        self.repartition_topic
                    )
                });
            }

            attempt += 1;
            metrics::counter!(PRODUCER_SEND_RETRIES_COUNTER).increment(1);
            warn!(
                topic = %self.repartition_topic,
                attempt,
                "Failed to forward record, retrying: {error}"
            );
            tokio::time::sleep(self.retry_backoff * attempt).await;
        }
    }

    async fn send_once(&self, message: &RepartitionedMessage) -> Result<(), KafkaError> {
        let mut record = FutureRecord::<[u8], [u8]>::to(&self.repartition_topic)
            .key(&message.key)
            .payload(&message.payload);
        if let Some(headers) = message.headers() {
            record = record.headers(headers);
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

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::Timestamp;

    fn read_back(message: &RepartitionedMessage) -> Record {
        let owned = OwnedMessage::new(
            Some(message.payload.clone()),
            Some(message.key.clone()),
            "duplicate-filter-processor-by-value-repartition".to_string(),
            Timestamp::now(),
            0,
            7,
            message.headers(),
        );
        Record::from_repartitioned_message(&owned).unwrap()
    }

    #[test]
    fn test_equal_values_share_a_partition_key() {
        let first = RepartitionedMessage::from_record(&Record::new(Some(b"k1".to_vec()), "a"));
        let second = RepartitionedMessage::from_record(&Record::new(Some(b"k2".to_vec()), "a"));
        let other = RepartitionedMessage::from_record(&Record::new(Some(b"k1".to_vec()), "b"));

        assert_eq!(first.key, b"a".to_vec());
        assert_eq!(first.key, second.key);
        assert_ne!(first.key, other.key);
    }

    #[test]
    fn test_source_key_survives_repartitioning() {
        let record = Record::new(Some(b"article-key".to_vec()), "{\"title\":\"hello\"}");

        let read = read_back(&RepartitionedMessage::from_record(&record));

        assert_eq!(read.value(), record.value());
        assert_eq!(read.key(), record.key());
    }

    #[test]
    fn test_record_without_key_has_no_header() {
        let repartitioned = RepartitionedMessage::from_record(&Record::from_value("a"));

        assert!(repartitioned.headers().is_none());
        assert_eq!(read_back(&repartitioned).key(), None);
    }
}

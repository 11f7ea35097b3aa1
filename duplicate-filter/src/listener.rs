//! Observer of the filtered output topic.
//!
//! Logs every first-seen record that reaches the output, with its count when
//! the output carries counts. It runs in its own consumer group and never
//! feeds anything back into the stage.

use anyhow::{Context, Result};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::Config;
use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::consumer::handle_kafka_error;
use crate::metrics_consts::LISTENER_RECORDS_OBSERVED;
use crate::sink::{decode_count, OutputFormat};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedRecord {
    pub value: String,
    /// Decoded count, only present for the `count` output format
    pub count: Option<i64>,
}

/// Interpret an output message according to the format it was written with
pub fn observe_output(
    format: OutputFormat,
    key: Option<&[u8]>,
    payload: Option<&[u8]>,
) -> Option<ObservedRecord> {
    match format {
        OutputFormat::Count => Some(ObservedRecord {
            value: String::from_utf8_lossy(key?).into_owned(),
            count: payload.and_then(decode_count),
        }),
        OutputFormat::Payload => Some(ObservedRecord {
            value: String::from_utf8_lossy(payload?).into_owned(),
            count: None,
        }),
    }
}

pub struct FilteredTopicListener {
    consumer: StreamConsumer,
    topic: String,
    format: OutputFormat,
}

impl FilteredTopicListener {
    pub fn new(config: &Config) -> Result<Self> {
        let client_config = ConsumerConfigBuilder::for_observer(
            &config.kafka_hosts,
            &config.listener_consumer_group,
        )
        .with_tls(config.kafka_tls)
        .with_offset_reset(&config.kafka_consumer_offset_reset)
        .build();

        let consumer: StreamConsumer = client_config
            .create()
            .context("Failed to create listener consumer")?;
        consumer
            .subscribe(&[config.output_topic.as_str()])
            .with_context(|| format!("Failed to subscribe listener to {}", config.output_topic))?;

        Ok(Self {
            consumer,
            topic: config.output_topic.clone(),
            format: config.output_format,
        })
    }

    pub async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<()> {
        info!(topic = %self.topic, format = ?self.format, "Listening to filtered topic");
        let mut consecutive_errors = 0u64;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Stopping filtered topic listener");
                    return Ok(());
                }

                message = self.consumer.recv() => match message {
                    Ok(message) => {
                        consecutive_errors = 0;
                        metrics::counter!(LISTENER_RECORDS_OBSERVED).increment(1);
                        match observe_output(self.format, message.key(), message.payload()) {
                            Some(ObservedRecord { value, count: Some(count) }) => {
                                info!(value = %value, count, "Filtered record received");
                            }
                            Some(ObservedRecord { value, count: None }) => {
                                info!(value = %value, "Filtered record received");
                            }
                            None => {
                                warn!(
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    "Filtered record without content"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        if let Some(e) = handle_kafka_error(e, consecutive_errors).await {
                            return Err(e).context("Filtered topic listener stopped");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::encode_count;

    fn bytes(s: &str) -> Option<&[u8]> {
        Some(s.as_bytes())
    }

    #[test]
    fn test_count_output_is_decoded() {
        let payload = encode_count(1);
        let observed = observe_output(OutputFormat::Count, bytes("article-1"), Some(&payload[..]));

        assert_eq!(
            observed,
            Some(ObservedRecord {
                value: "article-1".to_string(),
                count: Some(1),
            })
        );
    }

    #[test]
    fn test_count_output_with_malformed_count() {
        let observed = observe_output(OutputFormat::Count, bytes("article-1"), bytes("oops"));
        assert_eq!(observed.and_then(|o| o.count), None);
    }

    #[test]
    fn test_payload_output_uses_payload_as_value() {
        let observed = observe_output(OutputFormat::Payload, bytes("k"), bytes("article-1"));
        assert_eq!(observed.map(|o| o.value), Some("article-1".to_string()));

        assert_eq!(observe_output(OutputFormat::Payload, bytes("k"), None), None);
        assert_eq!(observe_output(OutputFormat::Count, None, bytes("x")), None);
    }
}

use std::time::Duration;

use anyhow::{ensure, Result};
use envconfig::Envconfig;

use crate::sink::OutputFormat;
use crate::stage::StageConfig;
use crate::store::{RetentionMode, RetentionPolicy};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "duplicate-filter-processor")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "docs.article")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    // Re-keying of input records by value, see `kafka::repartitioner`
    #[envconfig(default = "true")]
    pub repartition_enabled: bool,

    /// Defaults to `<KAFKA_CONSUMER_GROUP>-by-value-repartition`
    pub repartition_topic: Option<String>,

    // Output of first-seen records
    #[envconfig(default = "filtered.docs.article")]
    pub output_topic: String,

    #[envconfig(default = "count")]
    pub output_format: OutputFormat,

    // Kafka producer configuration
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32,

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "3")]
    pub producer_send_retries: u32,

    #[envconfig(default = "100")]
    pub producer_retry_backoff_ms: u64,

    // Deduplication stage
    #[envconfig(default = "4")]
    pub shard_count: usize,

    #[envconfig(default = "1000")]
    pub shard_buffer_size: usize,

    #[envconfig(default = "unbounded")]
    pub count_retention: RetentionMode,

    #[envconfig(default = "1000000")]
    pub count_max_values: usize,

    #[envconfig(default = "86400")] // 1 day
    pub count_window_secs: u64,

    // Consumer processing
    #[envconfig(default = "5")]
    pub commit_interval_secs: u64,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    // Observer of the output topic
    #[envconfig(default = "false")]
    pub listener_enabled: bool,

    #[envconfig(default = "filter-duplicates-group")]
    pub listener_consumer_group: String,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.kafka_hosts.trim().is_empty(), "KAFKA_HOSTS must not be empty");
        ensure!(
            !self.kafka_consumer_topic.trim().is_empty(),
            "KAFKA_CONSUMER_TOPIC must not be empty"
        );
        ensure!(!self.output_topic.trim().is_empty(), "OUTPUT_TOPIC must not be empty");
        ensure!(
            self.kafka_consumer_topic != self.output_topic,
            "OUTPUT_TOPIC must differ from KAFKA_CONSUMER_TOPIC ({})",
            self.output_topic
        );
        ensure!(
            matches!(self.kafka_consumer_offset_reset.as_str(), "earliest" | "latest"),
            "KAFKA_CONSUMER_OFFSET_RESET must be earliest or latest, got {}",
            self.kafka_consumer_offset_reset
        );
        if self.repartition_enabled {
            let repartition_topic = self.repartition_topic_name();
            ensure!(
                !repartition_topic.trim().is_empty(),
                "REPARTITION_TOPIC must not be empty"
            );
            ensure!(
                repartition_topic != self.kafka_consumer_topic
                    && repartition_topic != self.output_topic,
                "REPARTITION_TOPIC must differ from the input and output topics ({})",
                repartition_topic
            );
        }
        ensure!(self.shard_count >= 1, "SHARD_COUNT must be at least 1");
        ensure!(self.shard_buffer_size >= 1, "SHARD_BUFFER_SIZE must be at least 1");
        ensure!(self.commit_interval_secs >= 1, "COMMIT_INTERVAL_SECS must be at least 1");
        match self.count_retention {
            RetentionMode::Capacity => {
                ensure!(self.count_max_values >= 1, "COUNT_MAX_VALUES must be at least 1")
            }
            RetentionMode::Window => {
                ensure!(self.count_window_secs >= 1, "COUNT_WINDOW_SECS must be at least 1")
            }
            RetentionMode::Unbounded => {}
        }
        Ok(())
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Topic the repartitioner writes to when repartitioning is enabled
    pub fn repartition_topic_name(&self) -> String {
        match &self.repartition_topic {
            Some(topic) => topic.clone(),
            None => format!("{}-by-value-repartition", self.kafka_consumer_group),
        }
    }

    /// Topic read by the deduplication consumer
    pub fn dedup_topic(&self) -> String {
        if self.repartition_enabled {
            self.repartition_topic_name()
        } else {
            self.kafka_consumer_topic.clone()
        }
    }

    /// Consumer group of the deduplication consumer. The input group belongs
    /// to the repartitioner while repartitioning is enabled.
    pub fn dedup_group(&self) -> String {
        if self.repartition_enabled {
            format!("{}-by-value", self.kafka_consumer_group)
        } else {
            self.kafka_consumer_group.clone()
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        match self.count_retention {
            RetentionMode::Unbounded => RetentionPolicy::Unbounded,
            RetentionMode::Capacity => RetentionPolicy::Capacity {
                max_values: self.count_max_values,
            },
            RetentionMode::Window => RetentionPolicy::Window {
                idle: Duration::from_secs(self.count_window_secs),
            },
        }
    }

    pub fn stage_config(&self) -> StageConfig {
        StageConfig {
            shard_count: self.shard_count,
            shard_buffer: self.shard_buffer_size,
            retention: self.retention_policy(),
        }
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.commit_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn producer_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.producer_retry_backoff_ms)
    }

    pub fn kafka_message_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_message_timeout_ms as u64)
    }
}

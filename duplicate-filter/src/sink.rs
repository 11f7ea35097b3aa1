use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::deduplicator::FirstSeen;

#[derive(Error, Debug)]
pub enum EmitError {
    #[error("failed to produce to kafka topic '{topic}': {error}")]
    Kafka {
        topic: String,
        #[source]
        error: KafkaError,
    },
    #[error("output channel closed")]
    Closed,
    #[error("output unavailable: {0}")]
    Unavailable(String),
}

/// Destination of first-seen records.
///
/// `emit` returns only once the record has been accepted by the output, so a
/// shard worker never moves on while a first-seen record is still undelivered.
#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    async fn emit(&self, first_seen: &FirstSeen) -> Result<(), EmitError>;
}

/// How first-seen records are laid out on the output topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Key is the deduplicated value, payload is its count as a big-endian i64
    Count,
    /// Key and payload are the original record's
    Payload,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "count" => Ok(OutputFormat::Count),
            "payload" => Ok(OutputFormat::Payload),
            _ => Err(format!("Unknown output format: {s}, must be count or payload")),
        }
    }
}

/// An encoded output message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMessage {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl OutputFormat {
    pub fn encode(&self, first_seen: &FirstSeen) -> OutputMessage {
        match self {
            OutputFormat::Count => OutputMessage {
                key: Some(first_seen.record.value().as_bytes().to_vec()),
                payload: encode_count(first_seen.count).to_vec(),
            },
            OutputFormat::Payload => OutputMessage {
                key: first_seen.record.key().map(|k| k.to_vec()),
                payload: first_seen.record.value().as_bytes().to_vec(),
            },
        }
    }
}

/// Counts go out in the layout of Kafka's `LongSerializer`: 8 bytes, big-endian, signed.
pub fn encode_count(count: u64) -> [u8; 8] {
    i64::try_from(count).unwrap_or(i64::MAX).to_be_bytes()
}

pub fn decode_count(bytes: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    Some(i64::from_be_bytes(bytes))
}

/// Forwards first-seen records into a bounded channel, which gives the output
/// side backpressure over the shard workers.
pub struct ChannelSink {
    sender: mpsc::Sender<FirstSeen>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<FirstSeen>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn emit(&self, first_seen: &FirstSeen) -> Result<(), EmitError> {
        self.sender
            .send(first_seen.clone())
            .await
            .map_err(|_| EmitError::Closed)
    }
}

/// Keeps every first-seen record in memory
#[derive(Default)]
pub struct CollectingSink {
    emitted: Mutex<Vec<FirstSeen>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> Vec<FirstSeen> {
        match self.emitted.lock() {
            Ok(emitted) => emitted.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn emitted_values(&self) -> Vec<String> {
        self.emitted()
            .into_iter()
            .map(|f| f.record.value().to_string())
            .collect()
    }
}

#[async_trait]
impl RecordSink for CollectingSink {
    async fn emit(&self, first_seen: &FirstSeen) -> Result<(), EmitError> {
        let mut emitted = self
            .emitted
            .lock()
            .map_err(|_| EmitError::Unavailable("collector lock poisoned".to_string()))?;
        emitted.push(first_seen.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    fn first_seen(key: Option<&str>, value: &str) -> FirstSeen {
        FirstSeen {
            record: Record::new(key.map(|k| k.as_bytes().to_vec()), value),
            count: 1,
        }
    }

    #[test]
    fn test_count_format_matches_long_serializer() {
        let message = OutputFormat::Count.encode(&first_seen(Some("k"), "article-1"));

        assert_eq!(message.key, Some(b"article-1".to_vec()));
        assert_eq!(message.payload, vec![0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(decode_count(&message.payload), Some(1));
    }

    #[test]
    fn test_payload_format_keeps_original_record() {
        let message = OutputFormat::Payload.encode(&first_seen(Some("k"), "article-1"));
        assert_eq!(message.key, Some(b"k".to_vec()));
        assert_eq!(message.payload, b"article-1".to_vec());

        let unkeyed = OutputFormat::Payload.encode(&first_seen(None, "article-2"));
        assert_eq!(unkeyed.key, None);
    }

    #[test]
    fn test_decode_count_rejects_wrong_width() {
        assert_eq!(decode_count(b"1"), None);
        assert_eq!(decode_count(&[0; 9]), None);
        assert_eq!(decode_count(&encode_count(u64::MAX)), Some(i64::MAX));
    }

    #[test]
    fn test_output_format_parses() {
        assert_eq!("count".parse::<OutputFormat>(), Ok(OutputFormat::Count));
        assert_eq!("Payload".parse::<OutputFormat>(), Ok(OutputFormat::Payload));
        assert!("json".parse::<OutputFormat>().is_err());
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        let sink = ChannelSink::new(tx);
        drop(rx);

        let result = sink.emit(&first_seen(None, "a")).await;
        assert!(matches!(result, Err(EmitError::Closed)));
    }

    #[tokio::test]
    async fn test_collecting_sink_keeps_order() {
        let sink = CollectingSink::new();
        sink.emit(&first_seen(None, "a")).await.unwrap();
        sink.emit(&first_seen(None, "b")).await.unwrap();
        assert_eq!(sink.emitted_values(), vec!["a", "b"]);
    }
}

use std::fmt;

use rdkafka::message::Headers;
use rdkafka::Message;
use thiserror::Error;

use crate::kafka::types::Partition;

/// Header of a repartitioned record carrying its original routing key
pub const SOURCE_KEY_HEADER: &str = "duplicate-filter-source-key";

/// Where a record was read from. Only used for logging and offset bookkeeping,
/// never for deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOrigin {
    pub partition: Partition,
    pub offset: i64,
}

impl fmt::Display for RecordOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} offset {}",
            self.partition.topic(),
            self.partition.partition_number(),
            self.offset
        )
    }
}

/// One message flowing through the pipeline.
///
/// The key is the transport routing key and is carried through untouched.
/// The value is the payload whose exact bytes decide duplicate identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    key: Option<Vec<u8>>,
    value: String,
    origin: Option<RecordOrigin>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("record at {0} has no payload")]
    MissingPayload(RecordOrigin),
    #[error("record at {origin} has a payload that is not valid UTF-8: {reason}")]
    InvalidPayload { origin: RecordOrigin, reason: String },
}

impl Record {
    pub fn new(key: Option<Vec<u8>>, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
            origin: None,
        }
    }

    /// Convenience constructor for records without a routing key
    pub fn from_value(value: impl Into<String>) -> Self {
        Self::new(None, value)
    }

    pub fn with_origin(mut self, origin: RecordOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Decode a Kafka message into a record. The payload must be present and
    /// valid UTF-8, the key is kept as raw bytes.
    pub fn from_kafka_message<M: Message>(message: &M) -> Result<Self, RecordError> {
        Self::decode(message, message.key().map(|k| k.to_vec()))
    }

    /// Decode a record read back from the repartition topic. Its Kafka key is
    /// the value itself, the original key comes from [`SOURCE_KEY_HEADER`].
    pub fn from_repartitioned_message<M: Message>(message: &M) -> Result<Self, RecordError> {
        let source_key = message.headers().and_then(|headers| {
            headers
                .iter()
                .find(|header| header.key == SOURCE_KEY_HEADER)
                .and_then(|header| header.value.map(<[u8]>::to_vec))
        });
        Self::decode(message, source_key)
    }

    fn decode<M: Message>(message: &M, key: Option<Vec<u8>>) -> Result<Self, RecordError> {
        let origin = RecordOrigin {
            partition: Partition::new(message.topic().to_string(), message.partition()),
            offset: message.offset(),
        };

        let Some(payload) = message.payload() else {
            return Err(RecordError::MissingPayload(origin));
        };

        let value = match std::str::from_utf8(payload) {
            Ok(value) => value.to_string(),
            Err(e) => {
                return Err(RecordError::InvalidPayload {
                    origin,
                    reason: e.to_string(),
                })
            }
        };

        Ok(Self {
            key,
            value,
            origin: Some(origin),
        })
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn origin(&self) -> Option<&RecordOrigin> {
        self.origin.as_ref()
    }
}

impl RecordError {
    pub fn origin(&self) -> &RecordOrigin {
        match self {
            RecordError::MissingPayload(origin) => origin,
            RecordError::InvalidPayload { origin, .. } => origin,
        }
    }
}

// ==== Deduplication stage metrics ====
/// Counter for input records handed to a shard worker
pub const RECORDS_PROCESSED_COUNTER: &str = "duplicate_filter_records_processed_total";

/// Counter for first-seen records delivered to the output
pub const FIRST_SEEN_EMITTED_COUNTER: &str = "duplicate_filter_first_seen_emitted_total";

/// Counter for records dropped because their value was already seen
pub const DUPLICATES_DROPPED_COUNTER: &str = "duplicate_filter_duplicates_dropped_total";

/// Counter for first-seen records whose emission failed after retries
pub const EMIT_FAILURES_COUNTER: &str = "duplicate_filter_emit_failures_total";

/// Histogram for the time spent delivering one first-seen record
pub const EMIT_DURATION_HISTOGRAM: &str = "duplicate_filter_emit_duration_seconds";

/// Gauge for the number of values retained by a shard's count table
pub const COUNT_TABLE_VALUES_GAUGE: &str = "duplicate_filter_count_table_values";

/// Counter for records skipped because they could not be decoded
pub const UNDECODABLE_RECORDS_COUNTER: &str = "duplicate_filter_undecodable_records_total";

/// Counter for input records forwarded to the repartition topic
pub const RECORDS_REPARTITIONED_COUNTER: &str = "duplicate_filter_records_repartitioned_total";

/// Counter for producer send attempts that were retried
pub const PRODUCER_SEND_RETRIES_COUNTER: &str = "duplicate_filter_producer_send_retries_total";

// ==== Kafka consumer metrics ====
/// Counter for consumer errors, labelled by level and error kind
pub const KAFKA_CONSUMER_ERROR_COUNTER: &str = "kafka_consumer_error_total";

/// Gauge for records pulled from Kafka but not yet acked or nacked
pub const KAFKA_CONSUMER_IN_FLIGHT_RECORDS: &str = "kafka_consumer_in_flight_records";

/// Counter for records dropped without an explicit ack
pub const KAFKA_RECORDS_AUTO_NACKED: &str = "kafka_records_auto_nacked_total";

/// Counter for offset commits, labelled by status
pub const KAFKA_OFFSET_COMMITS_COUNTER: &str = "kafka_offset_commits_total";

/// Counter for rebalance callbacks with an empty partition list
pub const REBALANCE_EMPTY_SKIPPED: &str = "kafka_rebalance_empty_skipped_total";

// ==== Listener metrics ====
/// Counter for records observed on the filtered output topic
pub const LISTENER_RECORDS_OBSERVED: &str = "duplicate_filter_listener_records_observed_total";

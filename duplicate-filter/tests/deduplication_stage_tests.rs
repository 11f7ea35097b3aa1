use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use duplicate_filter::deduplicator::FirstSeen;
use duplicate_filter::kafka::{AckHandle, AckableRecord, OffsetTracker, Partition};
use duplicate_filter::record::Record;
use duplicate_filter::sink::{CollectingSink, EmitError, RecordSink};
use duplicate_filter::stage::{process_stream, DeduplicationStage, StageConfig, StageStats};
use duplicate_filter::store::RetentionPolicy;
use futures::StreamExt;
use rstest::rstest;

fn stage_config(shard_count: usize) -> StageConfig {
    StageConfig {
        shard_count,
        shard_buffer: 16,
        retention: RetentionPolicy::Unbounded,
    }
}

async fn run_stage(shard_count: usize, values: &[&str]) -> (Vec<FirstSeen>, StageStats) {
    let sink = Arc::new(CollectingSink::new());
    let stage = DeduplicationStage::new(stage_config(shard_count), sink.clone());

    for value in values {
        stage
            .submit(AckableRecord::detached(Record::from_value(*value)))
            .await
            .unwrap();
    }
    let stats = stage.shutdown().await;

    (sink.emitted(), stats)
}

fn sorted_values(emitted: &[FirstSeen]) -> Vec<String> {
    let mut values: Vec<String> = emitted.iter().map(|f| f.record.value().to_string()).collect();
    values.sort();
    values
}

#[rstest]
#[case::mixed(&["a", "b", "a", "c", "b", "a"], &["a", "b", "c"])]
#[case::repeated(&["x", "x", "x"], &["x"])]
#[case::empty(&[], &[])]
#[case::single(&["z"], &["z"])]
#[tokio::test]
async fn test_each_value_is_emitted_once(
    #[case] input: &[&str],
    #[case] expected: &[&str],
    #[values(1, 4)] shard_count: usize,
) {
    let (emitted, stats) = run_stage(shard_count, input).await;

    assert_eq!(sorted_values(&emitted), expected);
    assert!(emitted.iter().all(|f| f.count == 1));
    assert_eq!(stats.processed, input.len() as u64);
    assert_eq!(stats.emitted, expected.len() as u64);
    assert_eq!(stats.duplicates, (input.len() - expected.len()) as u64);
    assert_eq!(stats.emit_failures, 0);
}

#[tokio::test]
async fn test_single_shard_emits_in_first_occurrence_order() {
    let (emitted, _) = run_stage(1, &["a", "b", "a", "c", "b", "a"]).await;

    let values: Vec<&str> = emitted.iter().map(|f| f.record.value()).collect();
    assert_eq!(values, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_emitted_record_keeps_its_key() {
    let sink = Arc::new(CollectingSink::new());
    let stage = DeduplicationStage::new(stage_config(2), sink.clone());

    for key in ["first", "second"] {
        let record = Record::new(Some(key.as_bytes().to_vec()), "same-article");
        stage.submit(AckableRecord::detached(record)).await.unwrap();
    }
    stage.shutdown().await;

    let emitted = sink.emitted();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].record.key(), Some("first".as_bytes()));
}

#[tokio::test]
async fn test_interleaving_of_values_does_not_change_output() {
    let forward = ["a", "b", "c", "a", "b", "c", "d"];
    let mut backward = forward;
    backward.reverse();

    let (first, _) = run_stage(4, &forward).await;
    let (second, _) = run_stage(4, &backward).await;

    assert_eq!(sorted_values(&first), sorted_values(&second));
}

#[tokio::test]
async fn test_many_values_across_shards() {
    let values: Vec<String> = (0..1_000).map(|i| format!("article-{}", i % 250)).collect();
    let refs: Vec<&str> = values.iter().map(String::as_str).collect();

    let (emitted, stats) = run_stage(8, &refs).await;

    let distinct: HashSet<String> = emitted.iter().map(|f| f.record.value().to_string()).collect();
    assert_eq!(emitted.len(), 250);
    assert_eq!(distinct.len(), 250);
    assert_eq!(stats.duplicates, 750);
}

/// Fails the first emission of every value, accepts later ones
#[derive(Default)]
struct FailOnceSink {
    attempts: Mutex<HashMap<String, usize>>,
    delivered: Mutex<Vec<FirstSeen>>,
    failures: AtomicUsize,
}

#[async_trait]
impl RecordSink for FailOnceSink {
    async fn emit(&self, first_seen: &FirstSeen) -> Result<(), EmitError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let attempt = attempts
                .entry(first_seen.record.value().to_string())
                .or_insert(0);
            *attempt += 1;
            *attempt
        };

        if attempt == 1 {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(EmitError::Unavailable("broker down".to_string()));
        }
        self.delivered.lock().unwrap().push(first_seen.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_failed_emit_rolls_back_so_redelivery_is_emitted() {
    let sink = Arc::new(FailOnceSink::default());
    let stage = DeduplicationStage::new(stage_config(2), sink.clone());

    for _ in 0..2 {
        stage
            .submit(AckableRecord::detached(Record::from_value("a")))
            .await
            .unwrap();
    }
    let stats = stage.shutdown().await;

    let delivered = sink.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].record.value(), "a");
    assert_eq!(delivered[0].count, 1);
    assert_eq!(sink.failures.load(Ordering::SeqCst), 1);
    assert_eq!(stats.emit_failures, 1);
    assert_eq!(stats.emitted, 1);
    assert_eq!(stats.duplicates, 0);
}

#[tokio::test]
async fn test_failed_emit_pins_the_committable_offset() {
    let tracker = Arc::new(OffsetTracker::new());
    let partition = Partition::new("docs.article".to_string(), 0);
    let sink = Arc::new(FailOnceSink::default());
    let stage = DeduplicationStage::new(stage_config(1), sink);

    for (offset, value) in [(0, "a"), (1, "b"), (2, "a")] {
        let handle = AckHandle::track(tracker.clone(), partition.clone(), offset);
        stage
            .submit(AckableRecord::new(Record::from_value(value), handle))
            .await
            .unwrap();
    }
    stage.shutdown().await;

    // "a" failed at offset 0, so nothing past it may be committed
    assert_eq!(tracker.in_flight_count(), 0);
    assert_eq!(tracker.committable_offset(&partition), Some(0));
    assert!(tracker.has_failures(&partition));
}

#[tokio::test]
async fn test_successful_records_release_their_offsets() {
    let tracker = Arc::new(OffsetTracker::new());
    let partition = Partition::new("docs.article".to_string(), 3);
    let stage = DeduplicationStage::new(stage_config(4), Arc::new(CollectingSink::new()));

    for (offset, value) in ["a", "b", "a", "c"].into_iter().enumerate() {
        let handle = AckHandle::track(tracker.clone(), partition.clone(), offset as i64 + 100);
        stage
            .submit(AckableRecord::new(Record::from_value(value), handle))
            .await
            .unwrap();
    }
    stage.shutdown().await;

    assert_eq!(tracker.committable_offset(&partition), Some(104));
    assert!(!tracker.has_failures(&partition));
}

#[tokio::test]
async fn test_windowed_retention_forgets_idle_values() {
    let sink = Arc::new(CollectingSink::new());
    let stage = DeduplicationStage::new(
        StageConfig {
            shard_count: 1,
            shard_buffer: 16,
            retention: RetentionPolicy::Window {
                idle: Duration::from_millis(50),
            },
        },
        sink.clone(),
    );

    stage
        .submit(AckableRecord::detached(Record::from_value("a")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    stage
        .submit(AckableRecord::detached(Record::from_value("a")))
        .await
        .unwrap();
    stage.shutdown().await;

    assert_eq!(sink.emitted_values(), vec!["a", "a"]);
}

#[rstest]
#[case::mixed(vec!["a", "b", "a", "c", "b", "a"], vec!["a", "b", "c"])]
#[case::empty(vec![], vec![])]
#[tokio::test]
async fn test_process_stream(#[case] input: Vec<&'static str>, #[case] expected: Vec<&str>) {
    let records = futures::stream::iter(input.into_iter().map(Record::from_value));

    let output: Vec<FirstSeen> = process_stream(stage_config(1), records).collect().await;

    let values: Vec<&str> = output.iter().map(|f| f.record.value()).collect();
    assert_eq!(values, expected);
    assert!(output.iter().all(|f| f.count == 1));
}

#[tokio::test]
async fn test_dropping_the_output_stops_pulling_input() {
    let pulled = Arc::new(AtomicUsize::new(0));
    let counter = pulled.clone();
    let records = futures::stream::iter(0u64..).map(move |i| {
        counter.fetch_add(1, Ordering::SeqCst);
        Record::from_value(format!("article-{i}"))
    });

    let mut output = Box::pin(process_stream(stage_config(2), records));
    assert!(output.next().await.is_some());
    drop(output);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let after_drop = pulled.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(pulled.load(Ordering::SeqCst), after_drop);
}

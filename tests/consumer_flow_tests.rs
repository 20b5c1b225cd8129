//! End-to-end consumer flows against the in-memory mock broker client.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;

use kafka_partition_streams::testing::{partition, MockBrokerClient, MockState};
use kafka_partition_streams::{
    ConsumerError, ConsumerSettings, Diagnostics, DiagnosticEvent, JsonDeserializer,
    ManualOffsetResolver, OffsetBatch, OffsetRetrieval, Partition, RetryPolicy, RunloopPhase,
    StreamingConsumer, StringDeserializer, Subscription,
};

fn test_settings() -> ConsumerSettings {
    ConsumerSettings::new("localhost:9092", "test-group")
        .with_poll_interval(Duration::from_millis(5))
        .with_poll_timeout(Duration::from_millis(1))
        .with_close_timeout(Duration::from_secs(2))
}

fn connect(settings: ConsumerSettings) -> (StreamingConsumer<MockBrokerClient>, Arc<MockState>) {
    let client = MockBrokerClient::new();
    let state = client.state();
    (StreamingConsumer::with_client(client, settings), state)
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out waiting for the consumer")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within deadline");
}

#[tokio::test]
async fn test_single_partition_consume_commit_and_restart() {
    let (consumer, state) = connect(test_settings());
    for i in 0..100 {
        state.produce("events", 0, Some(&format!("k{i}")), &format!("v{i}"));
    }
    state.schedule_assign(vec![partition("events", 0)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let mut partitions = consumer
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    let (tp, mut stream) = within(partitions.next()).await.unwrap();
    assert_eq!(tp, partition("events", 0));

    let mut seen = Vec::new();
    while seen.len() < 100 {
        let chunk = within(stream.next()).await.unwrap().unwrap();
        for record in chunk {
            record.offset.commit().await.unwrap();
            seen.push((record.key.clone().unwrap(), record.value.clone()));
        }
    }
    assert_eq!(seen.len(), 100);
    assert_eq!(seen[0], ("k0".to_string(), "v0".to_string()));
    assert_eq!(seen[99], ("k99".to_string(), "v99".to_string()));

    consumer.stop_consumption().await;
    assert!(consumer.wait_until_stopped().await.is_none());
    assert_eq!(state.committed_offsets()[&partition("events", 0)], 100);

    // Restart against the same broker log and group offsets: nothing left.
    let client = MockBrokerClient::with_state(state.clone());
    let restarted = StreamingConsumer::with_client(client, test_settings());
    state.schedule_assign(vec![partition("events", 0)]);
    restarted
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();
    let mut partitions = restarted
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    let (_, mut stream) = within(partitions.next()).await.unwrap();
    let nothing = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
    assert!(nothing.is_err(), "restarted consumer replayed records");
}

#[tokio::test]
async fn test_multi_partition_streams_preserve_offset_order() {
    let (consumer, state) = connect(test_settings());
    for p in 0..3 {
        for i in 0..30 {
            state.produce("events", p, None, &format!("p{p}-v{i}"));
        }
    }
    state.schedule_assign(vec![
        partition("events", 0),
        partition("events", 1),
        partition("events", 2),
    ]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let mut partitions = consumer
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let (tp, mut stream) = within(partitions.next()).await.unwrap();
        tasks.push(tokio::spawn(async move {
            let mut offsets = Vec::new();
            while offsets.len() < 30 {
                let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
                    .await
                    .expect("timed out")
                    .unwrap()
                    .unwrap();
                offsets.extend(chunk.iter().map(|r| r.record_offset()));
            }
            (tp, offsets)
        }));
    }

    let mut seen_partitions = Vec::new();
    for task in tasks {
        let (tp, offsets) = task.await.unwrap();
        assert_eq!(offsets, (0..30).collect::<Vec<i64>>());
        seen_partitions.push(tp);
    }
    seen_partitions.sort();
    assert_eq!(
        seen_partitions,
        vec![
            partition("events", 0),
            partition("events", 1),
            partition("events", 2)
        ]
    );
}

#[tokio::test]
async fn test_rebalance_completes_stream_and_new_owner_resumes() {
    let (consumer, state) = connect(test_settings());
    for i in 0..6 {
        state.produce("events", 0, None, &format!("v{i}"));
    }
    state.schedule_assign(vec![partition("events", 0)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let mut partitions = consumer
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    let (_, mut stream) = within(partitions.next()).await.unwrap();

    let chunk = within(stream.next()).await.unwrap().unwrap();
    assert_eq!(chunk.len(), 6);
    let mut batch = OffsetBatch::empty();
    for record in &chunk {
        batch.add(&record.offset);
    }
    batch.commit().await.unwrap();

    // Another group member takes the partition over.
    state.schedule_revoke(vec![partition("events", 0)]);
    assert!(within(stream.next()).await.is_none());
    wait_until(|| consumer.assignment().is_empty()).await;

    // Records produced while ownership moves.
    for i in 6..10 {
        state.produce("events", 0, None, &format!("v{i}"));
    }

    let client = MockBrokerClient::with_state(state.clone());
    let successor = StreamingConsumer::with_client(client, test_settings());
    state.schedule_assign(vec![partition("events", 0)]);
    successor
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();
    let mut partitions = successor
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    let (_, mut stream) = within(partitions.next()).await.unwrap();
    let chunk = within(stream.next()).await.unwrap().unwrap();
    assert_eq!(chunk[0].record_offset(), 6);
}

#[tokio::test]
async fn test_backpressure_pauses_slow_partition_and_loses_nothing() {
    let settings = test_settings()
        .with_partition_chunk_prefetch(2)
        .with_max_poll_records(50);
    let (consumer, state) = connect(settings);
    for i in 0..500 {
        state.produce("events", 0, None, &format!("v{i}"));
    }
    state.schedule_assign(vec![partition("events", 0)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let mut partitions = consumer
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    let (_, mut stream) = within(partitions.next()).await.unwrap();

    let mut offsets = Vec::new();
    while offsets.len() < 500 {
        let chunk = within(stream.next()).await.unwrap().unwrap();
        offsets.extend(chunk.iter().map(|r| r.record_offset()));
        // A deliberately slow consumer: several polls pass per chunk taken.
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    assert_eq!(offsets, (0..500).collect::<Vec<i64>>());
    let paused: Vec<Partition> = state.pause_calls().into_iter().flatten().collect();
    assert!(
        paused.contains(&partition("events", 0)),
        "slow partition was never paused"
    );
    let resumed: Vec<Partition> = state.resume_calls().into_iter().flatten().collect();
    assert!(
        resumed.contains(&partition("events", 0)),
        "drained partition was never resumed"
    );
}

struct FixedOffsets(HashMap<Partition, i64>);

#[async_trait]
impl ManualOffsetResolver for FixedOffsets {
    async fn resolve(
        &self,
        _partitions: Vec<Partition>,
    ) -> Result<HashMap<Partition, i64>, ConsumerError> {
        Ok(self.0.clone())
    }
}

struct FailingResolver;

#[async_trait]
impl ManualOffsetResolver for FailingResolver {
    async fn resolve(
        &self,
        _partitions: Vec<Partition>,
    ) -> Result<HashMap<Partition, i64>, ConsumerError> {
        Err(ConsumerError::OffsetResolver("offset store offline".to_string()))
    }
}

#[tokio::test]
async fn test_manual_offset_retrieval_starts_at_resolved_offset() {
    let mut offsets = HashMap::new();
    offsets.insert(partition("events", 0), 50);
    let settings = test_settings()
        .with_offset_retrieval(OffsetRetrieval::Manual(Arc::new(FixedOffsets(offsets))));
    let (consumer, state) = connect(settings);

    for i in 0..100 {
        state.produce("events", 0, None, &format!("v{i}"));
    }
    state.schedule_assign(vec![partition("events", 0)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let mut partitions = consumer
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    let (_, mut stream) = within(partitions.next()).await.unwrap();
    let chunk = within(stream.next()).await.unwrap().unwrap();

    assert_eq!(chunk[0].record_offset(), 50);
    assert!(state.seeks().contains(&(partition("events", 0), 50)));
}

struct SuspendingResolver(HashMap<Partition, i64>);

#[async_trait]
impl ManualOffsetResolver for SuspendingResolver {
    async fn resolve(
        &self,
        _partitions: Vec<Partition>,
    ) -> Result<HashMap<Partition, i64>, ConsumerError> {
        // A resolver that genuinely suspends, like one reading an offset
        // store over the network.
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(self.0.clone())
    }
}

// Runs on the default current-thread test runtime on purpose: the resolver
// suspends on a timer inside the rebalance callback, which must not wedge
// the runtime that has to drive that timer.
#[tokio::test]
async fn test_suspending_resolver_does_not_stall_the_runtime() {
    let mut offsets = HashMap::new();
    offsets.insert(partition("events", 0), 7);
    let settings = test_settings().with_offset_retrieval(OffsetRetrieval::Manual(Arc::new(
        SuspendingResolver(offsets),
    )));
    let (consumer, state) = connect(settings);

    for i in 0..10 {
        state.produce("events", 0, None, &format!("v{i}"));
    }
    state.schedule_assign(vec![partition("events", 0)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let mut partitions = consumer
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    let (_, mut stream) = within(partitions.next()).await.unwrap();
    let chunk = within(stream.next()).await.unwrap().unwrap();

    assert_eq!(chunk[0].record_offset(), 7);
    assert!(state.seeks().contains(&(partition("events", 0), 7)));
}

#[tokio::test]
async fn test_manual_assignment_with_resolver_failure_leaves_unsubscribed() {
    let settings =
        test_settings().with_offset_retrieval(OffsetRetrieval::Manual(Arc::new(FailingResolver)));
    let (consumer, state) = connect(settings);

    let result = consumer
        .subscribe(Subscription::manual([partition("events", 0)]))
        .await;
    assert!(matches!(result, Err(ConsumerError::OffsetResolver(_))));
    assert!(state.assigned_partitions().is_empty());
    assert!(consumer.assignment().is_empty());
}

#[tokio::test]
async fn test_manual_assignment_consumes_from_resolved_offset() {
    let mut offsets = HashMap::new();
    offsets.insert(partition("events", 0), 3);
    let settings = test_settings()
        .with_offset_retrieval(OffsetRetrieval::Manual(Arc::new(FixedOffsets(offsets))));
    let (consumer, state) = connect(settings);

    for i in 0..10 {
        state.produce("events", 0, None, &format!("v{i}"));
    }
    consumer
        .subscribe(Subscription::manual([partition("events", 0)]))
        .await
        .unwrap();
    assert_eq!(consumer.phase(), RunloopPhase::Running);

    let mut partitions = consumer
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    let (_, mut stream) = within(partitions.next()).await.unwrap();
    let chunk = within(stream.next()).await.unwrap().unwrap();
    assert_eq!(chunk[0].record_offset(), 3);
}

#[tokio::test]
async fn test_graceful_shutdown_completes_pending_commit() {
    // A long poll interval so both the commit and the stop are queued
    // before the next tick services them.
    let settings = test_settings().with_poll_interval(Duration::from_millis(100));
    let (consumer, state) = connect(settings);

    for i in 0..43 {
        state.produce("events", 0, None, &format!("v{i}"));
    }
    state.schedule_assign(vec![partition("events", 0)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let mut partitions = consumer
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    let (_, mut stream) = within(partitions.next()).await.unwrap();
    let chunk = within(stream.next()).await.unwrap().unwrap();
    let last = chunk.last().unwrap();
    assert_eq!(last.offset.next_offset(), 43);

    let (commit_result, _) = tokio::join!(last.offset.commit(), consumer.stop_consumption());
    commit_result.unwrap();

    assert!(consumer.wait_until_stopped().await.is_none());
    assert_eq!(consumer.phase(), RunloopPhase::Stopped);
    assert_eq!(state.committed_offsets()[&partition("events", 0)], 43);

    // After the stop, the stream completes and no further records flow.
    assert!(within(stream.next()).await.is_none());
}

#[tokio::test]
async fn test_concurrent_commits_resolve_to_pointwise_max() {
    let (consumer, state) = connect(test_settings());
    for i in 0..10 {
        state.produce("events", 0, None, &format!("v{i}"));
    }
    state.schedule_assign(vec![partition("events", 0)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let mut partitions = consumer
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    let (_, mut stream) = within(partitions.next()).await.unwrap();
    let chunk = within(stream.next()).await.unwrap().unwrap();
    assert_eq!(chunk.len(), 10);

    let low = &chunk[2].offset;
    let high = &chunk[9].offset;
    let (a, b) = tokio::join!(high.commit(), low.commit());
    a.unwrap();
    b.unwrap();

    // Submission order does not matter; the committed position is the max.
    assert_eq!(state.committed_offsets()[&partition("events", 0)], 10);
    for attempt in state.commit_attempts() {
        assert!(attempt[&partition("events", 0)] <= 10);
    }
}

#[tokio::test]
async fn test_retriable_commit_failure_is_retried_by_policy() {
    let (consumer, state) = connect(test_settings());
    for i in 0..5 {
        state.produce("events", 0, None, &format!("v{i}"));
    }
    state.schedule_assign(vec![partition("events", 0)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let mut partitions = consumer
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    let (_, mut stream) = within(partitions.next()).await.unwrap();
    let chunk = within(stream.next()).await.unwrap().unwrap();

    state.fail_next_commit(ConsumerError::Broker {
        message: "coordinator moving".to_string(),
        retriable: true,
    });

    let policy = RetryPolicy {
        max_retries: 3,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        multiplier: 2.0,
    };
    chunk
        .last()
        .unwrap()
        .offset
        .commit_with_retry(&policy)
        .await
        .unwrap();

    assert!(state.commit_attempts().len() >= 2);
    assert_eq!(state.committed_offsets()[&partition("events", 0)], 5);
}

#[tokio::test]
async fn test_fatal_commit_failure_surfaces_without_retry() {
    let (consumer, state) = connect(test_settings());
    for i in 0..5 {
        state.produce("events", 0, None, &format!("v{i}"));
    }
    state.schedule_assign(vec![partition("events", 0)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let mut partitions = consumer
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    let (_, mut stream) = within(partitions.next()).await.unwrap();
    let chunk = within(stream.next()).await.unwrap().unwrap();

    state.fail_next_commit(ConsumerError::Broker {
        message: "unknown member".to_string(),
        retriable: false,
    });

    let policy = RetryPolicy {
        max_retries: 5,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(10),
        multiplier: 2.0,
    };
    let result = chunk
        .last()
        .unwrap()
        .offset
        .commit_with_retry(&policy)
        .await;
    assert!(matches!(
        result,
        Err(ConsumerError::Broker { retriable: false, .. })
    ));
    assert_eq!(state.commit_attempts().len(), 1);
}

#[tokio::test]
async fn test_poll_error_terminates_runloop_and_streams() {
    let (consumer, state) = connect(test_settings());
    state.schedule_assign(vec![partition("events", 0)]);
    state.schedule_poll_error(ConsumerError::Broker {
        message: "all brokers down".to_string(),
        retriable: false,
    });
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let mut partitions = consumer
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    let (_, mut stream) = within(partitions.next()).await.unwrap();

    assert!(matches!(
        within(stream.next()).await,
        Some(Err(ConsumerError::Broker { .. }))
    ));
    assert!(matches!(
        consumer.wait_until_stopped().await,
        Some(ConsumerError::Broker { .. })
    ));

    // Metadata calls fail once the runloop is gone.
    let result = consumer.list_topics(Duration::from_secs(1)).await;
    assert!(result.is_err());
}

#[derive(Debug, Deserialize)]
struct Event {
    #[allow(dead_code)]
    id: u64,
}

#[tokio::test]
async fn test_deserialization_failure_only_fails_its_partition() {
    let (consumer, state) = connect(test_settings());
    state.produce("events", 0, None, r#"{"id": 1}"#);
    state.produce("events", 0, None, r#"{"id": 2}"#);
    state.produce("events", 1, None, "not json at all");
    state.schedule_assign(vec![partition("events", 0), partition("events", 1)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let mut partitions = consumer
        .partitioned_stream(StringDeserializer, JsonDeserializer::<Event>::new())
        .unwrap();

    let mut healthy = 0;
    let mut failed = 0;
    for _ in 0..2 {
        let (tp, mut stream) = within(partitions.next()).await.unwrap();
        match within(stream.next()).await.unwrap() {
            Ok(chunk) => {
                assert_eq!(tp, partition("events", 0));
                assert_eq!(chunk.len(), 2);
                healthy += 1;
            }
            Err(ConsumerError::Deserialization { .. }) => {
                assert_eq!(tp, partition("events", 1));
                // The inner stream is failed for good.
                assert!(within(stream.next()).await.is_none());
                failed += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((healthy, failed), (1, 1));
}

#[tokio::test]
async fn test_plain_stream_merges_partitions_preserving_per_partition_order() {
    let (consumer, state) = connect(test_settings());
    for p in 0..2 {
        for i in 0..20 {
            state.produce("events", p, None, &format!("p{p}-v{i}"));
        }
    }
    state.schedule_assign(vec![partition("events", 0), partition("events", 1)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let stream = consumer
        .plain_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    futures::pin_mut!(stream);

    let mut by_partition: HashMap<Partition, Vec<i64>> = HashMap::new();
    for _ in 0..40 {
        let record = within(stream.next()).await.unwrap().unwrap();
        by_partition
            .entry(record.partition().clone())
            .or_default()
            .push(record.record_offset());
    }
    assert_eq!(by_partition.len(), 2);
    for offsets in by_partition.values() {
        assert_eq!(*offsets, (0..20).collect::<Vec<i64>>());
    }
}

#[tokio::test]
async fn test_process_and_commit_commits_every_chunk() {
    let (consumer, state) = connect(test_settings());
    for p in 0..2 {
        for i in 0..10 {
            state.produce("events", p, None, &format!("p{p}-v{i}"));
        }
    }
    state.schedule_assign(vec![partition("events", 0), partition("events", 1)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let consumer = Arc::new(consumer);
    let processed = Arc::new(AtomicUsize::new(0));

    let worker = {
        let consumer = consumer.clone();
        let processed = processed.clone();
        tokio::spawn(async move {
            consumer
                .process_and_commit(
                    StringDeserializer,
                    StringDeserializer,
                    RetryPolicy::default(),
                    move |_key, _value| {
                        let processed = processed.clone();
                        async move {
                            processed.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    },
                )
                .await
        })
    };

    wait_until(|| {
        let committed = state.committed_offsets();
        committed.get(&partition("events", 0)) == Some(&10)
            && committed.get(&partition("events", 1)) == Some(&10)
    })
    .await;

    consumer.stop_consumption().await;
    within(worker).await.unwrap().unwrap();
    assert_eq!(processed.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn test_assignment_tracks_assigned_minus_revoked_and_lost() {
    let (consumer, state) = connect(test_settings());
    state.schedule_assign(vec![partition("events", 0), partition("events", 1)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();
    wait_until(|| consumer.assignment().len() == 2).await;

    state.schedule_revoke(vec![partition("events", 1)]);
    wait_until(|| consumer.assignment().len() == 1).await;
    assert!(consumer.assignment().contains(&partition("events", 0)));

    state.schedule_lose(vec![partition("events", 0)]);
    wait_until(|| consumer.assignment().is_empty()).await;
}

#[tokio::test]
async fn test_lost_partition_fails_its_stream() {
    let (consumer, state) = connect(test_settings());
    state.produce("events", 0, None, "v0");
    state.schedule_assign(vec![partition("events", 0)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let mut partitions = consumer
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    let (_, mut stream) = within(partitions.next()).await.unwrap();
    let _ = within(stream.next()).await.unwrap().unwrap();

    state.schedule_lose(vec![partition("events", 0)]);
    assert!(matches!(
        within(stream.next()).await,
        Some(Err(ConsumerError::PartitionsLost(_)))
    ));
}

#[tokio::test]
async fn test_subscribe_is_idempotent_and_stream_single_take() {
    let (consumer, _state) = connect(test_settings());
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let first = consumer.partitioned_stream(StringDeserializer, StringDeserializer);
    assert!(first.is_ok());
    let second = consumer.partitioned_stream(StringDeserializer, StringDeserializer);
    assert!(matches!(second, Err(ConsumerError::StreamAlreadyTaken)));
}

#[tokio::test]
async fn test_diagnostics_reports_lifecycle_events() {
    let (diagnostics, mut events) = Diagnostics::channel();
    let settings = test_settings().with_diagnostics(diagnostics);
    let (consumer, state) = connect(settings);

    state.produce("events", 0, None, "v0");
    state.schedule_assign(vec![partition("events", 0)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    let mut partitions = consumer
        .partitioned_stream(StringDeserializer, StringDeserializer)
        .unwrap();
    let (_, mut stream) = within(partitions.next()).await.unwrap();
    let chunk = within(stream.next()).await.unwrap().unwrap();
    chunk[0].offset.commit().await.unwrap();

    let mut saw_assigned = false;
    let mut saw_poll_with_records = false;
    let mut saw_commit = false;
    while let Ok(event) = events.try_recv() {
        match event {
            DiagnosticEvent::Assigned(tps) => saw_assigned = tps.contains(&partition("events", 0)),
            DiagnosticEvent::Poll { records } if records > 0 => saw_poll_with_records = true,
            DiagnosticEvent::Commit { offsets } => {
                saw_commit = offsets.get(&partition("events", 0)) == Some(&1);
            }
            _ => {}
        }
    }
    assert!(saw_assigned, "no assignment event emitted");
    assert!(saw_poll_with_records, "no poll event emitted");
    assert!(saw_commit, "no commit event emitted");
}

#[tokio::test]
async fn test_metadata_passthroughs_hit_the_client() {
    let (consumer, state) = connect(test_settings());
    state.produce("events", 0, None, "v0");
    state.produce("events", 1, None, "v0");
    state.produce("clicks", 0, None, "v0");

    let topics = consumer.list_topics(Duration::from_secs(1)).await.unwrap();
    let names: Vec<&str> = topics.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["clicks", "events"]);

    let infos = consumer
        .partitions_for("events", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(infos.len(), 2);

    let ends = consumer
        .end_offsets(vec![partition("events", 0)], Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(ends[&partition("events", 0)], 1);

    let beginnings = consumer
        .beginning_offsets(vec![partition("events", 0)], Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(beginnings[&partition("events", 0)], 0);
}

#[tokio::test]
async fn test_dropping_every_handle_stops_the_runloop() {
    let (consumer, state) = connect(test_settings());
    state.schedule_assign(vec![partition("events", 0)]);
    consumer
        .subscribe(Subscription::topics(["events"]))
        .await
        .unwrap();

    drop(consumer);
    wait_until(|| state.is_unsubscribed() && state.is_closed()).await;
}

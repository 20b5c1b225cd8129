//! The public consumer surface.
//!
//! [`StreamingConsumer`] wires the client gate, the partition stream
//! registry and the runloop together, and exposes streams, commits and
//! metadata passthroughs. All coordination happens inside the runloop task;
//! the façade only exchanges messages with it.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt, TryStreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::client::{BrokerClient, PartitionInfo, RdKafkaBrokerClient, TopicMetadata};
use crate::config::ConsumerSettings;
use crate::deser::Deserializer;
use crate::error::ConsumerError;
use crate::gate::ClientGate;
use crate::offset_batch::{CommitSink, OffsetBatch, RetryPolicy};
use crate::partition_queue::RawPartitionStream;
use crate::rebalance::RebalanceListener;
use crate::registry::PartitionStreamRegistry;
use crate::runloop::{Command, Runloop, RunloopPhase};
use crate::types::{CommittableRecord, Offset, Partition, Record, Subscription};

/// Commits and stop requests queue here; the runloop drains them every tick.
const COMMAND_BUFFER: usize = 128;

/// Bound on how many partition streams `plain_stream` polls concurrently.
const PLAIN_STREAM_MERGE_LIMIT: usize = 64;

/// A streaming consumer over a Kafka-compatible broker.
///
/// Dropping the consumer and every stream and offset handle derived from it
/// closes the command channel, which the runloop treats as an immediate stop;
/// call [`StreamingConsumer::stop_consumption`] first for a graceful drain.
pub struct StreamingConsumer<C: BrokerClient = RdKafkaBrokerClient> {
    gate: Arc<ClientGate<C>>,
    commands: mpsc::Sender<Command>,
    assignment: Arc<Mutex<HashSet<Partition>>>,
    failure: Arc<Mutex<Option<ConsumerError>>>,
    new_streams: Mutex<Option<mpsc::UnboundedReceiver<(Partition, RawPartitionStream)>>>,
    phase: watch::Receiver<RunloopPhase>,
}

impl StreamingConsumer<RdKafkaBrokerClient> {
    /// Build an rdkafka-backed consumer and start its runloop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(settings: ConsumerSettings) -> Result<Self, ConsumerError> {
        let client = RdKafkaBrokerClient::from_config(&settings.client_config())?;
        Ok(Self::with_client(client, settings))
    }
}

impl<C: BrokerClient> StreamingConsumer<C> {
    /// Start a consumer over any [`BrokerClient`] implementation.
    pub fn with_client(mut client: C, settings: ConsumerSettings) -> Self {
        let (new_streams_tx, new_streams_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(PartitionStreamRegistry::new(
            settings.partition_chunk_prefetch,
            new_streams_tx,
        ));
        let assignment = Arc::new(Mutex::new(HashSet::new()));
        let failure = Arc::new(Mutex::new(None));
        let accepting_new = Arc::new(AtomicBool::new(true));

        let listener = Arc::new(RebalanceListener::new(
            registry.clone(),
            assignment.clone(),
            settings.offset_retrieval.clone(),
            settings.diagnostics.clone(),
            failure.clone(),
            accepting_new.clone(),
        ));
        client.set_rebalance_listener(listener);

        let gate = Arc::new(ClientGate::new(client));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (phase_tx, phase_rx) = watch::channel(RunloopPhase::Initializing);

        let runloop = Runloop::new(
            &settings,
            gate.clone(),
            command_rx,
            registry,
            assignment.clone(),
            failure.clone(),
            accepting_new,
            phase_tx,
        );
        tokio::spawn(runloop.run());

        Self {
            gate,
            commands: command_tx,
            assignment,
            failure,
            new_streams: Mutex::new(Some(new_streams_rx)),
            phase: phase_rx,
        }
    }

    /// Subscribe to topics, a pattern, or a manual partition assignment.
    ///
    /// Idempotent for an identical subscription; a different one replaces
    /// the current subscription on the client. For
    /// [`Subscription::Manual`] with manual offset retrieval, the resolver
    /// runs first and a failure leaves the consumer unsubscribed.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<(), ConsumerError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                subscription,
                done: done_tx,
            })
            .await
            .map_err(|_| self.terminal_error())?;
        done_rx.await.map_err(|_| self.terminal_error())?
    }

    /// The stream of per-partition streams.
    ///
    /// Yields one entry per owned partition as ownership is gained; inner
    /// streams deliver chunks in broker offset order and complete on
    /// revocation or shutdown. Can be taken once per consumer.
    pub fn partitioned_stream<K, V, KD, VD>(
        &self,
        key_deserializer: KD,
        value_deserializer: VD,
    ) -> Result<PartitionedStream<K, V>, ConsumerError>
    where
        K: Send + 'static,
        V: Send + 'static,
        KD: Deserializer<K> + 'static,
        VD: Deserializer<V> + 'static,
    {
        let receiver = self
            .new_streams
            .lock()
            .unwrap()
            .take()
            .ok_or(ConsumerError::StreamAlreadyTaken)?;
        Ok(PartitionedStream {
            receiver,
            key_deserializer: Arc::new(key_deserializer),
            value_deserializer: Arc::new(value_deserializer),
            sink: self.commit_sink(),
        })
    }

    /// Unordered merge of all partition streams, with bounded concurrency.
    /// Per-partition ordering is preserved; interleaving across partitions
    /// is arbitrary.
    pub fn plain_stream<K, V, KD, VD>(
        &self,
        key_deserializer: KD,
        value_deserializer: VD,
    ) -> Result<
        impl Stream<Item = Result<CommittableRecord<K, V>, ConsumerError>> + Send,
        ConsumerError,
    >
    where
        K: Send + 'static,
        V: Send + 'static,
        KD: Deserializer<K> + 'static,
        VD: Deserializer<V> + 'static,
    {
        let partitioned = self.partitioned_stream(key_deserializer, value_deserializer)?;
        Ok(partitioned
            .map(|(_partition, stream)| {
                stream
                    .map(|chunk| futures::stream::iter(chunk_into_results(chunk)))
                    .flatten()
            })
            .flatten_unordered(Some(PLAIN_STREAM_MERGE_LIMIT)))
    }

    /// Consume every partition, run `effect` per record, and commit each
    /// chunk's offsets with `policy` once its records are processed.
    ///
    /// At-least-once: offsets processed but not yet committed when the
    /// consumer terminates are replayed on restart. An effect failure
    /// terminates the whole stream with [`ConsumerError::Effect`].
    pub async fn process_and_commit<K, V, KD, VD, F, Fut>(
        &self,
        key_deserializer: KD,
        value_deserializer: VD,
        policy: RetryPolicy,
        effect: F,
    ) -> Result<(), ConsumerError>
    where
        K: Send + 'static,
        V: Send + 'static,
        KD: Deserializer<K> + 'static,
        VD: Deserializer<V> + 'static,
        F: Fn(Option<K>, V) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
    {
        let partitioned = self.partitioned_stream(key_deserializer, value_deserializer)?;
        partitioned
            .map(Ok::<_, ConsumerError>)
            .try_for_each_concurrent(None, |(partition, mut stream)| {
                let effect = &effect;
                let policy = &policy;
                async move {
                    debug!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        "processing partition stream"
                    );
                    while let Some(chunk) = stream.next().await {
                        let chunk = chunk?;
                        let mut batch = OffsetBatch::empty();
                        for record in chunk {
                            let CommittableRecord {
                                key, value, offset, ..
                            } = record;
                            effect(key, value)
                                .await
                                .map_err(|e| ConsumerError::Effect(e.to_string()))?;
                            batch.add(&offset);
                        }
                        batch.commit_with_retry(policy).await?;
                    }
                    Ok(())
                }
            })
            .await
    }

    /// Request a graceful stop and return immediately: polling stops, queued
    /// records stay consumable, pending commits are drained before the
    /// runloop exits.
    pub async fn stop_consumption(&self) {
        let _ = self.commands.send(Command::Stop { graceful: true }).await;
    }

    /// Commit a batch and await broker acknowledgment.
    pub async fn commit(&self, batch: &OffsetBatch) -> Result<(), ConsumerError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.commit_sink().submit(batch.offsets().clone()).await
    }

    /// Commit a batch, retrying transient failures per `policy`.
    pub async fn commit_with_retry(
        &self,
        batch: &OffsetBatch,
        policy: &RetryPolicy,
    ) -> Result<(), ConsumerError> {
        let mut attempt = 0;
        loop {
            match self.commit(batch).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retriable() && attempt < policy.max_retries => {
                    tokio::time::sleep(policy.backoff_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The partitions this consumer currently owns.
    pub fn assignment(&self) -> HashSet<Partition> {
        self.assignment.lock().unwrap().clone()
    }

    pub fn phase(&self) -> RunloopPhase {
        *self.phase.borrow()
    }

    /// Wait for the runloop to stop; returns its fatal error, if any.
    pub async fn wait_until_stopped(&self) -> Option<ConsumerError> {
        let mut phase = self.phase.clone();
        let _ = phase.wait_for(|p| *p == RunloopPhase::Stopped).await;
        self.failure.lock().unwrap().clone()
    }

    // ---- metadata passthroughs ------------------------------------------

    pub async fn list_topics(
        &self,
        timeout: Duration,
    ) -> Result<Vec<TopicMetadata>, ConsumerError> {
        self.ensure_live()?;
        self.gate.with_client(move |c| c.list_topics(timeout)).await
    }

    pub async fn partitions_for(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<Vec<PartitionInfo>, ConsumerError> {
        self.ensure_live()?;
        let topic = topic.to_string();
        self.gate
            .with_client(move |c| c.partitions_for(&topic, timeout))
            .await
    }

    pub async fn beginning_offsets(
        &self,
        partitions: Vec<Partition>,
        timeout: Duration,
    ) -> Result<HashMap<Partition, i64>, ConsumerError> {
        self.ensure_live()?;
        self.gate
            .with_client(move |c| c.beginning_offsets(&partitions, timeout))
            .await
    }

    pub async fn end_offsets(
        &self,
        partitions: Vec<Partition>,
        timeout: Duration,
    ) -> Result<HashMap<Partition, i64>, ConsumerError> {
        self.ensure_live()?;
        self.gate
            .with_client(move |c| c.end_offsets(&partitions, timeout))
            .await
    }

    pub async fn committed(
        &self,
        partitions: Vec<Partition>,
        timeout: Duration,
    ) -> Result<HashMap<Partition, i64>, ConsumerError> {
        self.ensure_live()?;
        self.gate
            .with_client(move |c| c.committed(&partitions, timeout))
            .await
    }

    pub async fn position(&self, partition: &Partition) -> Result<Option<i64>, ConsumerError> {
        self.ensure_live()?;
        let partition = partition.clone();
        self.gate.with_client(move |c| c.position(&partition)).await
    }

    pub async fn offsets_for_times(
        &self,
        timestamps: HashMap<Partition, i64>,
        timeout: Duration,
    ) -> Result<HashMap<Partition, Option<i64>>, ConsumerError> {
        self.ensure_live()?;
        self.gate
            .with_client(move |c| c.offsets_for_times(&timestamps, timeout))
            .await
    }

    // ---- deprecated seek shims ------------------------------------------

    /// Migration shim; prefer [`crate::types::OffsetRetrieval::Manual`],
    /// which seeks inside the rebalance callback before any fetch.
    #[deprecated(note = "prefer OffsetRetrieval::Manual for starting offsets")]
    pub async fn seek(&self, partition: &Partition, offset: i64) -> Result<(), ConsumerError> {
        self.ensure_live()?;
        let partition = partition.clone();
        self.gate
            .with_client(move |c| c.seek(&partition, offset))
            .await
    }

    /// Migration shim; prefer [`crate::types::OffsetRetrieval::Manual`].
    #[deprecated(note = "prefer OffsetRetrieval::Manual for starting offsets")]
    pub async fn seek_to_beginning(
        &self,
        partitions: Vec<Partition>,
    ) -> Result<(), ConsumerError> {
        self.ensure_live()?;
        self.gate
            .with_client(move |c| c.seek_to_beginning(&partitions))
            .await
    }

    /// Migration shim; prefer [`crate::types::OffsetRetrieval::Manual`].
    #[deprecated(note = "prefer OffsetRetrieval::Manual for starting offsets")]
    pub async fn seek_to_end(&self, partitions: Vec<Partition>) -> Result<(), ConsumerError> {
        self.ensure_live()?;
        self.gate
            .with_client(move |c| c.seek_to_end(&partitions))
            .await
    }

    // ---------------------------------------------------------------------

    fn commit_sink(&self) -> CommitSink {
        CommitSink::new(self.commands.clone())
    }

    fn ensure_live(&self) -> Result<(), ConsumerError> {
        if self.phase() == RunloopPhase::Stopped {
            return Err(self.terminal_error());
        }
        Ok(())
    }

    fn terminal_error(&self) -> ConsumerError {
        self.failure
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(ConsumerError::ShuttingDown)
    }
}

/// Stream of `(partition, inner stream)` pairs, one per owned partition.
pub struct PartitionedStream<K, V> {
    receiver: mpsc::UnboundedReceiver<(Partition, RawPartitionStream)>,
    key_deserializer: Arc<dyn Deserializer<K>>,
    value_deserializer: Arc<dyn Deserializer<V>>,
    sink: CommitSink,
}

impl<K, V> Stream for PartitionedStream<K, V> {
    type Item = (Partition, PartitionRecordStream<K, V>);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.receiver.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Ready(Some((partition, raw))) => {
                let stream = PartitionRecordStream {
                    raw,
                    key_deserializer: this.key_deserializer.clone(),
                    value_deserializer: this.value_deserializer.clone(),
                    sink: this.sink.clone(),
                    failed: false,
                };
                Poll::Ready(Some((partition, stream)))
            }
        }
    }
}

/// Ordered chunk stream for one partition.
///
/// Completes cleanly on revocation or graceful shutdown; a deserialization
/// failure or an abnormal termination yields one `Err` and then ends. Other
/// partitions are unaffected either way.
pub struct PartitionRecordStream<K, V> {
    raw: RawPartitionStream,
    key_deserializer: Arc<dyn Deserializer<K>>,
    value_deserializer: Arc<dyn Deserializer<V>>,
    sink: CommitSink,
    failed: bool,
}

impl<K, V> PartitionRecordStream<K, V> {
    pub fn partition(&self) -> &Partition {
        self.raw.partition()
    }

    fn deserialize_chunk(
        &self,
        records: Vec<Record>,
    ) -> Result<Vec<CommittableRecord<K, V>>, ConsumerError> {
        records
            .into_iter()
            .map(|record| {
                let topic = record.partition.topic().to_string();
                let key = match &record.key {
                    Some(bytes) => Some(self.key_deserializer.deserialize(&topic, Some(bytes))?),
                    None => None,
                };
                let value = self
                    .value_deserializer
                    .deserialize(&topic, record.payload.as_deref())?;
                Ok(CommittableRecord {
                    key,
                    value,
                    timestamp: record.timestamp,
                    headers: record.headers,
                    offset: Offset {
                        partition: record.partition,
                        next_offset: record.offset + 1,
                        sink: self.sink.clone(),
                    },
                })
            })
            .collect()
    }
}

impl<K, V> Stream for PartitionRecordStream<K, V> {
    type Item = Result<Vec<CommittableRecord<K, V>>, ConsumerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.failed {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.raw).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Ready(Some(Err(e))) => {
                this.failed = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Some(Ok(records))) => match this.deserialize_chunk(records) {
                Ok(chunk) => Poll::Ready(Some(Ok(chunk))),
                Err(e) => {
                    this.failed = true;
                    Poll::Ready(Some(Err(e)))
                }
            },
        }
    }
}

fn chunk_into_results<K, V>(
    chunk: Result<Vec<CommittableRecord<K, V>>, ConsumerError>,
) -> Vec<Result<CommittableRecord<K, V>, ConsumerError>> {
    match chunk {
        Ok(records) => records.into_iter().map(Ok).collect(),
        Err(e) => vec![Err(e)],
    }
}

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::ConsumerError;
use crate::runloop::{Command, CommitRequest};
use crate::types::{Offset, Partition};

/// Sends commit requests into the runloop and awaits their completion.
#[derive(Clone)]
pub struct CommitSink {
    tx: mpsc::Sender<Command>,
}

impl CommitSink {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    pub(crate) async fn submit(
        &self,
        offsets: HashMap<Partition, i64>,
    ) -> Result<(), ConsumerError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Commit(CommitRequest {
                offsets,
                done: done_tx,
            }))
            .await
            .map_err(|_| ConsumerError::ShuttingDown)?;
        done_rx.await.map_err(|_| ConsumerError::ShuttingDown)?
    }
}

/// Backoff schedule for retrying commits that failed with a transient error.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No retries: the first failure is final.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let backoff = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(backoff.min(self.max_backoff.as_secs_f64()))
    }
}

/// An aggregation of per-partition commit offsets.
///
/// Merging keeps the highest offset per partition, so batches can be combined
/// in any order and any grouping without changing what ends up committed.
#[derive(Clone, Default)]
pub struct OffsetBatch {
    offsets: HashMap<Partition, i64>,
    sink: Option<CommitSink>,
}

impl OffsetBatch {
    /// The identity for [`OffsetBatch::merge`].
    pub fn empty() -> Self {
        Self::default()
    }

    /// Fold a record's commit handle into this batch.
    pub fn add(&mut self, offset: &Offset) {
        self.insert(offset.partition.clone(), offset.next_offset);
        if self.sink.is_none() {
            self.sink = Some(offset.sink.clone());
        }
    }

    /// Pointwise-max union of two batches.
    pub fn merge(mut self, other: OffsetBatch) -> OffsetBatch {
        for (partition, offset) in other.offsets {
            self.insert(partition, offset);
        }
        if self.sink.is_none() {
            self.sink = other.sink;
        }
        self
    }

    pub fn offsets(&self) -> &HashMap<Partition, i64> {
        &self.offsets
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Submit this batch and await broker acknowledgment. Committing an empty
    /// batch is a no-op.
    pub async fn commit(&self) -> Result<(), ConsumerError> {
        if self.offsets.is_empty() {
            return Ok(());
        }
        let sink = self.sink.as_ref().ok_or(ConsumerError::ShuttingDown)?;
        sink.submit(self.offsets.clone()).await
    }

    /// Commit, resubmitting on transient broker failures per `policy`.
    ///
    /// Non-retriable failures and policy exhaustion return the last error.
    pub async fn commit_with_retry(&self, policy: &RetryPolicy) -> Result<(), ConsumerError> {
        let mut attempt = 0;
        loop {
            match self.commit().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retriable() && attempt < policy.max_retries => {
                    let backoff = policy.backoff_for(attempt);
                    debug!(
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying commit after transient failure: {e}"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn insert(&mut self, partition: Partition, offset: i64) {
        self.offsets
            .entry(partition)
            .and_modify(|existing| {
                if offset > *existing {
                    *existing = offset;
                }
            })
            .or_insert(offset);
    }
}

impl std::fmt::Debug for OffsetBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetBatch")
            .field("offsets", &self.offsets)
            .finish()
    }
}

/// Merge many commit maps into one effective commit, pointwise max.
pub(crate) fn merge_offset_maps(
    maps: impl IntoIterator<Item = HashMap<Partition, i64>>,
) -> HashMap<Partition, i64> {
    let mut merged: HashMap<Partition, i64> = HashMap::new();
    for map in maps {
        for (partition, offset) in map {
            merged
                .entry(partition)
                .and_modify(|existing| {
                    if offset > *existing {
                        *existing = offset;
                    }
                })
                .or_insert(offset);
        }
    }
    merged
}

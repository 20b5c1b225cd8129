//! Registry of live partition queues.
//!
//! Queues are created synchronously during partition assignment and removed
//! during revocation, so record routing only ever sees queues for partitions
//! this consumer currently owns (or owned until moments ago and is draining).

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::ConsumerError;
use crate::partition_queue::{PartitionQueue, RawPartitionStream, StreamItem};
use crate::types::{Partition, Record};

/// What happened to a dispatched chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    Delivered,
    /// No queue is registered for the partition; the chunk was dropped.
    NoQueue,
}

pub(crate) struct PartitionStreamRegistry {
    queues: DashMap<Partition, PartitionQueue>,
    prefetch: usize,
    /// Consumer halves of newly created queues are announced here; the
    /// partitioned stream picks them up as new inner streams.
    new_streams: mpsc::UnboundedSender<(Partition, RawPartitionStream)>,
}

impl PartitionStreamRegistry {
    pub fn new(
        prefetch: usize,
        new_streams: mpsc::UnboundedSender<(Partition, RawPartitionStream)>,
    ) -> Self {
        Self {
            queues: DashMap::new(),
            prefetch,
            new_streams,
        }
    }

    /// Create a queue for `partition` and announce its stream. Idempotent
    /// while the queue exists; a fresh queue (and fresh inner stream) is
    /// created again after a drain.
    pub fn create(&self, partition: &Partition) -> bool {
        if self.queues.contains_key(partition) {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "queue already exists, reusing"
            );
            return false;
        }

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "creating partition queue"
        );
        let (queue, stream) = PartitionQueue::channel(partition.clone(), self.prefetch);
        self.queues.insert(partition.clone(), queue);
        // Nobody listening for new streams just means records are dropped at
        // dispatch time once this queue's consumer half is gone.
        let _ = self.new_streams.send((partition.clone(), stream));
        true
    }

    pub fn contains(&self, partition: &Partition) -> bool {
        self.queues.contains_key(partition)
    }

    pub fn backlog(&self, partition: &Partition) -> Option<usize> {
        self.queues.get(partition).map(|q| q.backlog())
    }

    /// Push one poll's records for one partition as a single chunk.
    pub async fn dispatch(
        &self,
        partition: &Partition,
        records: Vec<Record>,
    ) -> DispatchOutcome {
        // Clone the producer handle and release the map guard before
        // awaiting, so a backpressured queue cannot block map access for
        // other partitions.
        let queue = match self.queues.get(partition) {
            Some(entry) => entry.value().clone_producer(),
            None => return DispatchOutcome::NoQueue,
        };

        if queue.push_chunk(records).await {
            DispatchOutcome::Delivered
        } else {
            DispatchOutcome::NoQueue
        }
    }

    /// Drain the partition's queue: queued chunks stay readable, the stream
    /// then completes cleanly.
    pub fn drain(&self, partition: &Partition) {
        if let Some((_, mut queue)) = self.queues.remove(partition) {
            info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "draining partition queue"
            );
            queue.finish(StreamItem::End);
        }
    }

    /// Terminate the partition's stream with an error after queued chunks.
    pub fn fail(&self, partition: &Partition, error: ConsumerError) {
        if let Some((_, mut queue)) = self.queues.remove(partition) {
            queue.finish(StreamItem::Error(error));
        }
    }

    pub fn drain_all(&self) {
        for partition in self.active_partitions() {
            self.drain(&partition);
        }
    }

    pub fn fail_all(&self, error: ConsumerError) {
        for partition in self.active_partitions() {
            self.fail(&partition, error.clone());
        }
    }

    pub fn active_partitions(&self) -> Vec<Partition> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn partition(n: i32) -> Partition {
        Partition::new("events".to_string(), n)
    }

    fn record(n: i32, offset: i64) -> Record {
        Record {
            partition: partition(n),
            offset,
            timestamp: None,
            headers: Vec::new(),
            key: None,
            payload: None,
        }
    }

    fn registry() -> (
        PartitionStreamRegistry,
        mpsc::UnboundedReceiver<(Partition, RawPartitionStream)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PartitionStreamRegistry::new(4, tx), rx)
    }

    #[tokio::test]
    async fn test_create_announces_stream_once() {
        let (registry, mut rx) = registry();

        assert!(registry.create(&partition(0)));
        assert!(!registry.create(&partition(0)));

        let (announced, _stream) = rx.recv().await.unwrap();
        assert_eq!(announced, partition(0));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_without_queue_reports_no_queue() {
        let (registry, _rx) = registry();
        let outcome = registry.dispatch(&partition(0), vec![record(0, 0)]).await;
        assert_eq!(outcome, DispatchOutcome::NoQueue);
    }

    #[tokio::test]
    async fn test_dispatch_reaches_the_announced_stream() {
        let (registry, mut rx) = registry();
        registry.create(&partition(0));
        let (_, mut stream) = rx.recv().await.unwrap();

        let outcome = registry
            .dispatch(&partition(0), vec![record(0, 0), record(0, 1)])
            .await;
        assert_eq!(outcome, DispatchOutcome::Delivered);

        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk.len(), 2);
    }

    #[tokio::test]
    async fn test_drain_completes_stream_and_forgets_queue() {
        let (registry, mut rx) = registry();
        registry.create(&partition(0));
        let (_, mut stream) = rx.recv().await.unwrap();

        registry.drain(&partition(0));
        assert!(!registry.contains(&partition(0)));
        assert!(stream.next().await.is_none());

        // Records arriving after the drain are dropped.
        let outcome = registry.dispatch(&partition(0), vec![record(0, 5)]).await;
        assert_eq!(outcome, DispatchOutcome::NoQueue);
    }

    #[tokio::test]
    async fn test_create_after_drain_yields_fresh_stream() {
        let (registry, mut rx) = registry();
        registry.create(&partition(0));
        rx.recv().await.unwrap();

        registry.drain(&partition(0));
        assert!(registry.create(&partition(0)));
        let (announced, _stream) = rx.recv().await.unwrap();
        assert_eq!(announced, partition(0));
    }

    #[tokio::test]
    async fn test_fail_all_terminates_with_error() {
        let (registry, mut rx) = registry();
        registry.create(&partition(0));
        registry.create(&partition(1));
        let (_, mut s0) = rx.recv().await.unwrap();
        let (_, mut s1) = rx.recv().await.unwrap();

        registry.fail_all(ConsumerError::ShuttingDown);

        assert!(matches!(
            s0.next().await,
            Some(Err(ConsumerError::ShuttingDown))
        ));
        assert!(matches!(
            s1.next().await,
            Some(Err(ConsumerError::ShuttingDown))
        ));
        assert!(registry.active_partitions().is_empty());
    }
}

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::ConsumerError;
use crate::metrics_consts::PARTITION_QUEUE_BACKLOG;
use crate::types::{Partition, Record};

/// Items carried by a partition queue. Termination is an in-band tagged
/// variant rather than a closed channel, so consumers drain every chunk that
/// was queued before the terminal marker.
#[derive(Debug)]
pub(crate) enum StreamItem {
    Chunk(Vec<Record>),
    End,
    Error(ConsumerError),
}

/// Producer half of a partition queue. Single producer (the runloop), single
/// consumer (the user-visible stream). One broker poll's records for one
/// partition form exactly one chunk.
pub(crate) struct PartitionQueue {
    partition: Partition,
    tx: mpsc::Sender<StreamItem>,
    backlog: Arc<AtomicUsize>,
    open: bool,
}

impl PartitionQueue {
    /// Build a queue able to hold `prefetch` chunks plus slack for one
    /// in-flight chunk and the terminal marker.
    pub fn channel(partition: Partition, prefetch: usize) -> (Self, RawPartitionStream) {
        let capacity = prefetch.max(1) + 2;
        let (tx, rx) = mpsc::channel(capacity);
        let backlog = Arc::new(AtomicUsize::new(0));

        let queue = Self {
            partition: partition.clone(),
            tx,
            backlog: backlog.clone(),
            open: true,
        };
        let stream = RawPartitionStream {
            partition,
            rx,
            backlog,
            finished: false,
        };
        (queue, stream)
    }

    /// Cheap handle to the producer side, for pushing outside a map guard.
    pub fn clone_producer(&self) -> PartitionQueue {
        PartitionQueue {
            partition: self.partition.clone(),
            tx: self.tx.clone(),
            backlog: self.backlog.clone(),
            open: self.open,
        }
    }

    /// Chunks queued but not yet taken by the consumer.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    /// Push one chunk. Returns false once the queue is drained or the
    /// consumer is gone. May suspend when the queue is full, which the pause
    /// watermark prevents in normal operation.
    pub async fn push_chunk(&self, records: Vec<Record>) -> bool {
        if !self.open || records.is_empty() {
            return self.open;
        }

        self.backlog.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!(
            PARTITION_QUEUE_BACKLOG,
            "topic" => self.partition.topic().to_string(),
            "partition" => self.partition.partition_number().to_string()
        )
        .set(self.backlog.load(Ordering::SeqCst) as f64);

        if self.tx.send(StreamItem::Chunk(records)).await.is_err() {
            self.backlog.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Transition to drained: the terminal marker is queued after every
    /// pending chunk and no further chunks are accepted.
    pub fn finish(&mut self, terminal: StreamItem) {
        if !self.open {
            return;
        }
        self.open = false;

        match self.tx.try_send(terminal) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                // The slack slot was consumed by a racing chunk. Hand the
                // marker to a task so it still lands after the queued chunks.
                warn!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    "partition queue full while finishing, deferring terminal marker"
                );
                let tx = self.tx.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = tx.send(item).await;
                    });
                }
            }
        }
    }
}

/// Consumer half of a partition queue: an ordered stream of chunk results
/// ending after the terminal marker.
pub(crate) struct RawPartitionStream {
    partition: Partition,
    rx: mpsc::Receiver<StreamItem>,
    backlog: Arc<AtomicUsize>,
    finished: bool,
}

impl RawPartitionStream {
    pub fn partition(&self) -> &Partition {
        &self.partition
    }
}

impl Stream for RawPartitionStream {
    type Item = Result<Vec<Record>, ConsumerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                // Producer vanished without a terminal marker (hard abort).
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamItem::Chunk(records))) => {
                this.backlog.fetch_sub(1, Ordering::SeqCst);
                Poll::Ready(Some(Ok(records)))
            }
            Poll::Ready(Some(StreamItem::End)) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamItem::Error(e))) => {
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
        }
    }
}

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::diagnostics::{DiagnosticEvent, Diagnostics};
use crate::error::ConsumerError;
use crate::registry::PartitionStreamRegistry;
use crate::types::{OffsetRetrieval, Partition};

/// Seek callback handed to the listener by the broker client; it targets the
/// client the rebalance is being delivered on.
pub type SeekFn<'a> = dyn FnMut(&Partition, i64) -> Result<(), ConsumerError> + 'a;

/// Handles rebalance callbacks delivered synchronously inside a broker poll,
/// on the runloop's own execution context.
///
/// Everything here must complete in-context without waiting on user streams;
/// blocking on user-side work would stall the poll and trip session timeouts.
/// Queue creation and teardown are cheap synchronous operations; the only
/// potentially slow step is the manual offset resolver, which runs to
/// completion before the callback returns so seeks land before the next
/// fetch. The poll delivering these callbacks runs on a blocking-capable
/// worker (`ClientGate::with_client_blocking`), so parking this thread on
/// the resolver never stalls the async runtime that drives it.
pub struct RebalanceListener {
    registry: Arc<PartitionStreamRegistry>,
    assignment: Arc<Mutex<HashSet<Partition>>>,
    offset_retrieval: OffsetRetrieval,
    diagnostics: Diagnostics,
    /// Fatal error slot, checked by the runloop after every poll.
    failure: Arc<Mutex<Option<ConsumerError>>>,
    /// Cleared during graceful shutdown: no new queues from that point on.
    accepting_new: Arc<AtomicBool>,
}

impl RebalanceListener {
    pub(crate) fn new(
        registry: Arc<PartitionStreamRegistry>,
        assignment: Arc<Mutex<HashSet<Partition>>>,
        offset_retrieval: OffsetRetrieval,
        diagnostics: Diagnostics,
        failure: Arc<Mutex<Option<ConsumerError>>>,
        accepting_new: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            assignment,
            offset_retrieval,
            diagnostics,
            failure,
            accepting_new,
        }
    }

    /// Newly owned partitions get a queue each; with manual offset retrieval
    /// the resolver is consulted and seeks are issued before returning.
    pub fn on_partitions_assigned(&self, seek: &mut SeekFn<'_>, partitions: &[Partition]) {
        info!("assigned {} partitions: {:?}", partitions.len(), partitions);

        let newly: Vec<Partition> = {
            let mut assignment = self.assignment.lock().unwrap();
            partitions
                .iter()
                .filter(|tp| assignment.insert((*tp).clone()))
                .cloned()
                .collect()
        };

        if self.accepting_new.load(Ordering::SeqCst) {
            for partition in &newly {
                self.registry.create(partition);
            }
        } else {
            warn!(
                "ignoring {} newly assigned partitions while stopping",
                newly.len()
            );
        }

        if let OffsetRetrieval::Manual(resolver) = &self.offset_retrieval {
            if !newly.is_empty() {
                // The callback is synchronous and runs on the poll's blocking
                // worker; drive the resolver to completion here so every seek
                // precedes the next fetch.
                match futures::executor::block_on(resolver.resolve(newly.clone())) {
                    Ok(offsets) => {
                        for (partition, offset) in offsets {
                            if let Err(e) = seek(&partition, offset) {
                                error!("seek to {offset} on {partition} failed: {e}");
                                self.record_failure(e);
                            }
                        }
                    }
                    Err(e) => {
                        error!("manual offset resolver failed during rebalance: {e}");
                        self.record_failure(ConsumerError::OffsetResolver(e.to_string()));
                    }
                }
            }
        }

        self.diagnostics
            .emit(DiagnosticEvent::Assigned(partitions.to_vec()));
    }

    /// Revoked partitions drain cleanly: queued chunks stay readable, the
    /// stream then completes. No commits are issued here; that stays with
    /// user code.
    pub fn on_partitions_revoked(&self, partitions: &[Partition]) {
        info!("revoked {} partitions: {:?}", partitions.len(), partitions);

        {
            let mut assignment = self.assignment.lock().unwrap();
            for partition in partitions {
                assignment.remove(partition);
            }
        }
        for partition in partitions {
            self.registry.drain(partition);
        }

        self.diagnostics
            .emit(DiagnosticEvent::Revoked(partitions.to_vec()));
    }

    /// Lost partitions terminate abnormally: their streams end with an error.
    pub fn on_partitions_lost(&self, partitions: &[Partition]) {
        warn!("lost {} partitions: {:?}", partitions.len(), partitions);

        {
            let mut assignment = self.assignment.lock().unwrap();
            for partition in partitions {
                assignment.remove(partition);
            }
        }
        for partition in partitions {
            self.registry.fail(
                partition,
                ConsumerError::PartitionsLost(vec![partition.clone()]),
            );
        }

        self.diagnostics
            .emit(DiagnosticEvent::Lost(partitions.to_vec()));
    }

    fn record_failure(&self, error: ConsumerError) {
        let mut slot = self.failure.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualOffsetResolver;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn partition(n: i32) -> Partition {
        Partition::new("events".to_string(), n)
    }

    struct Fixture {
        listener: RebalanceListener,
        assignment: Arc<Mutex<HashSet<Partition>>>,
        failure: Arc<Mutex<Option<ConsumerError>>>,
        streams: mpsc::UnboundedReceiver<(Partition, crate::partition_queue::RawPartitionStream)>,
    }

    fn fixture(retrieval: OffsetRetrieval) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(PartitionStreamRegistry::new(4, tx));
        let assignment = Arc::new(Mutex::new(HashSet::new()));
        let failure = Arc::new(Mutex::new(None));
        let listener = RebalanceListener::new(
            registry,
            assignment.clone(),
            retrieval,
            Diagnostics::disabled(),
            failure.clone(),
            Arc::new(AtomicBool::new(true)),
        );
        Fixture {
            listener,
            assignment,
            failure,
            streams: rx,
        }
    }

    fn no_seek(_: &Partition, _: i64) -> Result<(), ConsumerError> {
        panic!("seek not expected with auto offset retrieval");
    }

    #[tokio::test]
    async fn test_assignment_creates_queues_and_tracks_partitions() {
        let mut fx = fixture(OffsetRetrieval::default());

        fx.listener
            .on_partitions_assigned(&mut no_seek, &[partition(0), partition(1)]);

        assert_eq!(fx.assignment.lock().unwrap().len(), 2);
        assert!(fx.streams.try_recv().is_ok());
        assert!(fx.streams.try_recv().is_ok());
        assert!(fx.streams.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reassignment_of_owned_partition_is_idempotent() {
        let mut fx = fixture(OffsetRetrieval::default());

        fx.listener
            .on_partitions_assigned(&mut no_seek, &[partition(0)]);
        fx.listener
            .on_partitions_assigned(&mut no_seek, &[partition(0)]);

        assert_eq!(fx.assignment.lock().unwrap().len(), 1);
        assert!(fx.streams.try_recv().is_ok());
        assert!(fx.streams.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_revocation_removes_and_drains() {
        let mut fx = fixture(OffsetRetrieval::default());

        fx.listener
            .on_partitions_assigned(&mut no_seek, &[partition(0)]);
        let (_, mut stream) = fx.streams.try_recv().unwrap();

        fx.listener.on_partitions_revoked(&[partition(0)]);
        assert!(fx.assignment.lock().unwrap().is_empty());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_lost_partitions_fail_their_streams() {
        let mut fx = fixture(OffsetRetrieval::default());

        fx.listener
            .on_partitions_assigned(&mut no_seek, &[partition(0)]);
        let (_, mut stream) = fx.streams.try_recv().unwrap();

        fx.listener.on_partitions_lost(&[partition(0)]);
        assert!(matches!(
            stream.next().await,
            Some(Err(ConsumerError::PartitionsLost(_)))
        ));
    }

    struct FixedResolver(HashMap<Partition, i64>);

    #[async_trait]
    impl ManualOffsetResolver for FixedResolver {
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
            Err(ConsumerError::OffsetResolver("store offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_manual_retrieval_seeks_resolved_offsets() {
        let mut offsets = HashMap::new();
        offsets.insert(partition(0), 50);
        let fx = fixture(OffsetRetrieval::Manual(Arc::new(FixedResolver(offsets))));

        let mut seeks = Vec::new();
        let mut seek = |tp: &Partition, offset: i64| {
            seeks.push((tp.clone(), offset));
            Ok(())
        };
        fx.listener.on_partitions_assigned(&mut seek, &[partition(0)]);

        assert_eq!(seeks, vec![(partition(0), 50)]);
        assert!(fx.failure.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolver_failure_is_recorded_as_fatal() {
        let fx = fixture(OffsetRetrieval::Manual(Arc::new(FailingResolver)));

        let mut seek = |_: &Partition, _: i64| Ok(());
        fx.listener.on_partitions_assigned(&mut seek, &[partition(0)]);

        assert!(matches!(
            *fx.failure.lock().unwrap(),
            Some(ConsumerError::OffsetResolver(_))
        ));
    }
}

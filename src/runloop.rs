//! The runloop: single owner of the broker client for the consumer's
//! lifetime.
//!
//! One task multiplexes three producers of work over the shared client: the
//! periodic poll tick, commit submissions arriving on the command channel,
//! and rebalance callbacks the client delivers from inside `poll`. User code
//! never touches the client directly; it talks to the runloop through bounded
//! channels (commands in, partition record queues out). Polls and synchronous
//! commits park their thread, so those steps run on a blocking-capable worker
//! through [`ClientGate::with_client_blocking`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::client::BrokerClient;
use crate::config::ConsumerSettings;
use crate::diagnostics::{DiagnosticEvent, Diagnostics};
use crate::error::ConsumerError;
use crate::gate::ClientGate;
use crate::metrics_consts::{
    CONSUMER_COMMIT_BATCHES, CONSUMER_COMMIT_FAILURES, CONSUMER_DISPATCHED_CHUNKS,
    CONSUMER_DROPPED_RECORDS, CONSUMER_PAUSED_PARTITIONS,
};
use crate::offset_batch::merge_offset_maps;
use crate::registry::{DispatchOutcome, PartitionStreamRegistry};
use crate::types::{OffsetRetrieval, Partition, Record, Subscription};

/// Lifecycle of the runloop, observable through the consumer's watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunloopPhase {
    Initializing,
    Running,
    StoppingGracefully,
    Stopped,
}

/// A batch of next-to-read offsets awaiting a broker acknowledgment.
pub(crate) struct CommitRequest {
    pub offsets: HashMap<Partition, i64>,
    pub done: oneshot::Sender<Result<(), ConsumerError>>,
}

pub(crate) enum Command {
    Subscribe {
        subscription: Subscription,
        done: oneshot::Sender<Result<(), ConsumerError>>,
    },
    Commit(CommitRequest),
    Stop {
        graceful: bool,
    },
}

pub(crate) struct Runloop<C: BrokerClient> {
    gate: Arc<ClientGate<C>>,
    commands: mpsc::Receiver<Command>,
    registry: Arc<PartitionStreamRegistry>,
    assignment: Arc<Mutex<HashSet<Partition>>>,
    /// Fatal errors recorded by the rebalance listener mid-poll.
    failure: Arc<Mutex<Option<ConsumerError>>>,
    accepting_new: Arc<AtomicBool>,
    diagnostics: Diagnostics,
    phase: watch::Sender<RunloopPhase>,
    offset_retrieval: OffsetRetrieval,
    poll_interval: Duration,
    poll_timeout: Duration,
    prefetch: usize,
    max_poll_records: usize,
    close_timeout: Duration,
    pending_commits: Vec<CommitRequest>,
    paused: HashSet<Partition>,
    current_subscription: Option<Subscription>,
    stop_deadline: Option<Instant>,
}

impl<C: BrokerClient> Runloop<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &ConsumerSettings,
        gate: Arc<ClientGate<C>>,
        commands: mpsc::Receiver<Command>,
        registry: Arc<PartitionStreamRegistry>,
        assignment: Arc<Mutex<HashSet<Partition>>>,
        failure: Arc<Mutex<Option<ConsumerError>>>,
        accepting_new: Arc<AtomicBool>,
        phase: watch::Sender<RunloopPhase>,
    ) -> Self {
        Self {
            gate,
            commands,
            registry,
            assignment,
            failure,
            accepting_new,
            diagnostics: settings.diagnostics.clone(),
            phase,
            offset_retrieval: settings.offset_retrieval.clone(),
            poll_interval: settings.poll_interval,
            poll_timeout: settings.poll_timeout,
            prefetch: settings.partition_chunk_prefetch,
            max_poll_records: settings.max_poll_records,
            close_timeout: settings.close_timeout,
            pending_commits: Vec::new(),
            paused: HashSet::new(),
            current_subscription: None,
            stop_deadline: None,
        }
    }

    pub async fn run(mut self) {
        info!("starting consumer runloop");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.current_phase() != RunloopPhase::Stopped {
            tokio::select! {
                // Commands first: a commit queued before a stop must be
                // serviced before the stop's final tick can conclude.
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.stop_now("all consumer handles dropped"),
                },

                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        self.fail(e);
                    }
                }
            }
        }

        self.finalize().await;
    }

    fn current_phase(&self) -> RunloopPhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: RunloopPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            info!("runloop phase: {previous:?} -> {phase:?}");
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { subscription, done } => {
                let result = self.handle_subscribe(subscription).await;
                let _ = done.send(result);
            }
            Command::Commit(request) => {
                if self.current_phase() == RunloopPhase::Stopped {
                    let _ = request.done.send(Err(ConsumerError::ShuttingDown));
                } else {
                    self.pending_commits.push(request);
                }
            }
            Command::Stop { graceful: true } => self.begin_graceful_stop().await,
            Command::Stop { graceful: false } => self.stop_now("stop requested"),
        }
    }

    async fn handle_subscribe(
        &mut self,
        subscription: Subscription,
    ) -> Result<(), ConsumerError> {
        match self.current_phase() {
            RunloopPhase::StoppingGracefully | RunloopPhase::Stopped => {
                return Err(ConsumerError::ShuttingDown)
            }
            RunloopPhase::Initializing | RunloopPhase::Running => {}
        }

        if self.current_subscription.as_ref() == Some(&subscription) {
            debug!("subscription unchanged, nothing to do");
            return Ok(());
        }

        self.apply_subscription(&subscription).await?;
        self.current_subscription = Some(subscription);
        if self.current_phase() == RunloopPhase::Initializing {
            self.set_phase(RunloopPhase::Running);
        }
        Ok(())
    }

    async fn apply_subscription(
        &mut self,
        subscription: &Subscription,
    ) -> Result<(), ConsumerError> {
        match subscription {
            Subscription::Topics(topics) => {
                info!("subscribing to topics {topics:?}");
                let topics = topics.clone();
                self.gate.with_client(move |c| c.subscribe(&topics)).await
            }
            Subscription::Pattern(pattern) => {
                info!("subscribing to pattern {pattern}");
                let pattern = pattern.clone();
                self.gate
                    .with_client(move |c| c.subscribe_pattern(&pattern))
                    .await
            }
            Subscription::Manual(partitions) => {
                info!("assigning {} partitions manually", partitions.len());

                // Resolve starting offsets before touching the client: a
                // resolver failure must leave the consumer unsubscribed.
                let resolved = match &self.offset_retrieval {
                    OffsetRetrieval::Manual(resolver) => {
                        Some(resolver.resolve(partitions.clone()).await?)
                    }
                    OffsetRetrieval::Auto(_) => None,
                };

                let assign_to = partitions.clone();
                self.gate
                    .with_client(move |c| {
                        c.assign(&assign_to)?;
                        if let Some(offsets) = &resolved {
                            for (partition, offset) in offsets {
                                c.seek(partition, *offset)?;
                            }
                        }
                        Ok::<(), ConsumerError>(())
                    })
                    .await?;

                {
                    let mut assignment = self.assignment.lock().unwrap();
                    for partition in partitions {
                        assignment.insert(partition.clone());
                    }
                }
                for partition in partitions {
                    self.registry.create(partition);
                }
                self.diagnostics
                    .emit(DiagnosticEvent::Assigned(partitions.clone()));
                Ok(())
            }
        }
    }

    async fn tick(&mut self) -> Result<(), ConsumerError> {
        match self.current_phase() {
            RunloopPhase::Initializing | RunloopPhase::Stopped => Ok(()),
            RunloopPhase::Running => self.running_tick().await,
            RunloopPhase::StoppingGracefully => self.stopping_tick().await,
        }
    }

    /// One tick: adjust the pause set, poll, fan records out, flush commits.
    async fn running_tick(&mut self) -> Result<(), ConsumerError> {
        self.check_listener_failure()?;
        self.reconcile_pause_set().await;

        // The poll parks its thread (bounded wait, plus any in-callback
        // manual offset resolution), so it runs on a blocking worker.
        let poll_timeout = self.poll_timeout;
        let max_records = self.max_poll_records;
        let records = self
            .gate
            .clone()
            .with_client_blocking(move |c| c.poll(poll_timeout, max_records))
            .await?;
        // The poll may have run the rebalance listener; surface anything
        // fatal it recorded before using its side effects.
        self.check_listener_failure()?;

        self.diagnostics.emit(DiagnosticEvent::Poll {
            records: records.len(),
        });
        self.dispatch(records).await;
        self.flush_commits().await;
        Ok(())
    }

    /// Graceful drain: every partition is paused so no new records arrive,
    /// but the client is still driven (a rebalance now is a normal
    /// revocation) and commits still flow until the pending set is empty or
    /// the deadline passes.
    async fn stopping_tick(&mut self) -> Result<(), ConsumerError> {
        self.check_listener_failure()?;

        let poll_timeout = self.poll_timeout;
        let max_records = self.max_poll_records;
        let records = self
            .gate
            .clone()
            .with_client_blocking(move |c| c.poll(poll_timeout, max_records))
            .await?;
        self.dispatch(records).await;
        self.flush_commits().await;

        let deadline_passed = self
            .stop_deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(true);
        if self.pending_commits.is_empty() || deadline_passed {
            if !self.pending_commits.is_empty() {
                warn!(
                    "graceful shutdown deadline passed with {} commits pending",
                    self.pending_commits.len()
                );
                self.fail_pending(ConsumerError::ShuttingDown);
            }
            self.registry.drain_all();
            self.set_phase(RunloopPhase::Stopped);
            info!("graceful shutdown completed");
        }
        Ok(())
    }

    /// Pause partitions whose queues hit the prefetch watermark, resume the
    /// ones that drained. A slow consumer only ever stalls its own partition.
    async fn reconcile_pause_set(&mut self) {
        let assignment: HashSet<Partition> = self.assignment.lock().unwrap().clone();

        let mut desired: HashSet<Partition> = HashSet::new();
        for partition in &assignment {
            if self.registry.backlog(partition).unwrap_or(0) >= self.prefetch {
                desired.insert(partition.clone());
            }
        }
        // Partitions we no longer own fall out without a resume call.
        self.paused.retain(|partition| assignment.contains(partition));

        let to_pause: Vec<Partition> = desired.difference(&self.paused).cloned().collect();
        let to_resume: Vec<Partition> = self.paused.difference(&desired).cloned().collect();

        if !to_pause.is_empty() || !to_resume.is_empty() {
            let pause = to_pause.clone();
            let resume = to_resume.clone();
            let result = self
                .gate
                .with_client(move |c| {
                    if !pause.is_empty() {
                        c.pause(&pause)?;
                    }
                    if !resume.is_empty() {
                        c.resume(&resume)?;
                    }
                    Ok::<(), ConsumerError>(())
                })
                .await;

            match result {
                Ok(()) => {
                    for partition in to_pause {
                        debug!(
                            topic = partition.topic(),
                            partition = partition.partition_number(),
                            "paused backlogged partition"
                        );
                        self.paused.insert(partition);
                    }
                    for partition in to_resume {
                        debug!(
                            topic = partition.topic(),
                            partition = partition.partition_number(),
                            "resumed drained partition"
                        );
                        self.paused.remove(&partition);
                    }
                }
                Err(e) => {
                    // Usually an ownership race around a rebalance; the next
                    // tick recomputes from fresh state.
                    warn!("pause/resume failed, will retry next tick: {e}");
                }
            }
        }

        metrics::gauge!(CONSUMER_PAUSED_PARTITIONS).set(self.paused.len() as f64);
    }

    /// Route one poll's records into their queues, one chunk per partition.
    async fn dispatch(&mut self, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }

        let mut chunks: HashMap<Partition, Vec<Record>> = HashMap::new();
        for record in records {
            chunks
                .entry(record.partition.clone())
                .or_default()
                .push(record);
        }

        for (partition, chunk) in chunks {
            let count = chunk.len();
            match self.registry.dispatch(&partition, chunk).await {
                DispatchOutcome::Delivered => {
                    metrics::counter!(CONSUMER_DISPATCHED_CHUNKS).increment(1);
                }
                DispatchOutcome::NoQueue => {
                    // This consumer no longer owns the partition; the new
                    // owner re-reads from the committed offset.
                    debug!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        count = count,
                        "dropping records for unregistered partition"
                    );
                    metrics::counter!(CONSUMER_DROPPED_RECORDS).increment(count as u64);
                    self.diagnostics
                        .emit(DiagnosticEvent::RecordsDropped { partition, count });
                }
            }
        }
    }

    /// Merge every pending request into one effective batch and issue a
    /// single client commit for it.
    async fn flush_commits(&mut self) {
        if self.pending_commits.is_empty() {
            return;
        }
        let requests = std::mem::take(&mut self.pending_commits);
        let merged = merge_offset_maps(requests.iter().map(|r| r.offsets.clone()));
        if merged.is_empty() {
            for request in requests {
                let _ = request.done.send(Ok(()));
            }
            return;
        }

        let offsets = merged.clone();
        let result = self
            .gate
            .clone()
            .with_client_blocking(move |c| c.commit(&offsets))
            .await;
        match result {
            Ok(()) => {
                debug!(
                    "committed offsets for {} partitions ({} requests)",
                    merged.len(),
                    requests.len()
                );
                metrics::counter!(CONSUMER_COMMIT_BATCHES).increment(1);
                self.diagnostics
                    .emit(DiagnosticEvent::Commit { offsets: merged });
                for request in requests {
                    let _ = request.done.send(Ok(()));
                }
            }
            Err(e) => {
                let class = if e.is_retriable() { "retriable" } else { "fatal" };
                warn!("commit of {} partitions failed ({class}): {e}", merged.len());
                metrics::counter!(CONSUMER_COMMIT_FAILURES, "class" => class).increment(1);
                // Retry is owned by the submitter's policy; hand every
                // batched caller the classified error.
                for request in requests {
                    let _ = request.done.send(Err(e.clone()));
                }
            }
        }
    }

    async fn begin_graceful_stop(&mut self) {
        match self.current_phase() {
            RunloopPhase::StoppingGracefully | RunloopPhase::Stopped => return,
            RunloopPhase::Initializing | RunloopPhase::Running => {}
        }
        info!("stopping consumption gracefully");

        self.accepting_new.store(false, Ordering::SeqCst);
        self.stop_deadline = Some(Instant::now() + self.close_timeout);
        self.set_phase(RunloopPhase::StoppingGracefully);

        // Stop fetching new records; existing queues keep draining.
        let assignment: Vec<Partition> =
            self.assignment.lock().unwrap().iter().cloned().collect();
        if !assignment.is_empty() {
            let result = self
                .gate
                .with_client(move |c| c.pause(&assignment))
                .await;
            if let Err(e) = result {
                warn!("failed to pause partitions for graceful shutdown: {e}");
            }
        }
    }

    fn stop_now(&mut self, reason: &str) {
        if self.current_phase() == RunloopPhase::Stopped {
            return;
        }
        info!("stopping consumption immediately: {reason}");
        self.accepting_new.store(false, Ordering::SeqCst);
        self.fail_pending(ConsumerError::ShuttingDown);
        self.registry.drain_all();
        self.set_phase(RunloopPhase::Stopped);
    }

    /// A poll failure is fatal: every stream and every pending commit
    /// observes the error, then the loop winds down.
    fn fail(&mut self, error: ConsumerError) {
        error!("runloop terminated: {error}");
        {
            let mut slot = self.failure.lock().unwrap();
            if slot.is_none() {
                *slot = Some(error.clone());
            }
        }
        self.accepting_new.store(false, Ordering::SeqCst);
        self.fail_pending(error.clone());
        self.registry.fail_all(error);
        self.set_phase(RunloopPhase::Stopped);
    }

    fn fail_pending(&mut self, error: ConsumerError) {
        for request in self.pending_commits.drain(..) {
            let _ = request.done.send(Err(error.clone()));
        }
    }

    fn check_listener_failure(&self) -> Result<(), ConsumerError> {
        match &*self.failure.lock().unwrap() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn finalize(&mut self) {
        // Refuse anything still queued behind the stop.
        self.commands.close();
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Commit(request) => {
                    let _ = request.done.send(Err(ConsumerError::ShuttingDown));
                }
                Command::Subscribe { done, .. } => {
                    let _ = done.send(Err(ConsumerError::ShuttingDown));
                }
                Command::Stop { .. } => {}
            }
        }

        let close_timeout = self.close_timeout;
        self.gate
            .with_client(move |c| {
                c.unsubscribe();
                c.close(close_timeout);
            })
            .await;
        info!("consumer runloop stopped");
    }
}

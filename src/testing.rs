//! Test support: an in-memory, scriptable [`BrokerClient`].
//!
//! [`MockBrokerClient`] models just enough broker behavior to exercise the
//! runloop end to end without a cluster: per-partition logs with fetch
//! cursors, committed offsets, pause/resume, seeks, and scripted control
//! events (assignments, revocations, losses, poll errors) that are delivered
//! through the registered rebalance listener from inside `poll`, exactly
//! like the real client does.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::{BrokerClient, PartitionInfo, TopicMetadata};
use crate::error::ConsumerError;
use crate::rebalance::RebalanceListener;
use crate::types::{Partition, Record};

const BASE_TIMESTAMP_MS: i64 = 1_700_000_000_000;

/// Control events processed at the start of the next `poll`.
#[derive(Debug, Clone)]
enum ControlEvent {
    Assign(Vec<Partition>),
    Revoke(Vec<Partition>),
    Lose(Vec<Partition>),
    PollError(ConsumerError),
}

/// Shared mock-broker state. Tests keep a handle to script events and
/// observe what the consumer did.
#[derive(Default)]
pub struct MockState {
    listener: Mutex<Option<Arc<RebalanceListener>>>,
    control: Mutex<VecDeque<ControlEvent>>,
    logs: Mutex<HashMap<Partition, Vec<Record>>>,
    cursors: Mutex<HashMap<Partition, i64>>,
    assigned: Mutex<HashSet<Partition>>,
    paused: Mutex<HashSet<Partition>>,
    pause_calls: Mutex<Vec<Vec<Partition>>>,
    resume_calls: Mutex<Vec<Vec<Partition>>>,
    seeks: Mutex<Vec<(Partition, i64)>>,
    commit_attempts: Mutex<Vec<HashMap<Partition, i64>>>,
    committed: Mutex<HashMap<Partition, i64>>,
    commit_failures: Mutex<VecDeque<ConsumerError>>,
    subscribed_topics: Mutex<Option<Vec<String>>>,
    unsubscribed: AtomicBool,
    closed: AtomicBool,
}

impl MockState {
    /// Append a record to the partition's log, returning its offset.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&str>,
        payload: &str,
    ) -> i64 {
        let partition = Partition::new(topic.to_string(), partition);
        let mut logs = self.logs.lock().unwrap();
        let log = logs.entry(partition.clone()).or_default();
        let offset = log.len() as i64;
        log.push(Record {
            partition,
            offset,
            timestamp: Some(BASE_TIMESTAMP_MS + offset),
            headers: Vec::new(),
            key: key.map(|k| k.as_bytes().to_vec()),
            payload: Some(payload.as_bytes().to_vec()),
        });
        offset
    }

    /// Deliver an assignment through the rebalance listener on the next poll.
    pub fn schedule_assign(&self, partitions: Vec<Partition>) {
        self.control
            .lock()
            .unwrap()
            .push_back(ControlEvent::Assign(partitions));
    }

    /// Deliver a revocation through the rebalance listener on the next poll.
    pub fn schedule_revoke(&self, partitions: Vec<Partition>) {
        self.control
            .lock()
            .unwrap()
            .push_back(ControlEvent::Revoke(partitions));
    }

    /// Deliver a partition loss through the rebalance listener on the next poll.
    pub fn schedule_lose(&self, partitions: Vec<Partition>) {
        self.control
            .lock()
            .unwrap()
            .push_back(ControlEvent::Lose(partitions));
    }

    /// Make the next poll fail with `error`.
    pub fn schedule_poll_error(&self, error: ConsumerError) {
        self.control
            .lock()
            .unwrap()
            .push_back(ControlEvent::PollError(error));
    }

    /// Make the next commit attempt fail with `error`.
    pub fn fail_next_commit(&self, error: ConsumerError) {
        self.commit_failures.lock().unwrap().push_back(error);
    }

    pub fn commit_attempts(&self) -> Vec<HashMap<Partition, i64>> {
        self.commit_attempts.lock().unwrap().clone()
    }

    /// The broker's view of the group's committed offsets.
    pub fn committed_offsets(&self) -> HashMap<Partition, i64> {
        self.committed.lock().unwrap().clone()
    }

    pub fn pause_calls(&self) -> Vec<Vec<Partition>> {
        self.pause_calls.lock().unwrap().clone()
    }

    pub fn resume_calls(&self) -> Vec<Vec<Partition>> {
        self.resume_calls.lock().unwrap().clone()
    }

    pub fn seeks(&self) -> Vec<(Partition, i64)> {
        self.seeks.lock().unwrap().clone()
    }

    pub fn subscribed_topics(&self) -> Option<Vec<String>> {
        self.subscribed_topics.lock().unwrap().clone()
    }

    pub fn assigned_partitions(&self) -> HashSet<Partition> {
        self.assigned.lock().unwrap().clone()
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn listener(&self) -> Option<Arc<RebalanceListener>> {
        self.listener.lock().unwrap().clone()
    }

    /// Where fetching starts for a freshly owned partition: the committed
    /// offset if the group has one, the log start otherwise.
    fn init_cursor(&self, partition: &Partition) {
        let committed = self.committed.lock().unwrap().get(partition).copied();
        self.cursors
            .lock()
            .unwrap()
            .entry(partition.clone())
            .or_insert(committed.unwrap_or(0));
    }
}

/// In-memory [`BrokerClient`] backed by shared [`MockState`].
#[derive(Default)]
pub struct MockBrokerClient {
    state: Arc<MockState>,
}

impl MockBrokerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a client over existing state, e.g. to model a consumer restart
    /// against the same broker log and committed offsets.
    pub fn with_state(state: Arc<MockState>) -> Self {
        state.unsubscribed.store(false, Ordering::SeqCst);
        state.closed.store(false, Ordering::SeqCst);
        Self { state }
    }

    /// Handle for scripting and assertions; keep a clone before handing the
    /// client to a consumer.
    pub fn state(&self) -> Arc<MockState> {
        self.state.clone()
    }

    fn apply_assign(&self, partitions: &[Partition]) {
        {
            let mut assigned = self.state.assigned.lock().unwrap();
            for partition in partitions {
                assigned.insert(partition.clone());
            }
        }
        for partition in partitions {
            self.state.init_cursor(partition);
        }
        if let Some(listener) = self.state.listener() {
            let state = self.state.clone();
            let mut seek = move |partition: &Partition, offset: i64| {
                state
                    .seeks
                    .lock()
                    .unwrap()
                    .push((partition.clone(), offset));
                state
                    .cursors
                    .lock()
                    .unwrap()
                    .insert(partition.clone(), offset);
                Ok(())
            };
            listener.on_partitions_assigned(&mut seek, partitions);
        }
    }

    fn apply_revoke(&self, partitions: &[Partition], lost: bool) {
        {
            let mut assigned = self.state.assigned.lock().unwrap();
            for partition in partitions {
                assigned.remove(partition);
            }
        }
        if let Some(listener) = self.state.listener() {
            if lost {
                listener.on_partitions_lost(partitions);
            } else {
                listener.on_partitions_revoked(partitions);
            }
        }
    }
}

impl BrokerClient for MockBrokerClient {
    fn set_rebalance_listener(&mut self, listener: Arc<RebalanceListener>) {
        *self.state.listener.lock().unwrap() = Some(listener);
    }

    fn subscribe(&mut self, topics: &[String]) -> Result<(), ConsumerError> {
        *self.state.subscribed_topics.lock().unwrap() = Some(topics.to_vec());
        Ok(())
    }

    fn subscribe_pattern(&mut self, pattern: &str) -> Result<(), ConsumerError> {
        *self.state.subscribed_topics.lock().unwrap() = Some(vec![pattern.to_string()]);
        Ok(())
    }

    fn assign(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        let mut assigned = self.state.assigned.lock().unwrap();
        for partition in partitions {
            assigned.insert(partition.clone());
        }
        drop(assigned);
        for partition in partitions {
            self.state.init_cursor(partition);
        }
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.state.unsubscribed.store(true, Ordering::SeqCst);
        self.state.assigned.lock().unwrap().clear();
    }

    fn poll(
        &mut self,
        _timeout: Duration,
        max_records: usize,
    ) -> Result<Vec<Record>, ConsumerError> {
        // Control events fire inside poll, like real rebalance callbacks.
        loop {
            let event = self.state.control.lock().unwrap().pop_front();
            match event {
                None => break,
                Some(ControlEvent::Assign(partitions)) => self.apply_assign(&partitions),
                Some(ControlEvent::Revoke(partitions)) => self.apply_revoke(&partitions, false),
                Some(ControlEvent::Lose(partitions)) => self.apply_revoke(&partitions, true),
                Some(ControlEvent::PollError(error)) => return Err(error),
            }
        }

        let mut assigned: Vec<Partition> = self
            .state
            .assigned
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assigned.sort();

        let paused = self.state.paused.lock().unwrap().clone();
        let logs = self.state.logs.lock().unwrap();
        let mut cursors = self.state.cursors.lock().unwrap();

        let mut records = Vec::new();
        for partition in assigned {
            if paused.contains(&partition) {
                continue;
            }
            let Some(log) = logs.get(&partition) else {
                continue;
            };
            let cursor = cursors.entry(partition).or_insert(0);
            while records.len() < max_records && (*cursor as usize) < log.len() {
                records.push(log[*cursor as usize].clone());
                *cursor += 1;
            }
            if records.len() >= max_records {
                break;
            }
        }
        Ok(records)
    }

    fn commit(&mut self, offsets: &HashMap<Partition, i64>) -> Result<(), ConsumerError> {
        self.state
            .commit_attempts
            .lock()
            .unwrap()
            .push(offsets.clone());

        if let Some(error) = self.state.commit_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let mut committed = self.state.committed.lock().unwrap();
        for (partition, offset) in offsets {
            let entry = committed.entry(partition.clone()).or_insert(*offset);
            if *offset > *entry {
                *entry = *offset;
            }
        }
        Ok(())
    }

    fn seek(&mut self, partition: &Partition, offset: i64) -> Result<(), ConsumerError> {
        self.state
            .seeks
            .lock()
            .unwrap()
            .push((partition.clone(), offset));
        self.state
            .cursors
            .lock()
            .unwrap()
            .insert(partition.clone(), offset);
        Ok(())
    }

    fn seek_to_beginning(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        for partition in partitions {
            self.seek(partition, 0)?;
        }
        Ok(())
    }

    fn seek_to_end(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        for partition in partitions {
            let end = self
                .state
                .logs
                .lock()
                .unwrap()
                .get(partition)
                .map(|log| log.len() as i64)
                .unwrap_or(0);
            self.seek(partition, end)?;
        }
        Ok(())
    }

    fn pause(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        self.state
            .pause_calls
            .lock()
            .unwrap()
            .push(partitions.to_vec());
        let mut paused = self.state.paused.lock().unwrap();
        for partition in partitions {
            paused.insert(partition.clone());
        }
        Ok(())
    }

    fn resume(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        self.state
            .resume_calls
            .lock()
            .unwrap()
            .push(partitions.to_vec());
        let mut paused = self.state.paused.lock().unwrap();
        for partition in partitions {
            paused.remove(partition);
        }
        Ok(())
    }

    fn assignment(&self) -> Result<Vec<Partition>, ConsumerError> {
        let mut assigned: Vec<Partition> = self
            .state
            .assigned
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assigned.sort();
        Ok(assigned)
    }

    fn position(&self, partition: &Partition) -> Result<Option<i64>, ConsumerError> {
        Ok(self.state.cursors.lock().unwrap().get(partition).copied())
    }

    fn committed(
        &self,
        partitions: &[Partition],
        _timeout: Duration,
    ) -> Result<HashMap<Partition, i64>, ConsumerError> {
        let committed = self.state.committed.lock().unwrap();
        Ok(partitions
            .iter()
            .filter_map(|p| committed.get(p).map(|o| (p.clone(), *o)))
            .collect())
    }

    fn beginning_offsets(
        &self,
        partitions: &[Partition],
        _timeout: Duration,
    ) -> Result<HashMap<Partition, i64>, ConsumerError> {
        Ok(partitions.iter().map(|p| (p.clone(), 0)).collect())
    }

    fn end_offsets(
        &self,
        partitions: &[Partition],
        _timeout: Duration,
    ) -> Result<HashMap<Partition, i64>, ConsumerError> {
        let logs = self.state.logs.lock().unwrap();
        Ok(partitions
            .iter()
            .map(|p| {
                let end = logs.get(p).map(|log| log.len() as i64).unwrap_or(0);
                (p.clone(), end)
            })
            .collect())
    }

    fn offsets_for_times(
        &self,
        timestamps: &HashMap<Partition, i64>,
        _timeout: Duration,
    ) -> Result<HashMap<Partition, Option<i64>>, ConsumerError> {
        let logs = self.state.logs.lock().unwrap();
        Ok(timestamps
            .iter()
            .map(|(partition, timestamp)| {
                let offset = logs.get(partition).and_then(|log| {
                    log.iter()
                        .find(|r| r.timestamp.unwrap_or(i64::MIN) >= *timestamp)
                        .map(|r| r.offset)
                });
                (partition.clone(), offset)
            })
            .collect())
    }

    fn list_topics(&self, _timeout: Duration) -> Result<Vec<TopicMetadata>, ConsumerError> {
        let logs = self.state.logs.lock().unwrap();
        let mut topics: HashMap<String, Vec<i32>> = HashMap::new();
        for partition in logs.keys() {
            topics
                .entry(partition.topic().to_string())
                .or_default()
                .push(partition.partition_number());
        }
        let mut out: Vec<TopicMetadata> = topics
            .into_iter()
            .map(|(name, mut ids)| {
                ids.sort_unstable();
                TopicMetadata {
                    name,
                    partitions: ids
                        .into_iter()
                        .map(|id| PartitionInfo {
                            id,
                            leader: 0,
                            replicas: vec![0],
                            isr: vec![0],
                        })
                        .collect(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn partitions_for(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<Vec<PartitionInfo>, ConsumerError> {
        Ok(self
            .list_topics(timeout)?
            .into_iter()
            .find(|t| t.name == topic)
            .map(|t| t.partitions)
            .unwrap_or_default())
    }

    fn close(&mut self, _timeout: Duration) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Shorthand for tests that need a topic-partition.
pub fn partition(topic: &str, number: i32) -> Partition {
    Partition::new(topic.to_string(), number)
}

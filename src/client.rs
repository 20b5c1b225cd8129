//! The broker client capability and its rdkafka implementation.
//!
//! The runloop owns whichever [`BrokerClient`] it is given through the
//! [`ClientGate`](crate::gate::ClientGate); nothing here is safe for
//! concurrent use. Rebalance callbacks are delivered synchronously from
//! inside [`BrokerClient::poll`], on the caller's thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientContext, Offset as RdOffset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::error::ConsumerError;
use crate::rebalance::RebalanceListener;
use crate::types::{Partition, Record};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Topic metadata returned by [`BrokerClient::list_topics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub name: String,
    pub partitions: Vec<PartitionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub id: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

/// The operations the runloop and the metadata passthroughs need from a
/// Kafka-compatible client.
///
/// Implementations are not required to be thread-safe; all access is
/// serialized through the client gate. `poll` must invoke the registered
/// [`RebalanceListener`] synchronously, before returning, for any ownership
/// changes it observes.
pub trait BrokerClient: Send + 'static {
    /// Register the listener to be driven from inside `poll`. Called once,
    /// before `subscribe`/`assign`.
    fn set_rebalance_listener(&mut self, listener: Arc<RebalanceListener>);

    fn subscribe(&mut self, topics: &[String]) -> Result<(), ConsumerError>;

    fn subscribe_pattern(&mut self, pattern: &str) -> Result<(), ConsumerError>;

    fn assign(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError>;

    fn unsubscribe(&mut self);

    /// Fetch up to `max_records` records, waiting at most `timeout` for the
    /// first one. Rebalance callbacks fire inside this call.
    fn poll(&mut self, timeout: Duration, max_records: usize)
        -> Result<Vec<Record>, ConsumerError>;

    /// Commit the given next-to-read offsets, synchronously.
    fn commit(&mut self, offsets: &HashMap<Partition, i64>) -> Result<(), ConsumerError>;

    fn seek(&mut self, partition: &Partition, offset: i64) -> Result<(), ConsumerError>;

    fn seek_to_beginning(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError>;

    fn seek_to_end(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError>;

    fn pause(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError>;

    fn resume(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError>;

    fn assignment(&self) -> Result<Vec<Partition>, ConsumerError>;

    fn position(&self, partition: &Partition) -> Result<Option<i64>, ConsumerError>;

    fn committed(
        &self,
        partitions: &[Partition],
        timeout: Duration,
    ) -> Result<HashMap<Partition, i64>, ConsumerError>;

    fn beginning_offsets(
        &self,
        partitions: &[Partition],
        timeout: Duration,
    ) -> Result<HashMap<Partition, i64>, ConsumerError>;

    fn end_offsets(
        &self,
        partitions: &[Partition],
        timeout: Duration,
    ) -> Result<HashMap<Partition, i64>, ConsumerError>;

    fn offsets_for_times(
        &self,
        timestamps: &HashMap<Partition, i64>,
        timeout: Duration,
    ) -> Result<HashMap<Partition, Option<i64>>, ConsumerError>;

    fn list_topics(&self, timeout: Duration) -> Result<Vec<TopicMetadata>, ConsumerError>;

    fn partitions_for(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<Vec<PartitionInfo>, ConsumerError>;

    /// Release broker-side resources, bounded by `timeout`.
    fn close(&mut self, timeout: Duration);
}

/// Consumer context that forwards librdkafka rebalance callbacks to the
/// registered [`RebalanceListener`]. Callbacks run on the polling thread,
/// which is the runloop's own context.
pub struct ListenerBridge {
    listener: Arc<Mutex<Option<Arc<RebalanceListener>>>>,
    consumer: Mutex<Option<std::sync::Weak<BaseConsumer<ListenerBridge>>>>,
}

impl ListenerBridge {
    fn current_listener(&self) -> Option<Arc<RebalanceListener>> {
        self.listener.lock().unwrap().clone()
    }

    fn set_consumer(&self, consumer: std::sync::Weak<BaseConsumer<ListenerBridge>>) {
        *self.consumer.lock().unwrap() = Some(consumer);
    }

    fn current_consumer(&self) -> Option<Arc<BaseConsumer<ListenerBridge>>> {
        self.consumer
            .lock()
            .unwrap()
            .as_ref()
            .and_then(std::sync::Weak::upgrade)
    }
}

impl ClientContext for ListenerBridge {}

impl ConsumerContext for ListenerBridge {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        debug!("pre-rebalance event: {:?}", rebalance);

        if let Rebalance::Revoke(tpl) = rebalance {
            let partitions: Vec<Partition> =
                tpl.elements().into_iter().map(Partition::from).collect();
            if let Some(listener) = self.current_listener() {
                listener.on_partitions_revoked(&partitions);
            }
        }
        if let Rebalance::Error(e) = rebalance {
            error!("rebalance error: {e}");
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        debug!("post-rebalance event: {:?}", rebalance);

        if let Rebalance::Assign(tpl) = rebalance {
            let partitions: Vec<Partition> =
                tpl.elements().into_iter().map(Partition::from).collect();
            if let (Some(listener), Some(base_consumer)) =
                (self.current_listener(), self.current_consumer())
            {
                let mut seek = |tp: &Partition, offset: i64| {
                    base_consumer
                        .seek(
                            tp.topic(),
                            tp.partition_number(),
                            RdOffset::Offset(offset),
                            SEEK_TIMEOUT,
                        )
                        .map_err(ConsumerError::from)
                };
                listener.on_partitions_assigned(&mut seek, &partitions);
            }
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(_) => debug!("committed offsets for {} partitions", offsets.count()),
            Err(e) => warn!("commit callback reported failure: {e}"),
        }
    }
}

/// Production [`BrokerClient`] over an rdkafka [`BaseConsumer`].
pub struct RdKafkaBrokerClient {
    consumer: Arc<BaseConsumer<ListenerBridge>>,
    listener: Arc<Mutex<Option<Arc<RebalanceListener>>>>,
}

impl RdKafkaBrokerClient {
    pub fn from_config(config: &ClientConfig) -> Result<Self, ConsumerError> {
        let listener = Arc::new(Mutex::new(None));
        let bridge = ListenerBridge {
            listener: listener.clone(),
            consumer: Mutex::new(None),
        };
        let consumer: Arc<BaseConsumer<ListenerBridge>> =
            Arc::new(config.create_with_context(bridge)?);
        consumer.context().set_consumer(Arc::downgrade(&consumer));
        Ok(Self { consumer, listener })
    }

    fn poll_one(&self, timeout: Duration) -> Option<Result<Record, ConsumerError>> {
        match self.consumer.poll(timeout) {
            None => None,
            Some(Ok(message)) => Some(Ok(record_from_message(&message))),
            // End of partition is a position, not a failure.
            Some(Err(KafkaError::PartitionEOF(partition))) => {
                debug!("reached end of partition {partition}");
                None
            }
            Some(Err(e)) => Some(Err(e.into())),
        }
    }
}

impl BrokerClient for RdKafkaBrokerClient {
    fn set_rebalance_listener(&mut self, listener: Arc<RebalanceListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn subscribe(&mut self, topics: &[String]) -> Result<(), ConsumerError> {
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&refs)?;
        Ok(())
    }

    fn subscribe_pattern(&mut self, pattern: &str) -> Result<(), ConsumerError> {
        // librdkafka treats topics starting with '^' as regex subscriptions.
        let pattern = if pattern.starts_with('^') {
            pattern.to_string()
        } else {
            format!("^{pattern}")
        };
        self.consumer.subscribe(&[pattern.as_str()])?;
        Ok(())
    }

    fn assign(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        let mut tpl = TopicPartitionList::new();
        for partition in partitions {
            tpl.add_partition(partition.topic(), partition.partition_number());
        }
        self.consumer.assign(&tpl)?;
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.consumer.unsubscribe();
    }

    fn poll(
        &mut self,
        timeout: Duration,
        max_records: usize,
    ) -> Result<Vec<Record>, ConsumerError> {
        let mut records = Vec::new();

        // One bounded wait for the first record, then drain whatever
        // librdkafka already fetched without blocking again.
        match self.poll_one(timeout) {
            None => return Ok(records),
            Some(record) => records.push(record?),
        }
        while records.len() < max_records {
            match self.poll_one(Duration::ZERO) {
                None => break,
                Some(record) => records.push(record?),
            }
        }
        Ok(records)
    }

    fn commit(&mut self, offsets: &HashMap<Partition, i64>) -> Result<(), ConsumerError> {
        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in offsets {
            tpl.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                RdOffset::Offset(*offset),
            )?;
        }
        self.consumer.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }

    fn seek(&mut self, partition: &Partition, offset: i64) -> Result<(), ConsumerError> {
        self.consumer.seek(
            partition.topic(),
            partition.partition_number(),
            RdOffset::Offset(offset),
            SEEK_TIMEOUT,
        )?;
        Ok(())
    }

    fn seek_to_beginning(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        for partition in partitions {
            self.consumer.seek(
                partition.topic(),
                partition.partition_number(),
                RdOffset::Beginning,
                SEEK_TIMEOUT,
            )?;
        }
        Ok(())
    }

    fn seek_to_end(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        for partition in partitions {
            self.consumer.seek(
                partition.topic(),
                partition.partition_number(),
                RdOffset::End,
                SEEK_TIMEOUT,
            )?;
        }
        Ok(())
    }

    fn pause(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        self.consumer.pause(&partition_list(partitions))?;
        Ok(())
    }

    fn resume(&mut self, partitions: &[Partition]) -> Result<(), ConsumerError> {
        self.consumer.resume(&partition_list(partitions))?;
        Ok(())
    }

    fn assignment(&self) -> Result<Vec<Partition>, ConsumerError> {
        let tpl = self.consumer.assignment()?;
        Ok(tpl.elements().into_iter().map(Partition::from).collect())
    }

    fn position(&self, partition: &Partition) -> Result<Option<i64>, ConsumerError> {
        let positions = self.consumer.position()?;
        for elem in positions.elements() {
            if elem.topic() == partition.topic() && elem.partition() == partition.partition_number()
            {
                if let RdOffset::Offset(offset) = elem.offset() {
                    return Ok(Some(offset));
                }
            }
        }
        Ok(None)
    }

    fn committed(
        &self,
        partitions: &[Partition],
        timeout: Duration,
    ) -> Result<HashMap<Partition, i64>, ConsumerError> {
        let committed = self
            .consumer
            .committed_offsets(partition_list(partitions), timeout)?;
        let mut out = HashMap::new();
        for elem in committed.elements() {
            if let RdOffset::Offset(offset) = elem.offset() {
                out.insert(Partition::from(elem), offset);
            }
        }
        Ok(out)
    }

    fn beginning_offsets(
        &self,
        partitions: &[Partition],
        timeout: Duration,
    ) -> Result<HashMap<Partition, i64>, ConsumerError> {
        let mut out = HashMap::new();
        for partition in partitions {
            let (low, _high) = self.consumer.fetch_watermarks(
                partition.topic(),
                partition.partition_number(),
                timeout,
            )?;
            out.insert(partition.clone(), low);
        }
        Ok(out)
    }

    fn end_offsets(
        &self,
        partitions: &[Partition],
        timeout: Duration,
    ) -> Result<HashMap<Partition, i64>, ConsumerError> {
        let mut out = HashMap::new();
        for partition in partitions {
            let (_low, high) = self.consumer.fetch_watermarks(
                partition.topic(),
                partition.partition_number(),
                timeout,
            )?;
            out.insert(partition.clone(), high);
        }
        Ok(out)
    }

    fn offsets_for_times(
        &self,
        timestamps: &HashMap<Partition, i64>,
        timeout: Duration,
    ) -> Result<HashMap<Partition, Option<i64>>, ConsumerError> {
        let mut tpl = TopicPartitionList::new();
        for (partition, timestamp) in timestamps {
            tpl.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                RdOffset::Offset(*timestamp),
            )?;
        }
        let resolved = self.consumer.offsets_for_times(tpl, timeout)?;
        let mut out = HashMap::new();
        for elem in resolved.elements() {
            let offset = match elem.offset() {
                RdOffset::Offset(offset) => Some(offset),
                _ => None,
            };
            out.insert(Partition::from(elem), offset);
        }
        Ok(out)
    }

    fn list_topics(&self, timeout: Duration) -> Result<Vec<TopicMetadata>, ConsumerError> {
        let metadata = self.consumer.fetch_metadata(None, timeout)?;
        Ok(metadata.topics().iter().map(topic_metadata).collect())
    }

    fn partitions_for(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<Vec<PartitionInfo>, ConsumerError> {
        let metadata = self.consumer.fetch_metadata(Some(topic), timeout)?;
        Ok(metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .map(topic_metadata)
            .map(|t| t.partitions)
            .unwrap_or_default())
    }

    fn close(&mut self, _timeout: Duration) {
        info!("releasing kafka consumer");
        // BaseConsumer tears the client down on drop; nothing else to do.
    }
}

fn partition_list(partitions: &[Partition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for partition in partitions {
        tpl.add_partition(partition.topic(), partition.partition_number());
    }
    tpl
}

fn topic_metadata(topic: &rdkafka::metadata::MetadataTopic) -> TopicMetadata {
    TopicMetadata {
        name: topic.name().to_string(),
        partitions: topic
            .partitions()
            .iter()
            .map(|p| PartitionInfo {
                id: p.id(),
                leader: p.leader(),
                replicas: p.replicas().to_vec(),
                isr: p.isr().to_vec(),
            })
            .collect(),
    }
}

fn record_from_message(message: &BorrowedMessage<'_>) -> Record {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| (h.key.to_string(), h.value.map(|v| v.to_vec())))
                .collect()
        })
        .unwrap_or_default();

    Record {
        partition: Partition::new(message.topic().to_string(), message.partition()),
        offset: message.offset(),
        timestamp: message.timestamp().to_millis(),
        headers,
        key: message.key().map(|k| k.to_vec()),
        payload: message.payload().map(|p| p.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation_does_not_require_a_broker() {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", "localhost:9092")
            .set("group.id", "test-group")
            .set("enable.auto.commit", "false");

        assert!(RdKafkaBrokerClient::from_config(&config).is_ok());
    }
}

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::topic_partition_list::TopicPartitionListElem;

use crate::error::ConsumerError;
use crate::offset_batch::{CommitSink, OffsetBatch, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

/// A raw record as returned by the broker client, before deserialization.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub partition: Partition,
    pub offset: i64,
    /// Broker timestamp in epoch milliseconds, when available.
    pub timestamp: Option<i64>,
    pub headers: Vec<(String, Option<Vec<u8>>)>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

/// Commit handle for a single consumed record.
///
/// The stored offset is the *next-to-read* position (`record offset + 1`),
/// matching the broker's commit convention: committing it marks this record
/// and everything before it on the partition as processed.
#[derive(Clone)]
pub struct Offset {
    pub(crate) partition: Partition,
    pub(crate) next_offset: i64,
    pub(crate) sink: CommitSink,
}

impl Offset {
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// The next-to-read position after the record this handle was taken from.
    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    /// Commit this single offset. Succeeds only once the broker acknowledged.
    pub async fn commit(&self) -> Result<(), ConsumerError> {
        let mut offsets = HashMap::new();
        offsets.insert(self.partition.clone(), self.next_offset);
        self.sink.submit(offsets).await
    }

    /// Commit with retries for transient broker failures per `policy`.
    pub async fn commit_with_retry(&self, policy: &RetryPolicy) -> Result<(), ConsumerError> {
        self.to_batch().commit_with_retry(policy).await
    }

    /// A single-entry batch, for folding into a larger [`OffsetBatch`].
    pub fn to_batch(&self) -> OffsetBatch {
        let mut batch = OffsetBatch::empty();
        batch.add(self);
        batch
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Offset")
            .field("partition", &self.partition)
            .field("next_offset", &self.next_offset)
            .finish()
    }
}

/// A deserialized record together with its commit handle.
pub struct CommittableRecord<K, V> {
    /// Deserialized key; `None` when the record carried no key.
    pub key: Option<K>,
    pub value: V,
    pub timestamp: Option<i64>,
    pub headers: Vec<(String, Option<Vec<u8>>)>,
    pub offset: Offset,
}

impl<K, V> CommittableRecord<K, V> {
    pub fn partition(&self) -> &Partition {
        self.offset.partition()
    }

    /// The broker offset of this record (one less than the commit offset).
    pub fn record_offset(&self) -> i64 {
        self.offset.next_offset - 1
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for CommittableRecord<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommittableRecord")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("offset", &self.offset)
            .finish()
    }
}

/// What the consumer should listen to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// Group-managed subscription to a fixed set of topics.
    Topics(Vec<String>),
    /// Group-managed subscription to every topic matching the regex.
    Pattern(String),
    /// Direct assignment, bypassing the group protocol.
    Manual(Vec<Partition>),
}

impl Subscription {
    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Subscription::Topics(topics.into_iter().map(Into::into).collect())
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Subscription::Pattern(pattern.into())
    }

    pub fn manual<I>(partitions: I) -> Self
    where
        I: IntoIterator<Item = Partition>,
    {
        Subscription::Manual(partitions.into_iter().collect())
    }
}

/// Where consumption starts when the broker has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoOffsetReset {
    Earliest,
    #[default]
    Latest,
    /// Fail instead of resetting.
    None,
}

impl AutoOffsetReset {
    pub(crate) fn as_config_value(&self) -> &'static str {
        match self {
            AutoOffsetReset::Earliest => "earliest",
            AutoOffsetReset::Latest => "latest",
            AutoOffsetReset::None => "none",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ConsumerError> {
        match value {
            "earliest" => Ok(AutoOffsetReset::Earliest),
            "latest" => Ok(AutoOffsetReset::Latest),
            "none" => Ok(AutoOffsetReset::None),
            other => Err(ConsumerError::Config(format!(
                "unknown auto offset reset policy: {other}"
            ))),
        }
    }
}

/// User-supplied starting-offset lookup for manual offset retrieval.
///
/// Called with every newly owned partition; partitions missing from the
/// returned map keep their broker-side position.
#[async_trait]
pub trait ManualOffsetResolver: Send + Sync {
    async fn resolve(
        &self,
        partitions: Vec<Partition>,
    ) -> Result<HashMap<Partition, i64>, ConsumerError>;
}

/// How starting offsets are determined for newly owned partitions.
#[derive(Clone)]
pub enum OffsetRetrieval {
    /// Let the broker resolve positions, resetting per the given policy.
    Auto(AutoOffsetReset),
    /// Ask the resolver and seek to whatever it returns.
    Manual(Arc<dyn ManualOffsetResolver>),
}

impl Default for OffsetRetrieval {
    fn default() -> Self {
        OffsetRetrieval::Auto(AutoOffsetReset::default())
    }
}

impl fmt::Debug for OffsetRetrieval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetRetrieval::Auto(reset) => f.debug_tuple("Auto").field(reset).finish(),
            OffsetRetrieval::Manual(_) => f.write_str("Manual(..)"),
        }
    }
}

// ==== Runloop metrics ====
/// Counter for records returned by broker polls
pub const CONSUMER_POLLED_RECORDS: &str = "kafka_consumer_polled_records_total";

/// Counter for chunks pushed into partition queues
pub const CONSUMER_DISPATCHED_CHUNKS: &str = "kafka_consumer_dispatched_chunks_total";

/// Counter for records dropped because no partition queue existed
pub const CONSUMER_DROPPED_RECORDS: &str = "kafka_consumer_dropped_records_total";

/// Gauge for the number of partitions currently paused for backpressure
pub const CONSUMER_PAUSED_PARTITIONS: &str = "kafka_consumer_paused_partitions";

// ==== Commit metrics ====
/// Counter for merged commit batches sent to the broker
pub const CONSUMER_COMMIT_BATCHES: &str = "kafka_consumer_commit_batches_total";

/// Counter for commit batches that failed, labelled by class (retriable/fatal)
pub const CONSUMER_COMMIT_FAILURES: &str = "kafka_consumer_commit_failures_total";

// ==== Rebalance metrics ====
/// Counter for partitions assigned to this consumer
pub const CONSUMER_PARTITIONS_ASSIGNED: &str = "kafka_consumer_partitions_assigned_total";

/// Counter for partitions cleanly revoked from this consumer
pub const CONSUMER_PARTITIONS_REVOKED: &str = "kafka_consumer_partitions_revoked_total";

/// Counter for partitions lost without a clean revocation
pub const CONSUMER_PARTITIONS_LOST: &str = "kafka_consumer_partitions_lost_total";

// ==== Partition queue metrics ====
/// Gauge for the chunk backlog of a partition queue
pub const PARTITION_QUEUE_BACKLOG: &str = "kafka_consumer_partition_queue_backlog";

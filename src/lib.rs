//! Streaming consumer façade over a Kafka-compatible broker.
//!
//! One long-lived runloop task owns the (not thread-safe) broker client and
//! multiplexes it between polling, user commit requests, and rebalance
//! callbacks, fanning records out into bounded per-partition streams with
//! chunk-level backpressure and graceful shutdown. Delivery is at-least-once:
//! every committed offset has been processed, replays are possible.
//!
//! ```no_run
//! use futures::StreamExt;
//! use kafka_partition_streams::{
//!     ConsumerSettings, StreamingConsumer, StringDeserializer, Subscription,
//! };
//!
//! # async fn demo() -> Result<(), kafka_partition_streams::ConsumerError> {
//! let consumer = StreamingConsumer::connect(ConsumerSettings::new(
//!     "localhost:9092",
//!     "my-group",
//! ))?;
//! consumer.subscribe(Subscription::topics(["events"])).await?;
//!
//! let mut partitions = consumer.partitioned_stream(StringDeserializer, StringDeserializer)?;
//! while let Some((partition, mut records)) = partitions.next().await {
//!     tokio::spawn(async move {
//!         while let Some(Ok(chunk)) = records.next().await {
//!             for record in chunk {
//!                 println!("{partition}: {}", record.value);
//!                 let _ = record.offset.commit().await;
//!             }
//!         }
//!     });
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod consumer;
pub mod deser;
pub mod diagnostics;
pub mod error;
pub mod gate;
pub mod metrics_consts;
pub mod offset_batch;
pub mod rebalance;
pub mod runloop;
pub mod testing;
pub mod types;

mod partition_queue;
mod registry;

// Public API - the types most users need, re-exported at the crate root.
pub use client::{BrokerClient, PartitionInfo, RdKafkaBrokerClient, TopicMetadata};
pub use config::{ConsumerSettings, ConsumerSettingsFromEnv};
pub use consumer::{PartitionRecordStream, PartitionedStream, StreamingConsumer};
pub use deser::{
    BytesDeserializer, Deserializer, JsonDeserializer, OptionalDeserializer, StringDeserializer,
};
pub use diagnostics::{DiagnosticEvent, Diagnostics};
pub use error::ConsumerError;
pub use offset_batch::{OffsetBatch, RetryPolicy};
pub use runloop::RunloopPhase;
pub use types::{
    AutoOffsetReset, CommittableRecord, ManualOffsetResolver, Offset, OffsetRetrieval, Partition,
    Record, Subscription,
};

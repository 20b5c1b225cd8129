use rdkafka::error::{KafkaError, RDKafkaErrorCode};

use crate::types::Partition;

/// Error type for all consumer operations.
///
/// Only [`ConsumerError::is_retriable`] errors participate in commit retry;
/// everything else surfaces to the caller unchanged.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConsumerError {
    /// Error reported by the underlying Kafka client.
    #[error("kafka client error: {0}")]
    Kafka(#[from] KafkaError),

    /// Error reported by a non-rdkafka broker client implementation.
    #[error("broker error: {message}")]
    Broker { message: String, retriable: bool },

    /// A record could not be deserialized.
    #[error("failed to deserialize {what} for topic {topic}: {reason}")]
    Deserialization {
        topic: String,
        what: &'static str,
        reason: String,
    },

    /// The manual offset resolver failed for the given partitions.
    #[error("manual offset resolver failed: {0}")]
    OffsetResolver(String),

    /// Partition ownership was lost without a clean revocation.
    #[error("partitions lost: {0:?}")]
    PartitionsLost(Vec<Partition>),

    /// The record effect passed to `process_and_commit` failed.
    #[error("record effect failed: {0}")]
    Effect(String),

    /// The consumer is stopping or has stopped; the operation was not performed.
    #[error("consumer is shutting down")]
    ShuttingDown,

    /// The partitioned stream can only be taken once per consumer.
    #[error("the partitioned stream was already taken")]
    StreamAlreadyTaken,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ConsumerError {
    /// Whether the error is worth retrying.
    ///
    /// Mirrors the broker-side triage: group coordination churn and transport
    /// hiccups are transient, everything else is terminal for the attempt.
    pub fn is_retriable(&self) -> bool {
        match self {
            ConsumerError::Kafka(e) => kafka_error_is_retriable(e),
            ConsumerError::Broker { retriable, .. } => *retriable,
            _ => false,
        }
    }
}

fn kafka_error_is_retriable(error: &KafkaError) -> bool {
    let code = match error {
        KafkaError::ConsumerCommit(code) => *code,
        KafkaError::MessageConsumption(code) => *code,
        KafkaError::MetadataFetch(code) => *code,
        KafkaError::Global(code) => *code,
        KafkaError::OffsetFetch(code) => *code,
        _ => return false,
    };

    matches!(
        code,
        RDKafkaErrorCode::RebalanceInProgress
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::NotCoordinator
            | RDKafkaErrorCode::CoordinatorLoadInProgress
            | RDKafkaErrorCode::CoordinatorNotAvailable
    )
}

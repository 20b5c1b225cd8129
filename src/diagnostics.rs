use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::metrics_consts::{
    CONSUMER_PARTITIONS_ASSIGNED, CONSUMER_PARTITIONS_LOST, CONSUMER_PARTITIONS_REVOKED,
    CONSUMER_POLLED_RECORDS,
};
use crate::types::Partition;

/// State transitions the runloop reports as they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    /// A broker poll completed, returning this many records.
    Poll { records: usize },
    /// A merged commit batch was acknowledged by the broker.
    Commit { offsets: HashMap<Partition, i64> },
    /// Partitions were assigned to this consumer.
    Assigned(Vec<Partition>),
    /// Partitions were cleanly revoked.
    Revoked(Vec<Partition>),
    /// Partitions were lost without a clean revocation.
    Lost(Vec<Partition>),
    /// Records arrived for a partition with no registered queue and were dropped.
    RecordsDropped { partition: Partition, count: usize },
}

/// Fire-and-forget event emitter. A full or closed subscriber never affects
/// the runloop; metrics are recorded regardless of whether anyone listens.
#[derive(Clone, Default)]
pub struct Diagnostics {
    tx: Option<mpsc::UnboundedSender<DiagnosticEvent>>,
}

impl Diagnostics {
    /// A sink that only records metrics.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// A sink with a subscriber end, for tests and operational tooling.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DiagnosticEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: DiagnosticEvent) {
        match &event {
            DiagnosticEvent::Poll { records } => {
                metrics::counter!(CONSUMER_POLLED_RECORDS).increment(*records as u64);
            }
            DiagnosticEvent::Assigned(partitions) => {
                metrics::counter!(CONSUMER_PARTITIONS_ASSIGNED)
                    .increment(partitions.len() as u64);
            }
            DiagnosticEvent::Revoked(partitions) => {
                metrics::counter!(CONSUMER_PARTITIONS_REVOKED)
                    .increment(partitions.len() as u64);
            }
            DiagnosticEvent::Lost(partitions) => {
                metrics::counter!(CONSUMER_PARTITIONS_LOST).increment(partitions.len() as u64);
            }
            _ => {}
        }

        if let Some(tx) = &self.tx {
            // Subscriber gone is fine, the sink stays fire-and-forget.
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers_events() {
        let (diagnostics, mut rx) = Diagnostics::channel();
        diagnostics.emit(DiagnosticEvent::Poll { records: 3 });

        assert_eq!(rx.recv().await, Some(DiagnosticEvent::Poll { records: 3 }));
    }

    #[test]
    fn test_emit_survives_dropped_subscriber() {
        let (diagnostics, rx) = Diagnostics::channel();
        drop(rx);
        diagnostics.emit(DiagnosticEvent::Assigned(vec![Partition::new(
            "events".to_string(),
            0,
        )]));
    }

    #[test]
    fn test_disabled_sink_is_a_no_op() {
        Diagnostics::disabled().emit(DiagnosticEvent::Poll { records: 1 });
    }
}

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::kafka::types::TopicPartition;

/// Errors raised while building or reading envelopes
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("failed to serialize envelope: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("message {message_id} has no reply-to topic")]
    MissingReplyTo { message_id: uuid::Uuid },
}

/// Errors surfaced by a transport implementation
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("partition {0} is not owned by this consumer")]
    NotOwner(TopicPartition),

    #[error("unknown topic {0}")]
    UnknownTopic(String),

    #[error("transport is closed")]
    Closed,

    #[error("fatal transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether the client is unusable and the poll loop must stop.
    ///
    /// Anything else is local to a partition or transient and is retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransportError::Kafka(e) => match e {
                KafkaError::MessageConsumptionFatal(_) | KafkaError::Canceled => true,
                KafkaError::Global(code) => *code == RDKafkaErrorCode::Authentication,
                KafkaError::ClientCreation(_) | KafkaError::ClientConfig(..) => true,
                _ => false,
            },
            TransportError::Closed | TransportError::Fatal(_) => true,
            TransportError::NotOwner(_) | TransportError::UnknownTopic(_) => false,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Kafka(KafkaError::MessageConsumption(_)) => "consumption",
            TransportError::Kafka(KafkaError::Global(_)) => "global",
            TransportError::Kafka(KafkaError::ConsumerCommit(_)) => "commit",
            TransportError::Kafka(_) => "kafka",
            TransportError::NotOwner(_) => "not_owner",
            TransportError::UnknownTopic(_) => "unknown_topic",
            TransportError::Closed => "closed",
            TransportError::Fatal(_) => "fatal",
        }
    }
}

/// Raised by the cancellable backoff wait when it is cut short
#[derive(Error, Debug, PartialEq, Eq)]
#[error("wait was interrupted")]
pub struct Interrupted;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("processor for {0} has shut down")]
    ProcessorClosed(TopicPartition),

    #[error("consumer loop task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let fatal = TransportError::Kafka(KafkaError::MessageConsumptionFatal(
            RDKafkaErrorCode::Fail,
        ));
        assert!(fatal.is_fatal());

        let auth = TransportError::Kafka(KafkaError::Global(RDKafkaErrorCode::Authentication));
        assert!(auth.is_fatal());

        let brokers_down =
            TransportError::Kafka(KafkaError::Global(RDKafkaErrorCode::AllBrokersDown));
        assert!(!brokers_down.is_fatal());
        assert_eq!(brokers_down.kind(), "global");

        let not_owner = TransportError::NotOwner(TopicPartition::new("events", 0));
        assert!(!not_owner.is_fatal());
        assert!(TransportError::Closed.is_fatal());
    }
}

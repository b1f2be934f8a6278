use std::sync::Arc;
use std::time::Duration;

use common_kafka::config::KafkaConfig;
use common_kafka::kafka_producer::create_kafka_producer;
use tracing::{debug, warn};

use crate::envelope::{Message, Payload, Topic, TraceContext};
use crate::error::{PipelineError, TransportError};
use crate::kafka::rdkafka_transport::KafkaProducerTransport;
use crate::kafka::transport::ProducerTransport;
use crate::kafka::types::{DeliveryReport, OutboundRecord};
use crate::metrics_consts::MESSAGES_PRODUCED;
use crate::partitioner::{DefaultPartitioner, Partitioner};

/// Sends envelopes to their topic, choosing the partition client side so that
/// keyed messages land on the partition every other producer picks for the key.
#[derive(Clone)]
pub struct Producer {
    transport: Arc<dyn ProducerTransport>,
    partitioner: Arc<dyn Partitioner>,
}

impl Producer {
    pub fn new(transport: Arc<dyn ProducerTransport>) -> Self {
        Self {
            transport,
            partitioner: Arc::new(DefaultPartitioner::new()),
        }
    }

    /// Connect an rdkafka producer, failing if the brokers cannot be reached
    pub fn from_config(config: &KafkaConfig) -> Result<Self, PipelineError> {
        let producer = create_kafka_producer(config).map_err(TransportError::from)?;
        let transport = KafkaProducerTransport::new(
            producer,
            config.metadata_timeout(),
            Duration::from_millis(u64::from(config.kafka_message_timeout_ms)),
        );
        Ok(Self::new(Arc::new(transport)))
    }

    pub fn with_partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// Send an envelope and wait for the broker to acknowledge it
    pub async fn send(&self, message: &Message) -> Result<DeliveryReport, PipelineError> {
        let topic = message.topic.name();
        let payload = message.to_bytes()?;

        let partition_count = self.transport.partition_count(topic).inspect_err(|e| {
            metrics::counter!(MESSAGES_PRODUCED, "status" => "no_metadata").increment(1);
            warn!(topic = topic, error = ?e, "Failed to resolve partition count");
        })?;

        let partition =
            self.partitioner
                .partition(topic, message.key_bytes(), &payload, partition_count);

        let record = OutboundRecord {
            topic: topic.to_string(),
            partition,
            key: message.key_bytes().map(<[u8]>::to_vec),
            payload,
        };

        match self.transport.send(record).await {
            Ok(report) => {
                metrics::counter!(MESSAGES_PRODUCED, "status" => "success").increment(1);
                debug!(
                    message_id = %message.id,
                    topic = topic,
                    partition = report.partition,
                    offset = report.offset,
                    "Message delivered"
                );
                Ok(report)
            }
            Err(e) => {
                metrics::counter!(MESSAGES_PRODUCED, "status" => "failure").increment(1);
                warn!(
                    message_id = %message.id,
                    topic = topic,
                    partition = partition,
                    error = ?e,
                    "Message delivery failed"
                );
                Err(e.into())
            }
        }
    }

    /// Wrap `payload` in a new envelope and send it
    pub async fn send_payload<P: Payload>(
        &self,
        topic: &Topic,
        key: Option<String>,
        payload: &P,
        context: TraceContext,
    ) -> Result<(Message, DeliveryReport), PipelineError> {
        let message = Message::new(topic.clone(), key, payload, context)?;
        let report = self.send(&message).await?;
        Ok((message, report))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::envelope::request_for;
    use crate::kafka::test_utils::MockProducerTransport;
    use crate::partitioner::murmur2;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        sequence: u32,
    }

    impl Payload for Ping {
        const NAME: &'static str = "ping";
    }

    fn producer() -> (Producer, Arc<MockProducerTransport>) {
        let transport = Arc::new(MockProducerTransport::new().with_topic("events", 5));
        (Producer::new(transport.clone()), transport)
    }

    #[tokio::test]
    async fn test_keyed_messages_use_murmur2() {
        let (producer, transport) = producer();
        let topic = Topic::new("events");
        let key = "311dd383-5430-412d-acd6-8b2c9ba3c226";

        for sequence in 0..3 {
            let (_, report) = producer
                .send_payload(
                    &topic,
                    Some(key.to_string()),
                    &Ping { sequence },
                    TraceContext::default(),
                )
                .await
                .expect("send failed");
            assert_eq!(report.partition, 0);
            assert_eq!(report.offset, i64::from(sequence));
        }

        let expected = i32::try_from((murmur2(key.as_bytes()) & 0x7fff_ffff) % 5).unwrap();
        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|record| record.partition == expected));
        assert_eq!(sent[0].key.as_deref(), Some(key.as_bytes()));
    }

    #[tokio::test]
    async fn test_keyless_messages_round_robin() {
        let (producer, _) = producer();
        let topic = Topic::new("events");

        let mut partitions = Vec::new();
        for sequence in 0..7 {
            let (_, report) = producer
                .send_payload(&topic, None, &Ping { sequence }, TraceContext::default())
                .await
                .expect("send failed");
            partitions.push(report.partition);
        }

        assert_eq!(partitions, vec![0, 1, 2, 3, 4, 0, 1]);
    }

    #[tokio::test]
    async fn test_sends_the_serialized_envelope() {
        let (producer, transport) = producer();
        let request = request_for(
            &Topic::new("events"),
            &Topic::new("replies"),
            Some("user-1".to_string()),
            &Ping { sequence: 9 },
            TraceContext::new_trace(),
        )
        .unwrap();

        producer.send(&request).await.expect("send failed");

        let sent = transport.sent();
        let decoded = Message::from_bytes(&sent[0].payload).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.payload_as::<Ping>().unwrap(), Ping { sequence: 9 });
    }

    #[tokio::test]
    async fn test_delivery_failures_are_surfaced() {
        let (producer, transport) = producer();
        transport.set_fail_sends(true);

        let result = producer
            .send_payload(
                &Topic::new("events"),
                None,
                &Ping { sequence: 1 },
                TraceContext::default(),
            )
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::Transport(TransportError::Fatal(_)))
        ));
    }

    #[tokio::test]
    async fn test_unknown_topic_is_surfaced() {
        let (producer, transport) = producer();

        let result = producer
            .send_payload(
                &Topic::new("missing"),
                None,
                &Ping { sequence: 1 },
                TraceContext::default(),
            )
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::Transport(TransportError::UnknownTopic(topic))) if topic == "missing"
        ));
        assert!(transport.sent().is_empty());
    }
}

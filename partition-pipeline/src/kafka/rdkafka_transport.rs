use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, ClientContext, Message, Offset, TopicPartitionList};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::kafka::transport::{ConsumerTransport, ProducerTransport, RebalanceListener};
use crate::kafka::types::{
    DeliveryReport, OffsetAndMetadata, OutboundRecord, PartitionAssignment, RawRecord,
    TopicPartition,
};
use crate::metrics_consts::REBALANCE_PARTITIONS;

const COMMITTED_OFFSETS_TIMEOUT: Duration = Duration::from_secs(10);

/// Forwards librdkafka rebalance callbacks to a [`RebalanceListener`]
pub struct PipelineConsumerContext {
    listener: Arc<dyn RebalanceListener>,
}

impl PipelineConsumerContext {
    pub fn new(listener: Arc<dyn RebalanceListener>) -> Self {
        Self { listener }
    }
}

impl ClientContext for PipelineConsumerContext {}

impl ConsumerContext for PipelineConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // cooperative-sticky sends empty revocations on every group change
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    return;
                }

                let partitions: Vec<TopicPartition> = partitions
                    .elements()
                    .into_iter()
                    .map(TopicPartition::from)
                    .collect();

                info!(count = partitions.len(), "Revoking partitions");
                metrics::counter!(REBALANCE_PARTITIONS, "event_type" => "revoke")
                    .increment(partitions.len() as u64);

                self.listener.partitions_revoked(&partitions);
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        let Rebalance::Assign(partitions) = rebalance else {
            return;
        };

        if partitions.count() == 0 {
            debug!("Skipping empty assign rebalance");
            return;
        }

        // Seed from the group's committed offsets, falling back to "unknown" positions
        let positions = match base_consumer
            .committed_offsets((*partitions).clone(), COMMITTED_OFFSETS_TIMEOUT)
        {
            Ok(positions) => positions,
            Err(e) => {
                warn!("Failed to fetch committed offsets for assignment: {:?}", e);
                (*partitions).clone()
            }
        };

        let assignments: Vec<PartitionAssignment> = positions
            .elements()
            .into_iter()
            .map(|elem| {
                let position = offset_value(elem.offset());
                PartitionAssignment::new(TopicPartition::from(elem), position)
            })
            .collect();

        info!(count = assignments.len(), "Assigned partitions");
        metrics::counter!(REBALANCE_PARTITIONS, "event_type" => "assign")
            .increment(assignments.len() as u64);

        self.listener.partitions_assigned(&assignments);
    }
}

fn offset_value(offset: Offset) -> Option<i64> {
    match offset {
        Offset::Offset(value) => Some(value),
        _ => None,
    }
}

fn to_partition_list(partitions: &[TopicPartition]) -> TopicPartitionList {
    let mut list = TopicPartitionList::new();
    for partition in partitions {
        list.add_partition(partition.topic(), partition.partition_number());
    }
    list
}

fn to_raw_record(message: &BorrowedMessage<'_>) -> RawRecord {
    RawRecord::new(
        message.topic(),
        message.partition(),
        message.offset(),
        message.key().map(<[u8]>::to_vec),
        message.payload().map(<[u8]>::to_vec),
    )
}

/// Group consumer backed by an rdkafka `StreamConsumer`
pub struct KafkaConsumerTransport {
    consumer: StreamConsumer<PipelineConsumerContext>,
}

impl KafkaConsumerTransport {
    pub fn new(
        client_config: &ClientConfig,
        topics: &[&str],
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<Self, TransportError> {
        let consumer: StreamConsumer<PipelineConsumerContext> =
            client_config.create_with_context(PipelineConsumerContext::new(listener))?;
        consumer.subscribe(topics)?;

        info!(topics = ?topics, "Subscribed to topics");

        Ok(Self { consumer })
    }
}

#[async_trait]
impl ConsumerTransport for KafkaConsumerTransport {
    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawRecord>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut records = Vec::new();

        while records.len() < max_records {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(message)) => records.push(to_raw_record(&message)),
                // Records already received have moved the fetch position, so they must be
                // handed out even though the poll ended in an error
                Ok(Err(e)) if !records.is_empty() => {
                    warn!("Kafka error after {} records: {:?}", records.len(), e);
                    break;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }

        Ok(records)
    }

    fn commit_sync(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<(), TransportError> {
        let mut list = TopicPartitionList::new();
        for (partition, offset) in offsets {
            list.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(offset.offset),
            )?;
        }

        self.consumer
            .commit(&list, rdkafka::consumer::CommitMode::Sync)?;
        Ok(())
    }

    fn position(&self, partition: &TopicPartition) -> Result<Option<i64>, TransportError> {
        let positions = self.consumer.position()?;
        let elem = positions
            .find_partition(partition.topic(), partition.partition_number())
            .ok_or_else(|| TransportError::NotOwner(partition.clone()))?;
        Ok(offset_value(elem.offset()))
    }

    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), TransportError> {
        self.consumer.pause(&to_partition_list(partitions))?;
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), TransportError> {
        self.consumer.resume(&to_partition_list(partitions))?;
        Ok(())
    }
}

/// Producer backed by an rdkafka `FutureProducer`.
///
/// Partition counts come from topic metadata and are cached for the lifetime of the producer.
pub struct KafkaProducerTransport {
    producer: FutureProducer,
    partition_counts: DashMap<String, i32>,
    metadata_timeout: Duration,
    send_timeout: Duration,
}

impl KafkaProducerTransport {
    pub fn new(producer: FutureProducer, metadata_timeout: Duration, send_timeout: Duration) -> Self {
        Self {
            producer,
            partition_counts: DashMap::new(),
            metadata_timeout,
            send_timeout,
        }
    }
}

#[async_trait]
impl ProducerTransport for KafkaProducerTransport {
    fn partition_count(&self, topic: &str) -> Result<i32, TransportError> {
        if let Some(count) = self.partition_counts.get(topic) {
            return Ok(*count);
        }

        let metadata = self
            .producer
            .client()
            .fetch_metadata(Some(topic), self.metadata_timeout)?;

        let count = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .map(|t| t.partitions().len())
            .unwrap_or(0);

        if count == 0 {
            return Err(TransportError::UnknownTopic(topic.to_string()));
        }

        let count = i32::try_from(count)
            .map_err(|_| TransportError::Fatal(format!("topic {topic} has too many partitions")))?;
        self.partition_counts.insert(topic.to_string(), count);
        Ok(count)
    }

    async fn send(&self, record: OutboundRecord) -> Result<DeliveryReport, TransportError> {
        let mut future_record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&record.topic)
            .partition(record.partition)
            .payload(record.payload.as_slice());

        if let Some(key) = &record.key {
            future_record = future_record.key(key.as_slice());
        }

        match self
            .producer
            .send(future_record, Timeout::After(self.send_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(DeliveryReport {
                topic: record.topic.clone(),
                partition,
                offset,
            }),
            Err((e, _)) => Err(e.into()),
        }
    }
}

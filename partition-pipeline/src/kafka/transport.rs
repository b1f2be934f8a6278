//! Narrow interfaces to the underlying log transport.
//!
//! The pipeline only needs poll/commit/position and pause/resume on the consuming side,
//! and send plus partition discovery on the producing side. Rebalance notifications flow
//! back through [`RebalanceListener`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::kafka::types::{
    DeliveryReport, OffsetAndMetadata, OutboundRecord, PartitionAssignment, RawRecord,
    TopicPartition,
};

/// Receives assignment changes from the transport.
///
/// Both callbacks run synchronously inside the transport's rebalance handling, so
/// by the time a revocation returns no further work for those partitions may be started.
pub trait RebalanceListener: Send + Sync {
    fn partitions_assigned(&self, assignments: &[PartitionAssignment]);

    fn partitions_revoked(&self, partitions: &[TopicPartition]);
}

#[async_trait]
pub trait ConsumerTransport: Send + Sync {
    /// Fetch up to `max_records`, waiting at most `timeout` for them to arrive
    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawRecord>, TransportError>;

    fn commit_sync(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<(), TransportError>;

    fn position(&self, partition: &TopicPartition) -> Result<Option<i64>, TransportError>;

    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), TransportError>;

    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), TransportError>;
}

#[async_trait]
pub trait ProducerTransport: Send + Sync {
    /// Total number of partitions of `topic`, regardless of their availability
    fn partition_count(&self, topic: &str) -> Result<i32, TransportError>;

    /// Send a record and wait for the delivery acknowledgment
    async fn send(&self, record: OutboundRecord) -> Result<DeliveryReport, TransportError>;
}

//! In-memory transports for driving the pipeline without a broker.
//!
//! The consumer side plays the part of a single group member: tests push records,
//! trigger assignments and revocations, and inspect what was committed.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::kafka::transport::{ConsumerTransport, ProducerTransport, RebalanceListener};
use crate::kafka::types::{
    DeliveryReport, OffsetAndMetadata, OutboundRecord, PartitionAssignment, RawRecord,
    TopicPartition,
};

#[derive(Default)]
struct ConsumerState {
    pending: VecDeque<RawRecord>,
    assigned: BTreeSet<TopicPartition>,
    paused: BTreeSet<TopicPartition>,
    committed: HashMap<TopicPartition, i64>,
    commits: Vec<HashMap<TopicPartition, OffsetAndMetadata>>,
    poll_errors: VecDeque<TransportError>,
    fail_commits: bool,
}

#[derive(Default)]
pub struct MockConsumerTransport {
    state: Mutex<ConsumerState>,
    listener: Mutex<Option<Arc<dyn RebalanceListener>>>,
}

impl MockConsumerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_listener(&self, listener: Arc<dyn RebalanceListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Queue records to be returned by subsequent polls, in order
    pub fn push_records(&self, records: impl IntoIterator<Item = RawRecord>) {
        self.state.lock().pending.extend(records);
    }

    /// Seed a committed offset, as if a previous group member had committed it
    pub fn set_committed(&self, partition: TopicPartition, offset: i64) {
        self.state.lock().committed.insert(partition, offset);
    }

    /// Assign partitions to this member and notify the listener
    pub fn assign(&self, partitions: &[TopicPartition]) {
        let assignments: Vec<PartitionAssignment> = {
            let mut state = self.state.lock();
            partitions
                .iter()
                .map(|partition| {
                    state.assigned.insert(partition.clone());
                    let position = state.committed.get(partition).copied();
                    PartitionAssignment::new(partition.clone(), position)
                })
                .collect()
        };

        if let Some(listener) = self.listener() {
            listener.partitions_assigned(&assignments);
        }
    }

    /// Revoke partitions, dropping their undelivered records, and notify the listener
    pub fn revoke(&self, partitions: &[TopicPartition]) {
        if let Some(listener) = self.listener() {
            listener.partitions_revoked(partitions);
        }

        let mut state = self.state.lock();
        for partition in partitions {
            state.assigned.remove(partition);
            state.paused.remove(partition);
        }
        state
            .pending
            .retain(|record| !partitions.contains(&record.topic_partition()));
    }

    /// Make the next poll fail with `error`
    pub fn fail_next_poll(&self, error: TransportError) {
        self.state.lock().poll_errors.push_back(error);
    }

    pub fn set_fail_commits(&self, fail: bool) {
        self.state.lock().fail_commits = fail;
    }

    pub fn commits(&self) -> Vec<HashMap<TopicPartition, OffsetAndMetadata>> {
        self.state.lock().commits.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().commits.len()
    }

    pub fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        self.state.lock().committed.get(partition).copied()
    }

    pub fn paused(&self) -> Vec<TopicPartition> {
        self.state.lock().paused.iter().cloned().collect()
    }

    pub fn pending_records(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn listener(&self) -> Option<Arc<dyn RebalanceListener>> {
        self.listener.lock().clone()
    }
}

#[async_trait]
impl ConsumerTransport for MockConsumerTransport {
    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<RawRecord>, TransportError> {
        let records = {
            let mut state = self.state.lock();
            if let Some(error) = state.poll_errors.pop_front() {
                return Err(error);
            }

            let mut records = Vec::new();
            let mut remaining = VecDeque::new();
            while let Some(record) = state.pending.pop_front() {
                if records.len() < max_records && !state.paused.contains(&record.topic_partition())
                {
                    records.push(record);
                } else {
                    remaining.push_back(record);
                }
            }
            state.pending = remaining;
            records
        };

        if records.is_empty() {
            tokio::time::sleep(timeout).await;
        }
        Ok(records)
    }

    fn commit_sync(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();

        let not_owned = offsets
            .keys()
            .find(|partition| state.fail_commits || !state.assigned.contains(*partition));
        if let Some(partition) = not_owned {
            return Err(TransportError::NotOwner(partition.clone()));
        }

        for (partition, offset) in offsets {
            state.committed.insert(partition.clone(), offset.offset);
        }
        state.commits.push(offsets.clone());
        Ok(())
    }

    fn position(&self, partition: &TopicPartition) -> Result<Option<i64>, TransportError> {
        let state = self.state.lock();
        if !state.assigned.contains(partition) {
            return Err(TransportError::NotOwner(partition.clone()));
        }
        Ok(state.committed.get(partition).copied())
    }

    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), TransportError> {
        self.state.lock().paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        for partition in partitions {
            state.paused.remove(partition);
        }
        Ok(())
    }
}

#[derive(Default)]
struct ProducerState {
    sent: Vec<OutboundRecord>,
    next_offsets: HashMap<(String, i32), i64>,
    fail_sends: bool,
}

#[derive(Default)]
pub struct MockProducerTransport {
    partition_counts: HashMap<String, i32>,
    state: Mutex<ProducerState>,
}

impl MockProducerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic(mut self, topic: &str, partitions: i32) -> Self {
        self.partition_counts.insert(topic.to_string(), partitions);
        self
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    pub fn sent(&self) -> Vec<OutboundRecord> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl ProducerTransport for MockProducerTransport {
    fn partition_count(&self, topic: &str) -> Result<i32, TransportError> {
        self.partition_counts
            .get(topic)
            .copied()
            .ok_or_else(|| TransportError::UnknownTopic(topic.to_string()))
    }

    async fn send(&self, record: OutboundRecord) -> Result<DeliveryReport, TransportError> {
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(TransportError::Fatal(format!(
                "delivery to {} failed",
                record.topic
            )));
        }

        let next = state
            .next_offsets
            .entry((record.topic.clone(), record.partition))
            .or_insert(0);
        let offset = *next;
        *next += 1;

        let report = DeliveryReport {
            topic: record.topic.clone(),
            partition: record.partition,
            offset,
        };
        state.sent.push(record);
        Ok(report)
    }
}

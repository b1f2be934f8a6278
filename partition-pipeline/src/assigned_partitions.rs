//! Assigned Partitions - owns the partition processors of a consumer
//!
//! Processors are created eagerly on assignment, or lazily when records arrive for a
//! partition that has none. Revocation removes a processor from the map before the
//! revocation callback returns and drains it in the background with a bounded window.
//! Records for a revoked partition are dropped instead of creating a new processor.
//!
//! A partition that is assigned again while its old processor is still draining gets a
//! new processor right away, but that one only starts dispatching once the old one is
//! Terminated. At most one processor runs handlers for a partition at any time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dictionary::TypeDictionary;
use crate::kafka::types::{RawRecord, TopicPartition};
use crate::metrics_consts::ACTIVE_PROCESSORS;
use crate::processor::{FailedMessageProcessor, PartitionProcessor, ProcessorConfig, ProcessorState};

/// Builds processors that share one dictionary and failure policy
pub struct ProcessorFactory {
    dictionary: Arc<TypeDictionary>,
    failure_policy: Arc<dyn FailedMessageProcessor>,
    config: ProcessorConfig,
    runtime: Handle,
}

impl ProcessorFactory {
    /// Must be called from within a tokio runtime, processors are spawned onto it
    pub fn new(
        dictionary: Arc<TypeDictionary>,
        failure_policy: Arc<dyn FailedMessageProcessor>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            dictionary,
            failure_policy,
            config,
            runtime: Handle::current(),
        }
    }

    /// `predecessor` is the state of a processor for the same partition that has not
    /// stopped yet. The new processor holds off dispatching until it has.
    pub fn create(
        &self,
        partition: TopicPartition,
        predecessor: Option<watch::Receiver<ProcessorState>>,
    ) -> PartitionProcessor {
        PartitionProcessor::succeeding(
            partition,
            self.dictionary.clone(),
            self.failure_policy.clone(),
            &self.config,
            &self.runtime,
            predecessor,
        )
    }
}

pub struct AssignedPartitions {
    processors: DashMap<TopicPartition, PartitionProcessor>,
    revoked: DashSet<TopicPartition>,
    factory: ProcessorFactory,
    drain_timeout: Duration,
    draining: Mutex<Vec<JoinHandle<bool>>>,
    /// State of revoked processors that may still be running handlers
    retiring: DashMap<TopicPartition, watch::Receiver<ProcessorState>>,
}

impl AssignedPartitions {
    pub fn new(factory: ProcessorFactory, drain_timeout: Duration) -> Self {
        Self {
            processors: DashMap::new(),
            revoked: DashSet::new(),
            factory,
            drain_timeout,
            draining: Mutex::new(Vec::new()),
            retiring: DashMap::new(),
        }
    }

    /// Forward each partition's records, in offset order, to its processor.
    ///
    /// Returns the number of records accepted.
    pub fn enqueue(&self, batch: BTreeMap<TopicPartition, Vec<RawRecord>>) -> usize {
        let mut accepted = 0;

        for (partition, mut records) in batch {
            if self.revoked.contains(&partition) {
                debug!(
                    partition = %partition,
                    count = records.len(),
                    "Dropping records for revoked partition"
                );
                continue;
            }

            records.sort_by_key(|record| record.offset);

            let processor = self
                .processors
                .entry(partition.clone())
                .or_insert_with(|| {
                    info!(partition = %partition, "Creating partition processor on first record");
                    self.create_processor(&partition)
                });

            for record in records {
                let offset = record.offset;
                match processor.enqueue(record) {
                    Ok(()) => accepted += 1,
                    Err(e) => {
                        warn!(partition = %partition, offset = offset, "Record not enqueued: {}", e);
                        break;
                    }
                }
            }
        }

        self.update_gauge();
        accepted
    }

    /// Create processors for newly assigned partitions that have none yet
    pub fn assign_new_partitions(&self, partitions: &[TopicPartition]) {
        for partition in partitions {
            self.revoked.remove(partition);

            if self.processors.contains_key(partition) {
                info!(
                    partition = %partition,
                    "Processor already exists, reusing (rapid re-assignment)"
                );
                continue;
            }

            self.processors
                .entry(partition.clone())
                .or_insert_with(|| {
                    info!(partition = %partition, "Creating partition processor");
                    self.create_processor(partition)
                });
        }

        self.update_gauge();
    }

    /// Remove the processors of revoked partitions and drain them in the background
    pub fn revoke_partitions(&self, partitions: &[TopicPartition]) {
        let mut draining = self.draining.lock();
        draining.retain(|handle| !handle.is_finished());
        self.retiring.retain(|_, state| *state.borrow() != ProcessorState::Terminated);

        for partition in partitions {
            self.revoked.insert(partition.clone());

            let Some((_, mut processor)) = self.processors.remove(partition) else {
                continue;
            };

            info!(partition = %partition, "Removed partition processor, draining");
            self.retiring.insert(partition.clone(), processor.state_watch());
            let timeout = self.drain_timeout;
            draining.push(self.factory.runtime.spawn(async move {
                processor.wait_for_handlers_to_terminate(timeout).await
            }));
        }

        drop(draining);
        self.update_gauge();
    }

    pub fn all_partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<TopicPartition> =
            self.processors.iter().map(|entry| entry.key().clone()).collect();
        partitions.sort();
        partitions
    }

    pub fn has_partition(&self, partition: &TopicPartition) -> bool {
        self.processors.contains_key(partition)
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    /// Take the commit point of every processor that has one
    pub fn commit_offsets(&self) -> HashMap<TopicPartition, i64> {
        self.processors
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .get_commit_offset_and_clear()
                    .map(|offset| (entry.key().clone(), offset))
            })
            .collect()
    }

    pub fn has_uncommitted_messages(&self) -> bool {
        self.processors
            .iter()
            .any(|entry| entry.value().has_uncommitted_messages())
    }

    pub fn pending_counts(&self) -> Vec<(TopicPartition, usize)> {
        self.processors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().pending_count()))
            .collect()
    }

    /// Stop dispatching for `partitions`; their processors keep accepting records
    pub fn pause_partitions(&self, partitions: &[TopicPartition]) {
        for partition in partitions {
            if let Some(processor) = self.processors.get(partition) {
                processor.pause();
            }
        }
    }

    pub fn resume_partitions(&self, partitions: &[TopicPartition]) {
        for partition in partitions {
            if let Some(processor) = self.processors.get(partition) {
                processor.resume();
            }
        }
    }

    /// Drain every processor, including those still draining after a revocation.
    ///
    /// Returns the final commit point of each drained partition.
    pub async fn shutdown(&self) -> HashMap<TopicPartition, i64> {
        let partitions = self.all_partitions();
        let processors: Vec<PartitionProcessor> = partitions
            .iter()
            .filter_map(|partition| self.processors.remove(partition).map(|(_, p)| p))
            .collect();
        self.update_gauge();

        info!(count = processors.len(), "Draining partition processors");

        let timeout = self.drain_timeout;
        let drains = processors.into_iter().map(|mut processor| async move {
            let drained = processor.wait_for_handlers_to_terminate(timeout).await;
            (processor, drained)
        });
        let results = join_all(drains).await;

        let abandoned = results.iter().filter(|(_, drained)| !drained).count();
        if abandoned > 0 {
            warn!(abandoned = abandoned, "Some partition processors did not drain in time");
        }

        let revoked: Vec<JoinHandle<bool>> = std::mem::take(&mut *self.draining.lock());
        join_all(revoked).await;

        // Abandoned processors still report what completed before they were stopped
        results
            .iter()
            .filter_map(|(processor, _)| {
                processor
                    .get_commit_offset_and_clear()
                    .map(|offset| (processor.partition().clone(), offset))
            })
            .collect()
    }

    fn create_processor(&self, partition: &TopicPartition) -> PartitionProcessor {
        let predecessor = self
            .retiring
            .remove(partition)
            .map(|(_, state)| state)
            .filter(|state| *state.borrow() != ProcessorState::Terminated);
        if predecessor.is_some() {
            info!(
                partition = %partition,
                "Previous processor is still draining, new one waits for it"
            );
        }
        self.factory.create(partition.clone(), predecessor)
    }

    fn update_gauge(&self) {
        metrics::gauge!(ACTIVE_PROCESSORS).set(self.processors.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::dictionary::{HandlerContext, MessageHandler};
    use crate::envelope::{Message, Payload, Topic, TraceContext};
    use crate::processor::DiscardFailedMessages;

    #[derive(Serialize, Deserialize)]
    struct Tick {
        n: i64,
    }

    impl Payload for Tick {
        const NAME: &'static str = "tick";
    }

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<(i32, i64)>>>,
    }

    #[async_trait]
    impl MessageHandler<Tick> for Recorder {
        async fn handle(&self, payload: Tick, context: &HandlerContext) -> anyhow::Result<()> {
            self.seen
                .lock()
                .push((context.partition.partition_number(), payload.n));
            Ok(())
        }
    }

    fn tick(partition: i32, offset: i64) -> RawRecord {
        let message = Message::new(
            Topic::new("ticks"),
            None,
            &Tick { n: offset },
            TraceContext::default(),
        )
        .unwrap();
        RawRecord::new("ticks", partition, offset, None, Some(message.to_bytes().unwrap()))
    }

    /// Records ticks slowly and tracks how many handler calls overlap
    #[derive(Clone, Default)]
    struct SlowRecorder {
        recorder: Recorder,
        running: Arc<AtomicUsize>,
        max_running: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageHandler<Tick> for SlowRecorder {
        async fn handle(&self, payload: Tick, context: &HandlerContext) -> anyhow::Result<()> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.recorder.handle(payload, context).await
        }
    }

    fn registry(recorder: Recorder) -> AssignedPartitions {
        registry_for(TypeDictionary::builder().register(recorder).build())
    }

    fn registry_for(dictionary: TypeDictionary) -> AssignedPartitions {
        let dictionary = Arc::new(dictionary);
        let factory = ProcessorFactory::new(
            dictionary,
            Arc::new(DiscardFailedMessages),
            ProcessorConfig::default(),
        );
        AssignedPartitions::new(factory, Duration::from_secs(1))
    }

    fn batch(records: Vec<RawRecord>) -> BTreeMap<TopicPartition, Vec<RawRecord>> {
        let mut batch: BTreeMap<TopicPartition, Vec<RawRecord>> = BTreeMap::new();
        for record in records {
            batch.entry(record.topic_partition()).or_default().push(record);
        }
        batch
    }

    async fn settle(registry: &AssignedPartitions) {
        for _ in 0..200 {
            if !registry.has_uncommitted_messages() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("records were never handled");
    }

    #[tokio::test]
    async fn test_assignment_is_idempotent() {
        let registry = registry(Recorder::default());
        let p0 = TopicPartition::new("ticks", 0);
        let p1 = TopicPartition::new("ticks", 1);

        registry.assign_new_partitions(&[p0.clone(), p1.clone()]);
        registry.assign_new_partitions(&[p0.clone()]);

        assert_eq!(registry.processor_count(), 2);
        assert_eq!(registry.all_partitions(), vec![p0, p1]);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_creates_processors_and_orders_records() {
        let recorder = Recorder::default();
        let registry = registry(recorder.clone());

        let accepted = registry.enqueue(batch(vec![
            tick(0, 2),
            tick(1, 7),
            tick(0, 0),
            tick(0, 1),
        ]));
        assert_eq!(accepted, 4);
        assert_eq!(registry.processor_count(), 2);
        settle(&registry).await;

        let partition_zero: Vec<i64> = recorder
            .seen
            .lock()
            .iter()
            .filter(|(partition, _)| *partition == 0)
            .map(|(_, n)| *n)
            .collect();
        assert_eq!(partition_zero, vec![0, 1, 2]);

        let offsets = registry.commit_offsets();
        assert_eq!(offsets.get(&TopicPartition::new("ticks", 0)), Some(&2));
        assert_eq!(offsets.get(&TopicPartition::new("ticks", 1)), Some(&7));
        assert!(registry.commit_offsets().is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_revoked_partition_is_not_recreated() {
        let recorder = Recorder::default();
        let registry = registry(recorder.clone());
        let p0 = TopicPartition::new("ticks", 0);

        registry.assign_new_partitions(&[p0.clone()]);
        registry.revoke_partitions(&[p0.clone()]);
        assert!(!registry.has_partition(&p0));

        assert_eq!(registry.enqueue(batch(vec![tick(0, 0)])), 0);
        assert!(!registry.has_partition(&p0));
        assert!(registry.all_partitions().is_empty());

        // a later assignment lifts the block
        registry.assign_new_partitions(&[p0.clone()]);
        assert_eq!(registry.enqueue(batch(vec![tick(0, 0)])), 1);
        settle(&registry).await;
        assert_eq!(recorder.seen.lock().len(), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_returns_final_offsets() {
        let registry = registry(Recorder::default());

        registry.enqueue(batch(vec![tick(0, 10), tick(0, 11), tick(3, 4)]));
        let offsets = registry.shutdown().await;

        assert_eq!(offsets.get(&TopicPartition::new("ticks", 0)), Some(&11));
        assert_eq!(offsets.get(&TopicPartition::new("ticks", 3)), Some(&4));
        assert_eq!(registry.processor_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reassigned_partition_waits_for_the_draining_processor() {
        let handler = SlowRecorder::default();
        let registry = registry_for(TypeDictionary::builder().register(handler.clone()).build());
        let p0 = TopicPartition::new("ticks", 0);

        registry.assign_new_partitions(&[p0.clone()]);
        registry.enqueue(batch(vec![tick(0, 0), tick(0, 1), tick(0, 2)]));
        tokio::time::sleep(Duration::from_millis(10)).await;

        registry.revoke_partitions(&[p0.clone()]);
        registry.assign_new_partitions(&[p0.clone()]);
        assert_eq!(registry.enqueue(batch(vec![tick(0, 0)])), 1);

        settle(&registry).await;
        registry.shutdown().await;

        assert_eq!(handler.max_running.load(Ordering::SeqCst), 1);
        let seen: Vec<i64> = handler.recorder.seen.lock().iter().map(|(_, n)| *n).collect();
        assert_eq!(seen, vec![0, 1, 2, 0]);
    }
}

//! Consumer - the poll loop tying the transport to the processors and the committer
//!
//! One tokio task per consumer polls the transport, groups records by partition and
//! hands them to [`AssignedPartitions`], then gives the [`OffsetCommitter`] a chance to
//! commit. Rebalance callbacks from the transport reach both through a
//! [`RebalanceCoordinator`], always committer first on revocation so that nothing is
//! committed for a partition once it is gone.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common_kafka::consumer_config::ConsumerConfigBuilder;

use crate::assigned_partitions::{AssignedPartitions, ProcessorFactory};
use crate::backoff::{self, ExponentialBackoff};
use crate::config::Config;
use crate::dictionary::TypeDictionary;
use crate::error::{PipelineError, TransportError};
use crate::kafka::rdkafka_transport::KafkaConsumerTransport;
use crate::kafka::transport::{ConsumerTransport, RebalanceListener};
use crate::kafka::types::{PartitionAssignment, RawRecord, TopicPartition};
use crate::metrics_consts::{
    PARTITION_BACKPRESSURE, POLL_BATCH_SIZE, POLL_ERRORS, RECORDS_POLLED,
};
use crate::offset_committer::OffsetCommitter;
use crate::processor::{FailedMessageProcessor, ProcessorConfig};

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub poll_timeout: Duration,
    pub max_poll_records: usize,
    /// Backlog of a partition above which the transport stops fetching it
    pub max_pending_records: usize,
    pub commit_idle: Duration,
    pub drain_timeout: Duration,
    pub processor: ProcessorConfig,
    pub poll_error_backoff: ExponentialBackoff,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            max_poll_records: 500,
            max_pending_records: 1000,
            commit_idle: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            processor: ProcessorConfig::default(),
            poll_error_backoff: ExponentialBackoff::new(2)
                .with_unit(Duration::from_millis(100))
                .with_max(Duration::from_secs(10)),
        }
    }
}

struct PipelineState {
    registry: AssignedPartitions,
    committer: OffsetCommitter,
    /// Partitions paused on the transport because their backlog is too large
    backpressured: Mutex<HashSet<TopicPartition>>,
}

/// Fans rebalance events out to the committer and the registry, in that order
pub struct RebalanceCoordinator {
    state: Arc<PipelineState>,
}

impl RebalanceListener for RebalanceCoordinator {
    fn partitions_assigned(&self, assignments: &[PartitionAssignment]) {
        let partitions: Vec<TopicPartition> = assignments
            .iter()
            .map(|assignment| assignment.partition.clone())
            .collect();

        self.state.committer.partitions_assigned(assignments);
        self.state.registry.assign_new_partitions(&partitions);
    }

    fn partitions_revoked(&self, partitions: &[TopicPartition]) {
        self.state.committer.partitions_revoked(partitions);
        self.state.registry.revoke_partitions(partitions);

        let mut backpressured = self.state.backpressured.lock();
        for partition in partitions {
            backpressured.remove(partition);
        }
    }
}

pub struct PipelineConsumer {
    transport: Arc<dyn ConsumerTransport>,
    state: Arc<PipelineState>,
    options: ConsumerOptions,
}

impl PipelineConsumer {
    /// Build the pipeline and start its poll loop on the current runtime.
    ///
    /// `connect` receives the listener the transport must report rebalances to.
    pub fn start<F>(
        options: ConsumerOptions,
        dictionary: Arc<TypeDictionary>,
        failure_policy: Arc<dyn FailedMessageProcessor>,
        connect: F,
    ) -> Result<ConsumerHandle, PipelineError>
    where
        F: FnOnce(Arc<dyn RebalanceListener>) -> Result<Arc<dyn ConsumerTransport>, TransportError>,
    {
        let factory = ProcessorFactory::new(dictionary, failure_policy, options.processor.clone());
        let state = Arc::new(PipelineState {
            registry: AssignedPartitions::new(factory, options.drain_timeout),
            committer: OffsetCommitter::new(options.commit_idle),
            backpressured: Mutex::new(HashSet::new()),
        });

        let transport = connect(Arc::new(RebalanceCoordinator {
            state: state.clone(),
        }))?;

        let consumer = PipelineConsumer {
            transport,
            state: state.clone(),
            options,
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(consumer.run(cancel.clone()));

        Ok(ConsumerHandle {
            cancel,
            task,
            state,
        })
    }

    async fn run(self, cancel: CancellationToken) -> Result<(), PipelineError> {
        info!(
            max_poll_records = self.options.max_poll_records,
            queue = %self.options.processor.queue_kind,
            "Starting consumer loop"
        );

        let mut consecutive_errors: u32 = 0;

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = self
                    .transport
                    .poll(self.options.max_poll_records, self.options.poll_timeout) => polled,
            };

            match polled {
                Ok(records) => {
                    consecutive_errors = 0;
                    self.dispatch(records);
                }
                Err(e) if e.is_fatal() => {
                    metrics::counter!(POLL_ERRORS, "kind" => e.kind(), "fatal" => "true")
                        .increment(1);
                    error!(error = ?e, "Fatal transport error, stopping consumer");
                    // The client is unusable, so there is no point in a final commit
                    self.state.registry.shutdown().await;
                    return Err(e.into());
                }
                Err(e) => {
                    metrics::counter!(POLL_ERRORS, "kind" => e.kind(), "fatal" => "false")
                        .increment(1);
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    warn!(
                        error = ?e,
                        consecutive_errors = consecutive_errors,
                        "Poll failed, backing off"
                    );

                    if backoff::wait(&self.options.poll_error_backoff, consecutive_errors, &cancel)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }

            self.apply_backpressure();
            self.state
                .committer
                .recommit_offsets(self.transport.as_ref(), &self.state.registry);
        }

        self.finish().await;
        Ok(())
    }

    fn dispatch(&self, records: Vec<RawRecord>) {
        if records.is_empty() {
            return;
        }

        metrics::counter!(RECORDS_POLLED).increment(records.len() as u64);
        metrics::histogram!(POLL_BATCH_SIZE).record(records.len() as f64);

        let mut batch: BTreeMap<TopicPartition, Vec<RawRecord>> = BTreeMap::new();
        for record in records {
            batch.entry(record.topic_partition()).or_default().push(record);
        }

        let accepted = self.state.registry.enqueue(batch);
        debug!(accepted = accepted, "Dispatched polled records");
    }

    /// Pause fetching partitions whose backlog is over the limit, resume them
    /// once it is down to half of it.
    fn apply_backpressure(&self) {
        let limit = self.options.max_pending_records;
        let mut backpressured = self.state.backpressured.lock();

        let mut to_pause = Vec::new();
        let mut to_resume = Vec::new();
        for (partition, pending) in self.state.registry.pending_counts() {
            let paused = backpressured.contains(&partition);
            if !paused && pending > limit {
                to_pause.push(partition);
            } else if paused && pending <= limit / 2 {
                to_resume.push(partition);
            }
        }

        if !to_pause.is_empty() {
            match self.transport.pause(&to_pause) {
                Ok(()) => {
                    info!(partitions = ?to_pause, "Pausing partitions with a full backlog");
                    metrics::counter!(PARTITION_BACKPRESSURE, "action" => "pause")
                        .increment(to_pause.len() as u64);
                    backpressured.extend(to_pause);
                }
                Err(e) => warn!(error = ?e, "Failed to pause partitions"),
            }
        }

        if !to_resume.is_empty() {
            match self.transport.resume(&to_resume) {
                Ok(()) => {
                    info!(partitions = ?to_resume, "Resuming drained partitions");
                    metrics::counter!(PARTITION_BACKPRESSURE, "action" => "resume")
                        .increment(to_resume.len() as u64);
                    for partition in &to_resume {
                        backpressured.remove(partition);
                    }
                }
                Err(e) => warn!(error = ?e, "Failed to resume partitions"),
            }
        }
    }

    /// Drain the processors and commit whatever they finished, ignoring the idle window
    async fn finish(&self) {
        info!("Stopping consumer loop, draining processors");

        let processed = self.state.registry.shutdown().await;
        let outcome = self
            .state
            .committer
            .commit_now(self.transport.as_ref(), processed);

        info!(outcome = ?outcome, "Consumer stopped");
    }
}

/// Handle to a running consumer. Dropping it leaves the loop running.
pub struct ConsumerHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<(), PipelineError>>,
    state: Arc<PipelineState>,
}

impl ConsumerHandle {
    /// Stop polling, drain the processors, commit, and return the loop's result
    pub async fn shutdown(self) -> Result<(), PipelineError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the loop to end on its own, which only happens on a fatal error
    /// or once the cancellation token fires.
    pub async fn join(self) -> Result<(), PipelineError> {
        self.task.await?
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        self.state.registry.all_partitions()
    }

    pub fn has_uncommitted_messages(&self) -> bool {
        self.state.registry.has_uncommitted_messages()
    }
}

/// Subscribe a group consumer to the configured topic and start processing it
pub fn consumer_for_topic(
    config: &Config,
    dictionary: Arc<TypeDictionary>,
    failure_policy: Arc<dyn FailedMessageProcessor>,
) -> Result<ConsumerHandle, PipelineError> {
    let client_config = ConsumerConfigBuilder::new(&config.kafka.kafka_hosts, &config.consumer_group)
        .with_tls(config.kafka.kafka_tls)
        .with_offset_reset(&config.offset_reset)
        .with_sticky_partition_assignment(config.kafka.kafka_client_id.as_deref())
        .build();

    let topic = config.topic.clone();
    PipelineConsumer::start(
        config.consumer_options(),
        dictionary,
        failure_policy,
        move |listener| {
            let transport: Arc<dyn ConsumerTransport> = Arc::new(KafkaConsumerTransport::new(
                &client_config,
                &[topic.as_str()],
                listener,
            )?);
            Ok(transport)
        },
    )
}

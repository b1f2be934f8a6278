//! Partition Processor - sequential executor for the records of a single partition
//!
//! Each assigned partition gets its own tokio task fed through a channel, so:
//! 1. Records of a partition are handled one at a time, in the order their queue releases them
//! 2. Partitions are handled in parallel with each other
//! 3. A failing or slow partition never blocks the others

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dictionary::{HandlerContext, TypeDictionary};
use crate::envelope::Message;
use crate::error::PipelineError;
use crate::kafka::types::{RawRecord, TopicPartition};
use crate::metrics_consts::{DRAIN_TIMEOUTS, HANDLER_DURATION, HANDLER_RETRIES, RECORDS_HANDLED};
use crate::processor::failure::{FailedMessage, FailedMessageProcessor, FailureDecision};
use crate::processor::offsets::UncommittedOffsets;
use crate::queue::{Delivery, MessageQueue, QueueKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Accepting and dispatching records
    Active,
    /// Accepting records but not dispatching them
    Paused,
    /// Drained or abandoned, no further activity
    Terminated,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub queue_kind: QueueKind,
    /// How long a record that was not consumed waits before it is delivered again
    pub retry_window: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            queue_kind: QueueKind::Priority,
            retry_window: Duration::from_secs(5),
        }
    }
}

struct Shared {
    partition: TopicPartition,
    offsets: Mutex<UncommittedOffsets>,
    state: watch::Sender<ProcessorState>,
    closing: CancellationToken,
}

pub struct PartitionProcessor {
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<RawRecord>,
    handle: Option<JoinHandle<()>>,
}

impl PartitionProcessor {
    pub fn new(
        partition: TopicPartition,
        dictionary: Arc<TypeDictionary>,
        failure_policy: Arc<dyn FailedMessageProcessor>,
        config: &ProcessorConfig,
        runtime: &Handle,
    ) -> Self {
        Self::succeeding(partition, dictionary, failure_policy, config, runtime, None)
    }

    /// Like [`PartitionProcessor::new`], but nothing is dispatched until `predecessor`,
    /// the state of an earlier processor for the same partition, reports Terminated.
    /// Records are accepted and buffered in the meantime.
    pub fn succeeding(
        partition: TopicPartition,
        dictionary: Arc<TypeDictionary>,
        failure_policy: Arc<dyn FailedMessageProcessor>,
        config: &ProcessorConfig,
        runtime: &Handle,
        predecessor: Option<watch::Receiver<ProcessorState>>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ProcessorState::Active);

        let shared = Arc::new(Shared {
            partition,
            offsets: Mutex::new(UncommittedOffsets::new()),
            state,
            closing: CancellationToken::new(),
        });

        let worker = Worker {
            executor: Executor {
                shared: shared.clone(),
                dictionary,
                failure_policy,
            },
            receiver,
            state_rx,
            predecessor,
            queue: config.queue_kind.build(config.retry_window),
        };
        let handle = runtime.spawn(worker.run());

        Self {
            shared,
            sender,
            handle: Some(handle),
        }
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.shared.partition
    }

    pub fn state(&self) -> ProcessorState {
        *self.shared.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ProcessorState> {
        self.shared.state.subscribe()
    }

    /// Hand a record to the worker. Its offset counts as uncommitted until it is consumed.
    pub fn enqueue(&self, record: RawRecord) -> Result<(), PipelineError> {
        if self.shared.closing.is_cancelled() || self.state() == ProcessorState::Terminated {
            return Err(PipelineError::ProcessorClosed(self.shared.partition.clone()));
        }

        let offset = record.offset;
        self.shared.offsets.lock().track(offset);

        if self.sender.send(record).is_err() {
            self.shared.offsets.lock().forget(offset);
            return Err(PipelineError::ProcessorClosed(self.shared.partition.clone()));
        }
        Ok(())
    }

    pub fn has_uncommitted_messages(&self) -> bool {
        self.shared.offsets.lock().has_pending()
    }

    /// Records received but not consumed yet
    pub fn pending_count(&self) -> usize {
        self.shared.offsets.lock().pending_count()
    }

    /// The highest offset below which every record has been consumed, `None` if that
    /// has not moved since the last call.
    pub fn get_commit_offset_and_clear(&self) -> Option<i64> {
        self.shared.offsets.lock().take_safe_offset()
    }

    pub fn pause(&self) {
        self.shared.state.send_if_modified(|state| {
            if *state == ProcessorState::Active {
                *state = ProcessorState::Paused;
                return true;
            }
            false
        });
    }

    pub fn resume(&self) {
        self.shared.state.send_if_modified(|state| {
            if *state == ProcessorState::Paused {
                *state = ProcessorState::Active;
                return true;
            }
            false
        });
    }

    /// Stop accepting records and wait up to `timeout` for everything received to be handled.
    ///
    /// Returns false when the worker had to be abandoned. Either way the processor is
    /// Terminated afterwards.
    pub async fn wait_for_handlers_to_terminate(&mut self, timeout: Duration) -> bool {
        self.shared.closing.cancel();
        self.resume();

        let drained = match self.handle.take() {
            None => true,
            Some(mut handle) => match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(partition = %self.shared.partition, "Partition processor drained");
                    true
                }
                Ok(Err(e)) => {
                    warn!(
                        partition = %self.shared.partition,
                        "Partition processor task failed during shutdown: {}", e
                    );
                    true
                }
                Err(_) => {
                    let pending = self.pending_count();
                    warn!(
                        partition = %self.shared.partition,
                        pending = pending,
                        "Partition processor did not drain in {:?}, abandoning it", timeout
                    );
                    metrics::counter!(DRAIN_TIMEOUTS).increment(1);
                    handle.abort();
                    // the handler future is only dropped once the aborted task is polled
                    if let Err(e) = handle.await {
                        debug!(
                            partition = %self.shared.partition,
                            "Abandoned worker stopped: {}", e
                        );
                    }
                    false
                }
            },
        };

        self.shared.state.send_replace(ProcessorState::Terminated);
        drained
    }
}

enum Outcome {
    Consumed(&'static str),
    Retry,
}

struct Worker {
    executor: Executor,
    receiver: mpsc::UnboundedReceiver<RawRecord>,
    state_rx: watch::Receiver<ProcessorState>,
    predecessor: Option<watch::Receiver<ProcessorState>>,
    queue: Box<dyn MessageQueue>,
}

impl Worker {
    async fn run(mut self) {
        let shared = self.executor.shared.clone();
        let partition = shared.partition.clone();
        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "Starting partition processor"
        );

        if let Some(mut predecessor) = self.predecessor.take() {
            debug!(partition = %partition, "Waiting for the previous processor to stop");
            // a dropped sender means the previous processor is gone as well
            let stopped = predecessor
                .wait_for(|state| *state == ProcessorState::Terminated)
                .await
                .is_ok();
            debug!(
                partition = %partition,
                stopped = stopped,
                "Previous processor released the partition"
            );
        }

        let mut inbox_open = true;
        let mut closing = false;
        loop {
            self.dispatch_ready().await;

            if !inbox_open && self.queue.is_empty() {
                break;
            }

            let deadline = self.queue.next_deadline();
            tokio::select! {
                received = self.receiver.recv(), if inbox_open => match received {
                    Some(record) => self.queue.add(record, Instant::now()),
                    None => inbox_open = false,
                },
                _ = shared.closing.cancelled(), if inbox_open && !closing => {
                    // buffered records are still received before recv returns None
                    self.receiver.close();
                    closing = true;
                },
                _ = sleep_until_deadline(deadline), if deadline.is_some() => {},
                _ = self.state_rx.changed() => {},
            }
        }

        shared.state.send_replace(ProcessorState::Terminated);
        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "Partition processor stopped"
        );
    }

    async fn dispatch_ready(&mut self) {
        while *self.state_rx.borrow_and_update() == ProcessorState::Active {
            let Some(delivery) = self.queue.next_ready(Instant::now()) else {
                return;
            };

            let offset = delivery.offset();
            match self.executor.execute(&delivery).await {
                Outcome::Consumed(outcome) => {
                    metrics::counter!(RECORDS_HANDLED, "outcome" => outcome).increment(1);
                    self.queue.consumed(offset);
                    self.executor.shared.offsets.lock().complete(offset);
                }
                Outcome::Retry => {
                    metrics::counter!(RECORDS_HANDLED, "outcome" => "retried").increment(1);
                    metrics::counter!(HANDLER_RETRIES).increment(1);
                    self.queue.processing_ended(offset, Instant::now());
                }
            }
        }
    }
}

/// Runs one delivery through the dictionary and the failure policy
struct Executor {
    shared: Arc<Shared>,
    dictionary: Arc<TypeDictionary>,
    failure_policy: Arc<dyn FailedMessageProcessor>,
}

impl Executor {
    async fn execute(&self, delivery: &Delivery) -> Outcome {
        let record = &delivery.record;

        let Some(bytes) = record.payload.as_deref() else {
            warn!(
                topic = record.topic.as_str(),
                partition = record.partition,
                offset = record.offset,
                "Skipping record without payload"
            );
            return Outcome::Consumed("malformed");
        };

        let message = match Message::from_bytes(bytes) {
            Ok(message) => Arc::new(message),
            Err(e) => {
                warn!(
                    topic = record.topic.as_str(),
                    partition = record.partition,
                    offset = record.offset,
                    error = ?e,
                    "Skipping record that is not a valid envelope"
                );
                return Outcome::Consumed("malformed");
            }
        };

        let (Some(parser), Some(handler)) = (
            self.dictionary.parser_for(&message.message_type),
            self.dictionary.handler_for(&message.message_type),
        ) else {
            debug!(
                topic = record.topic.as_str(),
                partition = record.partition,
                offset = record.offset,
                message_type = %message.message_type,
                "No handler registered for message type"
            );
            return Outcome::Consumed("unknown_type");
        };

        let context = HandlerContext {
            envelope: message.clone(),
            partition: self.shared.partition.clone(),
            offset: record.offset,
            attempt: delivery.attempt,
        };

        let result = match parser.parse(&message.payload) {
            Ok(payload) => {
                let started = Instant::now();
                let result = AssertUnwindSafe(handler.handle(payload, &context))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(anyhow::anyhow!(
                            "handler panicked: {}",
                            panic_message(panic.as_ref())
                        ))
                    });
                metrics::histogram!(HANDLER_DURATION).record(started.elapsed().as_secs_f64());
                result
            }
            Err(e) => Err(anyhow::Error::new(e).context("failed to parse payload")),
        };

        let Err(error) = result else {
            return Outcome::Consumed("ok");
        };

        let failed = FailedMessage {
            record,
            message_type: &message.message_type,
            attempt: delivery.attempt,
        };
        match self.failure_policy.handle(&failed, &error) {
            FailureDecision::Discard => Outcome::Consumed("discarded"),
            FailureDecision::Retry => Outcome::Retry,
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

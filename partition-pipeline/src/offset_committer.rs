//! Offset Committer - batches commit points and writes them to the transport
//!
//! Commit points come from the partition processors (the highest offset below which
//! every record was handled) or from explicit `offset_committed` calls. They are held as
//! pending until the idle window since the last commit attempt has passed, then written in
//! one synchronous call. Assignment seeds the per-partition watermark, revocation drops
//! every trace of the partition so nothing is ever committed for a partition we lost.
//! A failed commit puts its batch back as pending for the partitions still owned.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::assigned_partitions::AssignedPartitions;
use crate::error::TransportError;
use crate::kafka::transport::ConsumerTransport;
use crate::kafka::types::{OffsetAndMetadata, PartitionAssignment, TopicPartition};
use crate::metrics_consts::OFFSET_COMMITS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The idle window since the last attempt has not passed
    NotDue,
    NothingToCommit,
    Committed(usize),
    Failed,
}

#[derive(Default)]
struct CommitterState {
    /// Next offset to read as last committed or seeded at assignment, `None` if unknown
    watermarks: HashMap<TopicPartition, Option<i64>>,
    pending: HashMap<TopicPartition, OffsetAndMetadata>,
    revoked: HashSet<TopicPartition>,
    last_commit_attempt: Option<Instant>,
}

impl CommitterState {
    fn record_pending(&mut self, partition: TopicPartition, offset: OffsetAndMetadata) -> bool {
        if self.revoked.contains(&partition) {
            return false;
        }

        let watermark = self.watermarks.entry(partition.clone()).or_insert(None);
        if watermark.is_some_and(|committed| offset.offset <= committed) {
            return false;
        }

        if self
            .pending
            .get(&partition)
            .is_some_and(|pending| offset.offset <= pending.offset)
        {
            return false;
        }

        self.pending.insert(partition, offset);
        true
    }
}

pub struct OffsetCommitter {
    idle_duration: Duration,
    state: Mutex<CommitterState>,
}

impl OffsetCommitter {
    pub fn new(idle_duration: Duration) -> Self {
        Self {
            idle_duration,
            state: Mutex::new(CommitterState::default()),
        }
    }

    pub fn partitions_assigned(&self, assignments: &[PartitionAssignment]) {
        let mut state = self.state.lock();
        for assignment in assignments {
            let partition = &assignment.partition;
            debug!(
                partition = %partition,
                position = ?assignment.position,
                "Seeding commit watermark"
            );
            state.revoked.remove(partition);
            state.pending.remove(partition);
            state
                .watermarks
                .insert(partition.clone(), assignment.position);
        }
    }

    pub fn partitions_revoked(&self, partitions: &[TopicPartition]) {
        let mut state = self.state.lock();
        for partition in partitions {
            if state.pending.remove(partition).is_some() {
                info!(partition = %partition, "Dropping pending commit for revoked partition");
            }
            state.watermarks.remove(partition);
            state.revoked.insert(partition.clone());
        }
    }

    /// Record commit points directly. Points at or below what is already committed
    /// or pending are ignored.
    pub fn offset_committed(&self, offsets: HashMap<TopicPartition, OffsetAndMetadata>) {
        let mut state = self.state.lock();
        for (partition, offset) in offsets {
            state.record_pending(partition, offset);
        }
    }

    /// Collect commit points from the processors and commit them, unless the idle window
    /// since the last commit attempt is still running.
    pub fn recommit_offsets(
        &self,
        transport: &dyn ConsumerTransport,
        partitions: &AssignedPartitions,
    ) -> CommitOutcome {
        {
            let state = self.state.lock();
            if let Some(last) = state.last_commit_attempt {
                if last.elapsed() < self.idle_duration {
                    return CommitOutcome::NotDue;
                }
            }
        }

        self.record_processed(partitions.commit_offsets());
        self.commit_pending(transport)
    }

    /// Commit everything pending plus `processed` right away, ignoring the idle window
    pub fn commit_now(
        &self,
        transport: &dyn ConsumerTransport,
        processed: HashMap<TopicPartition, i64>,
    ) -> CommitOutcome {
        self.record_processed(processed);
        self.commit_pending(transport)
    }

    pub fn pending_offset(&self, partition: &TopicPartition) -> Option<i64> {
        self.state.lock().pending.get(partition).map(|o| o.offset)
    }

    pub fn committed_offset(&self, partition: &TopicPartition) -> Option<i64> {
        self.state.lock().watermarks.get(partition).copied().flatten()
    }

    pub fn tracked_partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<TopicPartition> =
            self.state.lock().watermarks.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Processed offsets are the last handled record; the commit point is the one after it
    fn record_processed(&self, processed: HashMap<TopicPartition, i64>) {
        let mut state = self.state.lock();
        for (partition, offset) in processed {
            state.record_pending(partition, OffsetAndMetadata::new(offset + 1));
        }
    }

    fn commit_pending(&self, transport: &dyn ConsumerTransport) -> CommitOutcome {
        let batch = {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                return CommitOutcome::NothingToCommit;
            }
            state.last_commit_attempt = Some(Instant::now());
            std::mem::take(&mut state.pending)
        };

        // The lock is released for the transport call; rebalance callbacks may run meanwhile
        match transport.commit_sync(&batch) {
            Ok(()) => {
                let mut state = self.state.lock();
                for (partition, offset) in &batch {
                    // A revocation during the call already dropped the partition
                    if let Some(watermark) = state.watermarks.get_mut(partition) {
                        *watermark = Some(offset.offset);
                    }
                }
                drop(state);

                debug!(count = batch.len(), "Committed offsets");
                metrics::counter!(OFFSET_COMMITS, "status" => "success").increment(1);
                CommitOutcome::Committed(batch.len())
            }
            Err(e) => {
                warn!(
                    count = batch.len(),
                    error = ?e,
                    "Failed to commit offsets, keeping them pending"
                );
                metrics::counter!(OFFSET_COMMITS, "status" => "failure").increment(1);
                self.restore_failed_batch(transport, batch);
                CommitOutcome::Failed
            }
        }
    }

    /// Put the commit points of a failed batch back as pending, except for partitions the
    /// transport says we no longer own. Those are forgotten entirely.
    fn restore_failed_batch(
        &self,
        transport: &dyn ConsumerTransport,
        batch: HashMap<TopicPartition, OffsetAndMetadata>,
    ) {
        let lost: HashSet<TopicPartition> = batch
            .keys()
            .filter(|partition| {
                matches!(
                    transport.position(partition),
                    Err(TransportError::NotOwner(_))
                )
            })
            .cloned()
            .collect();

        let mut state = self.state.lock();
        for (partition, offset) in batch {
            if lost.contains(&partition) {
                info!(partition = %partition, "Partition no longer owned, forgetting commit state");
                state.watermarks.remove(&partition);
                state.pending.remove(&partition);
                continue;
            }
            // newer points recorded during the call win, revocations during it are honored
            state.record_pending(partition, offset);
        }
    }
}

//! Per-partition buffers deciding which record a processor runs next.
//!
//! Queues are plain state machines driven by their partition worker: the worker adds
//! records, asks for the next ready delivery and reports how each delivery ended. Time is
//! passed in explicitly, so retry scheduling is deterministic in tests.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::kafka::types::RawRecord;

mod eager;
mod priority;

pub use eager::EagerQueue;
pub use priority::PriorityQueue;

/// One attempt at handling a record
#[derive(Debug, Clone)]
pub struct Delivery {
    pub record: Arc<RawRecord>,
    /// Starts at 1
    pub attempt: u32,
}

impl Delivery {
    pub fn offset(&self) -> i64 {
        self.record.offset
    }
}

pub trait MessageQueue: Send {
    fn add(&mut self, record: RawRecord, now: Instant);

    /// The next delivery that may start at `now`, if any
    fn next_ready(&mut self, now: Instant) -> Option<Delivery>;

    /// The record at `offset` was handled and must not be delivered again
    fn consumed(&mut self, offset: i64);

    /// Handling the record at `offset` ended without it being consumed; deliver it again later
    fn processing_ended(&mut self, offset: i64, now: Instant);

    /// When a held record becomes ready again, if one is waiting on a timer
    fn next_deadline(&self) -> Option<Instant>;

    /// Records held by the queue that have not been consumed yet
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Eager,
    Priority,
}

impl QueueKind {
    pub fn build(self, retry_window: Duration) -> Box<dyn MessageQueue> {
        match self {
            QueueKind::Eager => Box::new(EagerQueue::new(retry_window)),
            QueueKind::Priority => Box::new(PriorityQueue::new(retry_window)),
        }
    }
}

impl FromStr for QueueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "eager" => Ok(QueueKind::Eager),
            "priority" => Ok(QueueKind::Priority),
            other => Err(format!("unknown queue kind '{other}', expected eager or priority")),
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Eager => f.write_str("eager"),
            QueueKind::Priority => f.write_str("priority"),
        }
    }
}

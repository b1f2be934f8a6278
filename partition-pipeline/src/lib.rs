//! Partitioned, ordered, at-least-once processing of envelope-wrapped Kafka messages.
//!
//! Every assigned partition gets its own sequential processor fed by a queue that decides
//! the delivery and retry order. Offsets are committed in batches, and only up to the
//! first record that has not been handled yet.
//!
//! Errors local to a record or a partition are logged where they happen and never leave
//! the processor. Only fatal transport errors end the consumer loop.

pub mod assigned_partitions;
pub mod backoff;
pub mod config;
pub mod consumer;
pub mod dictionary;
pub mod envelope;
pub mod error;
pub mod kafka;
pub mod metrics_consts;
pub mod offset_committer;
pub mod partitioner;
pub mod processor;
pub mod producer;
pub mod queue;

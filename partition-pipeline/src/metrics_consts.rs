// ==== Consumer loop ====
/// Counter for records returned by the transport
pub const RECORDS_POLLED: &str = "pipeline_records_polled_total";

/// Counter for transport errors seen by the poll loop, labelled by kind and whether they were fatal
pub const POLL_ERRORS: &str = "pipeline_poll_errors_total";

/// Histogram for the number of records returned by a single poll
pub const POLL_BATCH_SIZE: &str = "pipeline_poll_batch_size";

/// Counter for partitions paused or resumed because a processor backlog filled up
pub const PARTITION_BACKPRESSURE: &str = "pipeline_partition_backpressure_total";

// ==== Processing ====
/// Counter for handled records, labelled by outcome
pub const RECORDS_HANDLED: &str = "pipeline_records_handled_total";

/// Counter for redeliveries of a record after a failed attempt
pub const HANDLER_RETRIES: &str = "pipeline_handler_retries_total";

/// Histogram for handler execution time
pub const HANDLER_DURATION: &str = "pipeline_handler_duration_seconds";

/// Counter for processors that did not drain within the allowed window
pub const DRAIN_TIMEOUTS: &str = "pipeline_processor_drain_timeouts_total";

// ==== Rebalance and commits ====
/// Counter for partition assignments and revocations, labelled by event type
pub const REBALANCE_PARTITIONS: &str = "pipeline_rebalance_partitions_total";

/// Gauge for the number of live partition processors
pub const ACTIVE_PROCESSORS: &str = "pipeline_active_processors";

/// Counter for commit calls issued to the transport, labelled by status
pub const OFFSET_COMMITS: &str = "pipeline_offset_commits_total";

// ==== Producer ====
/// Counter for produced messages, labelled by status
pub const MESSAGES_PRODUCED: &str = "pipeline_messages_produced_total";

use tracing::{error, warn};

use crate::envelope::MessageType;
use crate::kafka::types::RawRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Treat the record as consumed, its offset advances
    Discard,
    /// Redeliver the same record after the retry window
    Retry,
}

/// The delivery whose handler failed
#[derive(Debug)]
pub struct FailedMessage<'a> {
    pub record: &'a RawRecord,
    pub message_type: &'a MessageType,
    pub attempt: u32,
}

/// Decides what happens to a record whose handler returned an error or panicked
pub trait FailedMessageProcessor: Send + Sync {
    fn handle(&self, failed: &FailedMessage<'_>, error: &anyhow::Error) -> FailureDecision;
}

/// Logs the failure and moves on. The default policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardFailedMessages;

impl FailedMessageProcessor for DiscardFailedMessages {
    fn handle(&self, failed: &FailedMessage<'_>, error: &anyhow::Error) -> FailureDecision {
        error!(
            topic = failed.record.topic.as_str(),
            partition = failed.record.partition,
            offset = failed.record.offset,
            message_type = %failed.message_type,
            attempt = failed.attempt,
            "Handler failed, discarding message: {error:#}"
        );
        FailureDecision::Discard
    }
}

/// Redelivers failed records, giving up after `max_attempts` deliveries when a limit is set
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryFailedMessages {
    max_attempts: Option<u32>,
}

impl RetryFailedMessages {
    pub fn forever() -> Self {
        Self { max_attempts: None }
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
        }
    }
}

impl FailedMessageProcessor for RetryFailedMessages {
    fn handle(&self, failed: &FailedMessage<'_>, error: &anyhow::Error) -> FailureDecision {
        if self
            .max_attempts
            .is_some_and(|max_attempts| failed.attempt >= max_attempts)
        {
            error!(
                topic = failed.record.topic.as_str(),
                partition = failed.record.partition,
                offset = failed.record.offset,
                message_type = %failed.message_type,
                attempt = failed.attempt,
                "Handler failed on final attempt, discarding message: {error:#}"
            );
            return FailureDecision::Discard;
        }

        warn!(
            topic = failed.record.topic.as_str(),
            partition = failed.record.partition,
            offset = failed.record.offset,
            message_type = %failed.message_type,
            attempt = failed.attempt,
            "Handler failed, message will be redelivered: {error:#}"
        );
        FailureDecision::Retry
    }
}

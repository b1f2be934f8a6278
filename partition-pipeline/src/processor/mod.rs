mod failure;
mod offsets;
mod partition_processor;

pub use failure::{
    DiscardFailedMessages, FailedMessage, FailedMessageProcessor, FailureDecision,
    RetryFailedMessages,
};
pub use offsets::UncommittedOffsets;
pub use partition_processor::{PartitionProcessor, ProcessorConfig, ProcessorState};

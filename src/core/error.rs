use thiserror::Error;

use crate::core::message::MessageId;
use crate::core::queue::QueueError;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("exiting")]
    Exiting,

    #[error("message body of {size} bytes exceeds limit of {max}")]
    MessageTooLarge { size: usize, max: u64 },

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("message {0} already in flight")]
    AlreadyInFlight(MessageId),

    #[error("message {0} not in flight")]
    NotInFlight(MessageId),

    #[error("message {0} is owned by another client")]
    NotOwner(MessageId),

    #[error("channel has reached its consumer limit of {0}")]
    TooManyConsumers(usize),

    #[error("failed to deliver to {failed} channel(s)")]
    Fanout { failed: usize },

    #[error("topic {0} not found")]
    TopicNotFound(String),

    #[error("channel {0} not found")]
    ChannelNotFound(String),

    #[error("storage failure: {failed} message(s) could not be flushed")]
    FlushFailed { failed: usize },

    #[error("storage failure: {0}")]
    Storage(#[from] QueueError),

    #[error("metadata error: {0}")]
    Metadata(String),
}

//! Backing queues.
//!
//! Every topic and channel overflows from its bounded memory buffer into a
//! [`BackendQueue`]. Durable entities use [`DiskQueue`]; `#ephemeral` ones
//! use [`DummyQueue`], which keeps nothing.

pub mod disk;
pub mod dummy;

pub use disk::{DiskQueue, DiskQueueConfig};
pub use dummy::DummyQueue;

use std::fmt::Debug;
use std::path::PathBuf;

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record in {file} at offset {offset}: length {len}")]
    Corrupt { file: PathBuf, offset: u64, len: u64 },

    #[error("invalid queue metadata {file}: {reason}")]
    Metadata { file: PathBuf, reason: String },

    #[error("record of {0} bytes is outside the accepted size range")]
    RecordSize(usize),

    #[error("queue has failed and needs to be emptied")]
    Failed,

    #[error("queue is closed")]
    Closed,
}

/// Ordered byte-record FIFO used as overflow storage.
///
/// A single reader is assumed; `put` and `read_next` may race freely.
pub trait BackendQueue: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Append one record.
    fn put(&self, data: &[u8]) -> Result<(), QueueError>;

    /// Pop the oldest unread record, `Ok(None)` when fully drained.
    fn read_next(&self) -> Result<Option<Bytes>, QueueError>;

    /// Unread records.
    fn depth(&self) -> u64;

    /// Force data and cursor positions to stable storage.
    fn sync(&self) -> Result<(), QueueError>;

    /// Sync only if the write-count or time threshold has been reached.
    fn sync_if_due(&self) -> Result<(), QueueError> {
        Ok(())
    }

    /// Sync and release file handles. Data stays on disk.
    fn close(&self) -> Result<(), QueueError>;

    /// Close and remove all on-disk state.
    fn delete(&self) -> Result<(), QueueError>;

    /// Drop every unread record and clear a failed state.
    fn empty(&self) -> Result<(), QueueError>;

    /// Whether a storage error has stopped this queue.
    fn is_failed(&self) -> bool;
}

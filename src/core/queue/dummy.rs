use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tracing::debug;

use super::{BackendQueue, QueueError};

/// Backend for `#ephemeral` topics and channels: overflow is dropped.
#[derive(Debug)]
pub struct DummyQueue {
    name: String,
    dropped: AtomicU64,
}

impl DummyQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Records discarded since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl BackendQueue for DummyQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, _data: &[u8]) -> Result<(), QueueError> {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            target: "rillmq::diskqueue",
            queue = %self.name,
            dropped,
            "ephemeral overflow dropped"
        );
        Ok(())
    }

    fn read_next(&self) -> Result<Option<Bytes>, QueueError> {
        Ok(None)
    }

    fn depth(&self) -> u64 {
        0
    }

    fn sync(&self) -> Result<(), QueueError> {
        Ok(())
    }

    fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }

    fn delete(&self) -> Result<(), QueueError> {
        Ok(())
    }

    fn empty(&self) -> Result<(), QueueError> {
        Ok(())
    }

    fn is_failed(&self) -> bool {
        false
    }
}

use std::sync::Arc;

use tokio::sync::Notify;

use crate::config::Options;
use crate::core::guid::GuidFactory;
use crate::core::lookup::LookupNotifier;
use crate::core::message::MESSAGE_HEADER_LEN;
use crate::core::queue::DiskQueueConfig;

/// Process-wide collaborators shared by every topic and channel.
#[derive(Debug)]
pub struct Context {
    pub options: Arc<Options>,
    pub guid: GuidFactory,
    pub lookup: Arc<dyn LookupNotifier>,
    /// Wakes the sync loop when a backing queue or the metadata file has
    /// durable work pending.
    pub sync_requests: Arc<Notify>,
}

impl Context {
    pub fn new(options: Arc<Options>, lookup: Arc<dyn LookupNotifier>) -> Self {
        Self {
            guid: GuidFactory::new(options.node_id),
            options,
            lookup,
            sync_requests: Arc::new(Notify::new()),
        }
    }

    pub fn disk_queue_config(&self) -> DiskQueueConfig {
        DiskQueueConfig {
            data_path: self.options.data_path.clone(),
            max_bytes_per_file: self.options.max_bytes_per_file,
            min_record_size: MESSAGE_HEADER_LEN,
            max_record_size: MESSAGE_HEADER_LEN + self.options.max_msg_size as usize,
            sync_every: self.options.sync_every,
            sync_timeout: self.options.sync_timeout(),
            sync_signal: Some(Arc::clone(&self.sync_requests)),
        }
    }
}

//! Cluster directory notifications.
//!
//! The broker only announces topology changes; nothing here feeds back into
//! queue state.

use std::fmt::Debug;

use tracing::info;

pub trait LookupNotifier: Send + Sync + Debug {
    fn topic_created(&self, topic: &str);
    fn topic_deleted(&self, topic: &str);
    fn channel_created(&self, topic: &str, channel: &str);
    fn channel_deleted(&self, topic: &str, channel: &str);
}

/// Logs each event against the configured lookup addresses.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier {
    addresses: Vec<String>,
}

impl LoggingNotifier {
    pub fn new(addresses: Vec<String>) -> Self {
        Self { addresses }
    }

    fn announce(&self, event: &str, topic: &str, channel: Option<&str>) {
        if self.addresses.is_empty() {
            return;
        }
        info!(
            target: "rillmq::lookup",
            event,
            topic,
            channel = channel.unwrap_or(""),
            lookupd = ?self.addresses,
            "topology change"
        );
    }
}

impl LookupNotifier for LoggingNotifier {
    fn topic_created(&self, topic: &str) {
        self.announce("topic_created", topic, None);
    }

    fn topic_deleted(&self, topic: &str) {
        self.announce("topic_deleted", topic, None);
    }

    fn channel_created(&self, topic: &str, channel: &str) {
        self.announce("channel_created", topic, Some(channel));
    }

    fn channel_deleted(&self, topic: &str, channel: &str) {
        self.announce("channel_deleted", topic, Some(channel));
    }
}

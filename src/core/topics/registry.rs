use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use crate::core::channel::Channel;
use crate::core::context::Context;
use crate::core::error::BrokerError;
use crate::core::metadata::{Metadata, MetadataStore};
use crate::core::names;
use crate::core::stats::TopicStats;
use crate::core::topics::topic::{Topic, TopicName};

/// [`TopicRegistry`] is the process-wide table of topics.
///
/// Lookups go through the DashMap and never contend with publishes.
/// Structural changes (create/delete) are additionally serialized by
/// `structure` so that metadata snapshots never observe a half-created
/// topic.
#[derive(Debug)]
pub struct TopicRegistry {
    ctx: Arc<Context>,
    topics: DashMap<TopicName, Arc<Topic>>,
    structure: Mutex<()>,
    store: Arc<dyn MetadataStore>,
    loading: AtomicBool,
    exiting: AtomicBool,
    metadata_dirty: AtomicBool,
    self_ref: Weak<TopicRegistry>,
}

impl TopicRegistry {
    /// Creates a new empty [`TopicRegistry`].
    pub fn new(ctx: Arc<Context>, store: Arc<dyn MetadataStore>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            ctx,
            topics: DashMap::new(),
            structure: Mutex::new(()),
            store,
            loading: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            metadata_dirty: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Refuse further topic creation.
    pub fn begin_exit(&self) {
        self.exiting.store(true, Ordering::SeqCst);
    }

    /// Attempts to get an existing topic by name.
    pub fn get_topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.get(name).map(|entry| Arc::clone(&*entry))
    }

    /// Returns an existing topic or creates a new one if it doesn't exist.
    pub fn create_or_get_topic(&self, name: &str) -> Result<Arc<Topic>, BrokerError> {
        if let Some(topic) = self.get_topic(name) {
            return Ok(topic);
        }
        if !names::is_valid_name(name) {
            return Err(BrokerError::InvalidName(name.to_string()));
        }
        if self.is_exiting() {
            return Err(BrokerError::Exiting);
        }

        let topic = {
            let _structure = self.structure.lock();
            if let Some(topic) = self.get_topic(name) {
                return Ok(topic);
            }
            let topic = Topic::new(name, Arc::clone(&self.ctx), self.self_ref.clone())?;
            self.topics.insert(name.to_string(), Arc::clone(&topic));
            topic
        };

        info!(target: "rillmq::daemon", topic = %name, "created topic");
        if !self.is_loading() {
            self.ctx.lookup.topic_created(name);
            self.request_persist();
        }
        Ok(topic)
    }

    /// Lists all topic names currently registered.
    pub fn list_topics(&self) -> Vec<TopicName> {
        let mut names: Vec<TopicName> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn topics(&self) -> Vec<Arc<Topic>> {
        self.topics.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Every channel of every topic, for the scan loop.
    pub fn all_channels(&self) -> Vec<Arc<Channel>> {
        self.topics()
            .iter()
            .flat_map(|t| t.channels())
            .collect()
    }

    /// Removes a topic and everything it holds, including on-disk data.
    pub fn delete_topic(&self, name: &str) -> Result<(), BrokerError> {
        let removed = {
            let _structure = self.structure.lock();
            self.topics.remove(name).map(|(_, topic)| topic)
        };
        let topic = removed.ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))?;

        let result = topic.exit(true);
        self.ctx.lookup.topic_deleted(name);
        self.request_persist();
        result
    }

    /// Recreate topics and channels recorded by a previous process.
    pub fn load_metadata(&self) -> Result<(), BrokerError> {
        let Some(metadata) = self.store.load()? else {
            return Ok(());
        };

        self.loading.store(true, Ordering::SeqCst);
        let result = self.restore(&metadata);
        self.loading.store(false, Ordering::SeqCst);
        result?;

        // Backlogs are only drained once every channel exists, so each of
        // them receives the same messages.
        for topic in self.topics() {
            topic.flush_backlog();
        }
        self.persist_metadata()
    }

    fn restore(&self, metadata: &Metadata) -> Result<(), BrokerError> {
        for entry in &metadata.topics {
            if !names::is_valid_name(&entry.name) || names::is_ephemeral(&entry.name) {
                warn!(target: "rillmq::daemon", topic = %entry.name, "skipping topic from metadata");
                continue;
            }
            let topic = self.create_or_get_topic(&entry.name)?;
            if entry.paused {
                topic.pause();
            }
            for channel in &entry.channels {
                if !names::is_valid_name(&channel.name) || names::is_ephemeral(&channel.name) {
                    warn!(
                        target: "rillmq::daemon",
                        topic = %entry.name,
                        channel = %channel.name,
                        "skipping channel from metadata"
                    );
                    continue;
                }
                let ch = topic.get_channel(&channel.name)?;
                if channel.paused {
                    ch.pause();
                }
            }
        }
        Ok(())
    }

    /// A consistent view of every durable topic and channel.
    pub fn snapshot(&self) -> Metadata {
        let _structure = self.structure.lock();
        let mut topics: Vec<_> = self
            .topics()
            .iter()
            .filter(|t| !t.is_ephemeral())
            .map(|t| t.metadata())
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Metadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
            topics,
        }
    }

    pub fn persist_metadata(&self) -> Result<(), BrokerError> {
        if self.is_loading() {
            return Ok(());
        }
        self.store.save(&self.snapshot())
    }

    /// Mark the metadata file stale. The sync loop rewrites it off the
    /// async workers; shutdown writes it regardless.
    pub fn request_persist(&self) {
        if self.is_loading() {
            return;
        }
        self.metadata_dirty.store(true, Ordering::SeqCst);
        self.ctx.sync_requests.notify_one();
    }

    pub fn metadata_dirty(&self) -> bool {
        self.metadata_dirty.load(Ordering::SeqCst)
    }

    /// Write the metadata file if a change was requested since the last write.
    pub fn persist_if_dirty(&self) {
        if !self.metadata_dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.persist_metadata() {
            self.metadata_dirty.store(true, Ordering::SeqCst);
            error!(target: "rillmq::daemon", error = %err, "failed to persist metadata");
        }
    }

    /// Topic stats sorted by name.
    pub fn stats(&self) -> Vec<TopicStats> {
        let mut stats: Vec<_> = self.topics().iter().map(|t| t.stats()).collect();
        stats.sort_by(|a, b| a.topic_name.cmp(&b.topic_name));
        stats
    }

    /// Give every backing queue a chance to fsync on its timer.
    pub fn sync_backends(&self) {
        for topic in self.topics() {
            if let Err(err) = topic.backend().sync_if_due() {
                warn!(target: "rillmq::daemon", topic = %topic.name(), error = %err, "backend sync failed");
            }
            for channel in topic.channels() {
                if let Err(err) = channel.backend().sync_if_due() {
                    warn!(
                        target: "rillmq::daemon",
                        topic = %topic.name(),
                        channel = %channel.name(),
                        error = %err,
                        "backend sync failed"
                    );
                }
            }
        }
    }

    /// Move every memory buffer into its backing queue.
    pub fn flush_all(&self) {
        for topic in self.topics() {
            if let Err(err) = topic.flush() {
                error!(target: "rillmq::daemon", topic = %topic.name(), error = %err, "topic flush failed");
            }
            for channel in topic.channels() {
                if let Err(err) = channel.flush() {
                    error!(
                        target: "rillmq::daemon",
                        topic = %topic.name(),
                        channel = %channel.name(),
                        error = %err,
                        "channel flush failed"
                    );
                }
            }
        }
    }

    /// Close every topic and channel, syncing their backing queues.
    pub fn close_all(&self) {
        self.begin_exit();
        for topic in self.topics() {
            if let Err(err) = topic.exit(false) {
                error!(target: "rillmq::daemon", topic = %topic.name(), error = %err, "topic close failed");
            }
        }
        debug!(target: "rillmq::daemon", "all topics closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::core::lookup::LoggingNotifier;
    use crate::core::message::Message;
    use crate::core::metadata::JsonFileStore;
    use bytes::Bytes;

    fn registry(dir: &std::path::Path) -> Arc<TopicRegistry> {
        let options = Options {
            data_path: dir.to_path_buf(),
            ..Options::default()
        };
        let ctx = Arc::new(Context::new(
            Arc::new(options),
            Arc::new(LoggingNotifier::default()),
        ));
        TopicRegistry::new(ctx, Arc::new(JsonFileStore::new(dir)))
    }

    #[test]
    fn create_is_idempotent_and_validates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry(dir.path());
        let a = reg.create_or_get_topic("t1").expect("create");
        let b = reg.create_or_get_topic("t1").expect("get");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            reg.create_or_get_topic("bad name"),
            Err(BrokerError::InvalidName(_))
        ));
        assert_eq!(reg.list_topics(), vec!["t1".to_string()]);
    }

    #[test]
    fn structural_changes_defer_the_metadata_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry(dir.path());
        let file = dir.path().join(crate::core::metadata::METADATA_FILE);
        assert!(!reg.metadata_dirty());

        reg.create_or_get_topic("orders").expect("topic");
        assert!(reg.metadata_dirty());
        assert!(!file.exists());

        reg.persist_if_dirty();
        assert!(!reg.metadata_dirty());
        let raw = std::fs::read_to_string(&file).expect("metadata");
        assert!(raw.contains("\"orders\""), "{raw}");
    }

    #[test]
    fn metadata_round_trips_through_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let reg = registry(dir.path());
            let topic = reg.create_or_get_topic("orders").expect("topic");
            topic.get_channel("billing").expect("billing").pause();
            topic.get_channel("audit").expect("audit");
            topic.get_channel("live#ephemeral").expect("ephemeral");
            reg.create_or_get_topic("scratch#ephemeral").expect("ephemeral topic");
            topic.pause();
            reg.flush_all();
            reg.persist_metadata().expect("persist");
            reg.close_all();
        }

        let reg = registry(dir.path());
        reg.load_metadata().expect("load");
        assert_eq!(reg.list_topics(), vec!["orders".to_string()]);
        let topic = reg.get_topic("orders").expect("restored");
        assert!(topic.is_paused());
        let mut names: Vec<_> = topic.channels().iter().map(|c| c.name().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["audit", "billing"]);
        assert!(topic.channel("billing").expect("billing").is_paused());
    }

    #[test]
    fn restart_delivers_topic_backlog_to_every_restored_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let reg = registry(dir.path());
            let topic = reg.create_or_get_topic("t").expect("topic");
            topic.get_channel("a").expect("a");
            topic.get_channel("b").expect("b");
            topic.pause();
            let id = reg.context().guid.next_id();
            topic
                .publish(Message::new(id, Bytes::from_static(b"kept")))
                .expect("publish");
            reg.flush_all();
            reg.persist_metadata().expect("persist");
            reg.close_all();
        }

        let reg = registry(dir.path());
        reg.load_metadata().expect("load");
        let topic = reg.get_topic("t").expect("topic");
        topic.unpause();
        for name in ["a", "b"] {
            let ch = topic.channel(name).expect("channel");
            let msg = ch.pop_queued().expect("backlog delivered");
            assert_eq!(msg.body().as_ref(), b"kept");
        }
    }

    #[test]
    fn deleting_last_ephemeral_channel_removes_ephemeral_topic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry(dir.path());
        let topic = reg.create_or_get_topic("tmp#ephemeral").expect("topic");
        topic.get_channel("c#ephemeral").expect("channel");
        topic.delete_channel("c#ephemeral").expect("delete");
        assert!(reg.get_topic("tmp#ephemeral").is_none());
    }

    #[test]
    fn delete_topic_removes_data_and_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry(dir.path());
        reg.create_or_get_topic("gone").expect("topic").get_channel("c").expect("c");
        assert_eq!(reg.all_channels().len(), 1);
        reg.delete_topic("gone").expect("delete");
        assert!(reg.get_topic("gone").is_none());
        assert!(reg.all_channels().is_empty());
        assert!(matches!(
            reg.delete_topic("gone"),
            Err(BrokerError::TopicNotFound(_))
        ));
    }
}

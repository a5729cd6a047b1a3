use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::core::channel::Channel;
use crate::core::context::Context;
use crate::core::error::BrokerError;
use crate::core::message::Message;
use crate::core::metadata::{ChannelMetadata, TopicMetadata};
use crate::core::names;
use crate::core::queue::{BackendQueue, DiskQueue, DummyQueue};
use crate::core::stats::TopicStats;
use crate::core::topics::registry::TopicRegistry;

/// Alias for a topic name.
pub type TopicName = String;

/// A named stream fanned out to every attached channel.
///
/// All publishes go through the `router` lock, so exactly one publish is
/// being fanned out at a time and every channel observes the same order.
/// While the topic is paused or has no channels, publishes accumulate in
/// the topic's own buffer and backing queue; that backlog is drained into
/// the channels once delivery is possible again.
///
/// Lock order: `router`, then `channels`, then any channel-internal lock.
#[derive(Debug)]
pub struct Topic {
    name: TopicName,
    ephemeral: bool,
    ctx: Arc<Context>,
    registry: Weak<TopicRegistry>,
    self_ref: Weak<Topic>,

    channels: RwLock<Vec<Arc<Channel>>>,
    router: Mutex<VecDeque<Arc<Message>>>,
    backend: Box<dyn BackendQueue>,

    paused: AtomicBool,
    exiting: AtomicBool,
    message_count: AtomicU64,
    message_bytes: AtomicU64,
}

impl Topic {
    pub fn new(
        name: &str,
        ctx: Arc<Context>,
        registry: Weak<TopicRegistry>,
    ) -> Result<Arc<Self>, BrokerError> {
        if !names::is_valid_name(name) {
            return Err(BrokerError::InvalidName(name.to_string()));
        }
        let ephemeral = names::is_ephemeral(name);
        let backend: Box<dyn BackendQueue> = if ephemeral {
            Box::new(DummyQueue::new(name))
        } else {
            Box::new(DiskQueue::open(name, ctx.disk_queue_config())?)
        };

        Ok(Arc::new_cyclic(|self_ref| Self {
            name: name.to_string(),
            ephemeral,
            ctx,
            registry,
            self_ref: self_ref.clone(),
            channels: RwLock::new(Vec::new()),
            router: Mutex::new(VecDeque::new()),
            backend,
            paused: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            message_count: AtomicU64::new(0),
            message_bytes: AtomicU64::new(0),
        }))
    }

    /// Returns the topic's name.
    pub fn name(&self) -> &TopicName {
        &self.name
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    pub fn backend(&self) -> &dyn BackendQueue {
        self.backend.as_ref()
    }

    fn registry_loading(&self) -> bool {
        self.registry
            .upgrade()
            .map(|r| r.is_loading())
            .unwrap_or(false)
    }

    fn persist(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.request_persist();
        }
    }

    // ───────────────────────────────────────────────────────────
    // Publishing
    // ───────────────────────────────────────────────────────────

    pub fn publish(&self, message: Message) -> Result<(), BrokerError> {
        self.publish_multiple(vec![message])
    }

    /// Fan a batch out as one unit: no other publish on this topic
    /// interleaves with it.
    pub fn publish_multiple(&self, messages: Vec<Message>) -> Result<(), BrokerError> {
        if self.is_exiting() {
            return Err(BrokerError::Exiting);
        }
        let max = self.ctx.options.max_msg_size;
        if let Some(oversized) = messages.iter().find(|m| m.body().len() as u64 > max) {
            return Err(BrokerError::MessageTooLarge {
                size: oversized.body().len(),
                max,
            });
        }

        let mut backlog = self.router.lock();
        if self.is_exiting() {
            return Err(BrokerError::Exiting);
        }
        let channels = self.channels.read().clone();

        for message in &messages {
            self.message_count.fetch_add(1, Ordering::Relaxed);
            self.message_bytes
                .fetch_add(message.body().len() as u64, Ordering::Relaxed);
        }

        if self.is_paused() || channels.is_empty() {
            for message in messages {
                self.buffer_locked(&mut backlog, Arc::new(message))?;
            }
            return Ok(());
        }

        let mut failed = self.drain_backlog_locked(&mut backlog, &channels);
        for message in messages {
            failed += self.fan_out(Arc::new(message), &channels)?;
        }
        if failed > 0 {
            return Err(BrokerError::Fanout { failed });
        }
        Ok(())
    }

    fn buffer_locked(
        &self,
        backlog: &mut VecDeque<Arc<Message>>,
        message: Arc<Message>,
    ) -> Result<(), BrokerError> {
        if backlog.len() < self.ctx.options.mem_queue_size {
            backlog.push_back(message);
            return Ok(());
        }
        self.backend.put(&message.encode()).map_err(|err| {
            error!(
                target: "rillmq::topic",
                topic = %self.name,
                message_id = %message.id(),
                error = %err,
                "failed to write message to backend"
            );
            BrokerError::Storage(err)
        })
    }

    /// Returns the number of channels the message could not be stored in,
    /// or `Exiting` once the topic itself has started closing its channels.
    fn fan_out(
        &self,
        message: Arc<Message>,
        channels: &[Arc<Channel>],
    ) -> Result<usize, BrokerError> {
        let mut failed = 0;
        for channel in channels {
            match channel.put(Arc::clone(&message)) {
                Ok(()) => {}
                Err(BrokerError::Exiting) if self.is_exiting() => return Err(BrokerError::Exiting),
                // deleted between snapshot and put
                Err(BrokerError::Exiting) => {}
                Err(err) => {
                    failed += 1;
                    warn!(
                        target: "rillmq::topic",
                        topic = %self.name,
                        channel = %channel.name(),
                        message_id = %message.id(),
                        error = %err,
                        "channel rejected message"
                    );
                }
            }
        }
        Ok(failed)
    }

    fn pop_backlog_locked(&self, backlog: &mut VecDeque<Arc<Message>>) -> Option<Arc<Message>> {
        if let Some(message) = backlog.pop_front() {
            return Some(message);
        }
        loop {
            match self.backend.read_next() {
                Ok(Some(raw)) => match Message::decode(raw) {
                    Ok(message) => return Some(Arc::new(message)),
                    Err(err) => error!(
                        target: "rillmq::topic",
                        topic = %self.name,
                        error = %err,
                        "skipping undecodable backend record"
                    ),
                },
                Ok(None) => return None,
                Err(err) => {
                    debug!(target: "rillmq::topic", topic = %self.name, error = %err, "backend read stopped");
                    return None;
                }
            }
        }
    }

    fn drain_backlog_locked(
        &self,
        backlog: &mut VecDeque<Arc<Message>>,
        channels: &[Arc<Channel>],
    ) -> usize {
        let mut drained = 0usize;
        let mut failed = 0;
        while let Some(message) = self.pop_backlog_locked(backlog) {
            match self.fan_out(Arc::clone(&message), channels) {
                Ok(n) => failed += n,
                Err(_) => {
                    // Exit flushes the backlog to disk once this lock is released.
                    backlog.push_front(message);
                    break;
                }
            }
            drained += 1;
        }
        if drained > 0 {
            debug!(
                target: "rillmq::topic",
                topic = %self.name,
                drained,
                "delivered topic backlog to channels"
            );
        }
        failed
    }

    /// Hand any buffered publishes to the channels, if delivery is possible.
    pub fn flush_backlog(&self) {
        let mut backlog = self.router.lock();
        if self.is_paused() || self.is_exiting() {
            return;
        }
        let channels = self.channels.read().clone();
        if channels.is_empty() {
            return;
        }
        let failed = self.drain_backlog_locked(&mut backlog, &channels);
        if failed > 0 {
            warn!(target: "rillmq::topic", topic = %self.name, failed, "backlog delivery incomplete");
        }
    }

    // ───────────────────────────────────────────────────────────
    // Channels
    // ───────────────────────────────────────────────────────────

    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.read().clone()
    }

    /// Return the named channel, creating it on first use.
    pub fn get_channel(&self, name: &str) -> Result<Arc<Channel>, BrokerError> {
        if let Some(existing) = self.channel(name) {
            return Ok(existing);
        }
        if !names::is_valid_name(name) {
            return Err(BrokerError::InvalidName(name.to_string()));
        }
        if self.is_exiting() {
            return Err(BrokerError::Exiting);
        }

        let created = {
            let mut channels = self.channels.write();
            if let Some(existing) = channels.iter().find(|c| c.name() == name) {
                return Ok(Arc::clone(existing));
            }
            let channel = Arc::new(Channel::new(
                &self.name,
                name,
                Arc::clone(&self.ctx),
                self.self_ref.clone(),
            )?);
            channels.push(Arc::clone(&channel));
            channel
        };

        info!(target: "rillmq::topic", topic = %self.name, channel = %name, "created channel");
        if !self.registry_loading() {
            self.ctx.lookup.channel_created(&self.name, name);
            self.persist();
            self.flush_backlog();
        }
        Ok(created)
    }

    /// Remove a channel and discard everything it holds.
    pub fn delete_channel(&self, name: &str) -> Result<(), BrokerError> {
        let (removed, now_empty) = {
            let mut channels = self.channels.write();
            let idx = channels
                .iter()
                .position(|c| c.name() == name)
                .ok_or_else(|| BrokerError::ChannelNotFound(name.to_string()))?;
            let removed = channels.remove(idx);
            (removed, channels.is_empty())
        };
        self.finish_channel_removal(removed, now_empty)
    }

    /// Delete an ephemeral channel only if no client has attached since the
    /// last one left.
    pub fn reap_ephemeral_channel(&self, name: &str) -> Result<(), BrokerError> {
        let (removed, now_empty) = {
            let mut channels = self.channels.write();
            let Some(idx) = channels
                .iter()
                .position(|c| c.name() == name && c.is_ephemeral() && c.client_count() == 0)
            else {
                return Ok(());
            };
            let removed = channels.remove(idx);
            (removed, channels.is_empty())
        };
        self.finish_channel_removal(removed, now_empty)
    }

    fn finish_channel_removal(
        &self,
        removed: Arc<Channel>,
        now_empty: bool,
    ) -> Result<(), BrokerError> {
        let deleted = removed.delete();
        info!(target: "rillmq::topic", topic = %self.name, channel = %removed.name(), "deleted channel");
        self.ctx.lookup.channel_deleted(&self.name, removed.name());
        self.persist();

        if self.ephemeral && now_empty && !self.is_exiting() {
            if let Some(registry) = self.registry.upgrade() {
                if let Err(err) = registry.delete_topic(&self.name) {
                    debug!(target: "rillmq::topic", topic = %self.name, error = %err, "ephemeral topic already gone");
                }
            }
        }
        deleted
    }

    // ───────────────────────────────────────────────────────────
    // Administrative
    // ───────────────────────────────────────────────────────────

    pub fn pause(&self) {
        self.set_paused(true);
    }

    pub fn unpause(&self) {
        self.set_paused(false);
        self.flush_backlog();
    }

    fn set_paused(&self, paused: bool) {
        // Taking the router lock orders the flag change against in-progress fan-outs.
        let router = self.router.lock();
        self.paused.store(paused, Ordering::SeqCst);
        drop(router);
        self.persist();
    }

    /// Discard the topic's own backlog. Channels are untouched.
    pub fn empty(&self) -> Result<(), BrokerError> {
        let mut backlog = self.router.lock();
        backlog.clear();
        self.backend.empty()?;
        Ok(())
    }

    pub fn depth(&self) -> u64 {
        self.router.lock().len() as u64 + self.backend.depth()
    }

    /// Write the in-memory backlog to the backing queue.
    pub fn flush(&self) -> Result<(), BrokerError> {
        let mut backlog = self.router.lock();
        let mut failed = 0usize;
        let count = backlog.len();
        for message in backlog.drain(..) {
            if let Err(err) = self.backend.put(&message.encode()) {
                failed += 1;
                error!(
                    target: "rillmq::topic",
                    topic = %self.name,
                    message_id = %message.id(),
                    error = %err,
                    "failed to flush message to backend"
                );
            }
        }
        if count > 0 {
            debug!(target: "rillmq::topic", topic = %self.name, count, failed, "flushed topic backlog");
        }
        if failed > 0 {
            return Err(BrokerError::FlushFailed { failed });
        }
        Ok(())
    }

    /// Stop accepting publishes. With `delete_data` every channel and all
    /// on-disk state is removed; otherwise buffers are flushed and the
    /// backing queues closed so a restart resumes where this left off.
    pub fn exit(&self, delete_data: bool) -> Result<(), BrokerError> {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if delete_data {
            info!(target: "rillmq::topic", topic = %self.name, "deleting topic");
        } else {
            info!(target: "rillmq::topic", topic = %self.name, "closing topic");
        }

        let channels: Vec<Arc<Channel>> = if delete_data {
            std::mem::take(&mut *self.channels.write())
        } else {
            self.channels.read().clone()
        };

        let mut first_err = None;
        for channel in &channels {
            let result = if delete_data {
                self.ctx.lookup.channel_deleted(&self.name, channel.name());
                channel.delete()
            } else {
                channel.close()
            };
            if let Err(err) = result {
                warn!(
                    target: "rillmq::topic",
                    topic = %self.name,
                    channel = %channel.name(),
                    error = %err,
                    "channel shutdown failed"
                );
                first_err.get_or_insert(err);
            }
        }

        if delete_data {
            self.router.lock().clear();
            self.backend.delete()?;
        } else {
            if let Err(err) = self.flush() {
                first_err.get_or_insert(err);
            }
            self.backend.close()?;
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn metadata(&self) -> TopicMetadata {
        TopicMetadata {
            name: self.name.clone(),
            paused: self.is_paused(),
            channels: self
                .channels
                .read()
                .iter()
                .filter(|c| !c.is_ephemeral())
                .map(|c| ChannelMetadata {
                    name: c.name().to_string(),
                    paused: c.is_paused(),
                })
                .collect(),
        }
    }

    pub fn stats(&self) -> TopicStats {
        TopicStats {
            topic_name: self.name.clone(),
            depth: self.depth(),
            backend_depth: self.backend.depth(),
            message_count: self.message_count.load(Ordering::Relaxed),
            message_bytes: self.message_bytes.load(Ordering::Relaxed),
            paused: self.is_paused(),
            channels: self.channels.read().iter().map(|c| c.stats()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::core::lookup::LoggingNotifier;
    use bytes::Bytes;
    use std::time::Duration;

    fn context(dir: &std::path::Path) -> Arc<Context> {
        let options = Options {
            data_path: dir.to_path_buf(),
            mem_queue_size: 2,
            max_msg_size: 16,
            ..Options::default()
        };
        Arc::new(Context::new(
            Arc::new(options),
            Arc::new(LoggingNotifier::default()),
        ))
    }

    fn msg(ctx: &Context, body: &'static str) -> Message {
        Message::new(ctx.guid.next_id(), Bytes::from_static(body.as_bytes()))
    }

    fn drain(channel: &Channel) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(m) = channel.pop_queued() {
            out.push(String::from_utf8_lossy(m.body()).into_owned());
        }
        out
    }

    #[test]
    fn closing_topic_refuses_instead_of_dropping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let topic = Topic::new("t1", Arc::clone(&ctx), Weak::new()).expect("topic");
        let channel = topic.get_channel("a").expect("a");
        let channels = topic.channels();
        channel.close().expect("close channel");

        // A channel deleted on its own is skipped.
        let skipped = topic
            .fan_out(Arc::new(msg(&ctx, "x")), &channels)
            .expect("channel gone, topic alive");
        assert_eq!(skipped, 0);

        // Once the topic is closing, the publisher hears about it.
        topic.exiting.store(true, Ordering::SeqCst);
        assert!(matches!(
            topic.fan_out(Arc::new(msg(&ctx, "y")), &channels),
            Err(BrokerError::Exiting)
        ));
        assert!(matches!(
            topic.publish(msg(&ctx, "z")),
            Err(BrokerError::Exiting)
        ));
    }

    #[test]
    fn every_channel_gets_every_message_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let topic = Topic::new("t1", Arc::clone(&ctx), Weak::new()).expect("topic");
        let a = topic.get_channel("a").expect("a");
        let b = topic.get_channel("b").expect("b");

        topic.publish(msg(&ctx, "one")).expect("publish");
        topic
            .publish_multiple(vec![msg(&ctx, "two"), msg(&ctx, "three")])
            .expect("mpub");

        assert_eq!(drain(&a), vec!["one", "two", "three"]);
        assert_eq!(drain(&b), vec!["one", "two", "three"]);
        assert_eq!(topic.stats().message_count, 3);
    }

    #[test]
    fn late_channel_only_sees_later_messages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let topic = Topic::new("t1", Arc::clone(&ctx), Weak::new()).expect("topic");
        let early = topic.get_channel("early").expect("early");
        topic.publish(msg(&ctx, "before")).expect("publish");
        let late = topic.get_channel("late").expect("late");
        topic.publish(msg(&ctx, "after")).expect("publish");

        assert_eq!(drain(&early), vec!["before", "after"]);
        assert_eq!(drain(&late), vec!["after"]);
    }

    #[test]
    fn backlog_without_channels_is_drained_into_the_first_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let topic = Topic::new("t1", Arc::clone(&ctx), Weak::new()).expect("topic");
        for body in ["a", "b", "c"] {
            topic.publish(msg(&ctx, body)).expect("publish");
        }
        // mem_queue_size is 2, so one message overflowed to disk.
        assert_eq!(topic.backend().depth(), 1);
        assert_eq!(topic.depth(), 3);

        let ch = topic.get_channel("c").expect("channel");
        assert_eq!(topic.depth(), 0);
        assert_eq!(drain(&ch), vec!["a", "b", "c"]);
    }

    #[test]
    fn paused_topic_buffers_until_unpaused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let topic = Topic::new("t1", Arc::clone(&ctx), Weak::new()).expect("topic");
        let ch = topic.get_channel("c").expect("channel");
        topic.pause();
        topic.publish(msg(&ctx, "held")).expect("publish while paused");
        assert_eq!(ch.depth(), 0);

        topic.unpause();
        assert_eq!(drain(&ch), vec!["held"]);
    }

    #[test]
    fn oversized_body_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let topic = Topic::new("t1", Arc::clone(&ctx), Weak::new()).expect("topic");
        let err = topic
            .publish(msg(&ctx, "this body is way past sixteen bytes"))
            .expect_err("too large");
        assert!(matches!(err, BrokerError::MessageTooLarge { max: 16, .. }));
    }

    #[test]
    fn deferred_publish_lands_in_deferred_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let topic = Topic::new("t1", Arc::clone(&ctx), Weak::new()).expect("topic");
        let ch = topic.get_channel("c").expect("channel");
        topic
            .publish(msg(&ctx, "later").with_deferred(Duration::from_secs(30)))
            .expect("dpub");
        assert_eq!(ch.depth(), 0);
        assert_eq!(ch.deferred_count(), 1);
    }

    #[test]
    fn delete_channel_and_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let topic = Topic::new("t1", Arc::clone(&ctx), Weak::new()).expect("topic");
        topic.get_channel("a").expect("a");
        topic.delete_channel("a").expect("delete");
        assert!(matches!(
            topic.delete_channel("a"),
            Err(BrokerError::ChannelNotFound(_))
        ));

        topic.exit(false).expect("exit");
        assert!(matches!(topic.publish(msg(&ctx, "x")), Err(BrokerError::Exiting)));
    }

    #[test]
    fn metadata_skips_ephemeral_channels() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path());
        let topic = Topic::new("t1", Arc::clone(&ctx), Weak::new()).expect("topic");
        topic.get_channel("durable").expect("durable");
        topic.get_channel("tmp#ephemeral").expect("ephemeral");
        topic.channel("durable").expect("present").pause();

        let meta = topic.metadata();
        assert_eq!(meta.channels.len(), 1);
        assert_eq!(meta.channels[0].name, "durable");
        assert!(meta.channels[0].paused);
    }
}

//! Per-consumer-group delivery queue.
//!
//! A message in a channel is in exactly one of four places: the memory
//! buffer, the backing queue, the in-flight table or the deferred table.
//! Buffer and tracking state each sit behind their own lock; the scan loop
//! and client commands only ever contend on the channel they touch.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::core::client::{ClientId, ClientState};
use crate::core::context::Context;
use crate::core::error::BrokerError;
use crate::core::message::{Message, MessageId};
use crate::core::names;
use crate::core::pqueue::DeadlineQueue;
use crate::core::queue::{BackendQueue, DiskQueue, DummyQueue, QueueError};
use crate::core::stats::ChannelStats;
use crate::core::topics::Topic;

#[derive(Debug)]
struct InFlight {
    message: Arc<Message>,
    client_id: ClientId,
    delivered_at: Instant,
    deadline: Instant,
}

#[derive(Debug)]
struct Deferred {
    message: Arc<Message>,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Tracking {
    in_flight: HashMap<MessageId, InFlight>,
    in_flight_pq: DeadlineQueue,
    deferred: HashMap<MessageId, Deferred>,
    deferred_pq: DeadlineQueue,
}

#[derive(Debug)]
pub struct Channel {
    topic_name: String,
    name: String,
    ephemeral: bool,
    ctx: Arc<Context>,
    topic: Weak<Topic>,

    memory: Mutex<VecDeque<Arc<Message>>>,
    backend: Box<dyn BackendQueue>,
    tracking: Mutex<Tracking>,
    clients: RwLock<HashMap<ClientId, Arc<ClientState>>>,

    paused: AtomicBool,
    exiting: AtomicBool,
    ready: Notify,

    message_count: AtomicU64,
    requeue_count: AtomicU64,
    timeout_count: AtomicU64,
}

impl Channel {
    pub fn new(
        topic_name: &str,
        name: &str,
        ctx: Arc<Context>,
        topic: Weak<Topic>,
    ) -> Result<Self, BrokerError> {
        if !names::is_valid_name(name) {
            return Err(BrokerError::InvalidName(name.to_string()));
        }
        let ephemeral = names::is_ephemeral(name);
        let backend_name = format!("{topic_name}:{name}");
        let backend: Box<dyn BackendQueue> = if ephemeral {
            Box::new(DummyQueue::new(backend_name))
        } else {
            Box::new(DiskQueue::open(backend_name, ctx.disk_queue_config())?)
        };

        Ok(Self {
            topic_name: topic_name.to_string(),
            name: name.to_string(),
            ephemeral,
            ctx,
            topic,
            memory: Mutex::new(VecDeque::new()),
            backend,
            tracking: Mutex::new(Tracking::default()),
            clients: RwLock::new(HashMap::new()),
            paused: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            ready: Notify::new(),
            message_count: AtomicU64::new(0),
            requeue_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn backend(&self) -> &dyn BackendQueue {
        self.backend.as_ref()
    }

    // ───────────────────────────────────────────────────────────
    // Queued state
    // ───────────────────────────────────────────────────────────

    /// Accept a message from the topic router. Messages published with a
    /// delay go straight to the deferred table.
    pub fn put(&self, message: Arc<Message>) -> Result<(), BrokerError> {
        if self.is_exiting() {
            return Err(BrokerError::Exiting);
        }
        self.message_count.fetch_add(1, Ordering::Relaxed);
        let delay = message.deferred();
        if delay.is_zero() {
            self.put_queued(message)
        } else {
            self.start_deferred(message, delay)
        }
    }

    fn put_queued(&self, message: Arc<Message>) -> Result<(), BrokerError> {
        {
            let mut memory = self.memory.lock();
            if memory.len() < self.ctx.options.mem_queue_size {
                memory.push_back(message);
                drop(memory);
                self.ready.notify_waiters();
                return Ok(());
            }
        }
        self.write_backend(&message)?;
        self.ready.notify_waiters();
        Ok(())
    }

    fn write_backend(&self, message: &Message) -> Result<(), BrokerError> {
        self.backend.put(&message.encode()).map_err(|err| {
            error!(
                target: "rillmq::channel",
                topic = %self.topic_name,
                channel = %self.name,
                message_id = %message.id(),
                error = %err,
                "failed to write message to backend"
            );
            BrokerError::Storage(err)
        })
    }

    /// Pop the oldest queued message: memory first, then the backend.
    pub fn pop_queued(&self) -> Option<Arc<Message>> {
        if let Some(message) = self.memory.lock().pop_front() {
            return Some(message);
        }
        loop {
            match self.backend.read_next() {
                Ok(Some(raw)) => match Message::decode(raw) {
                    Ok(message) => return Some(Arc::new(message)),
                    Err(err) => {
                        error!(
                            target: "rillmq::channel",
                            topic = %self.topic_name,
                            channel = %self.name,
                            error = %err,
                            "skipping undecodable backend record"
                        );
                    }
                },
                Ok(None) => return None,
                // the backend logs the transition into the failed state itself
                Err(QueueError::Failed) | Err(QueueError::Closed) => return None,
                Err(err) => {
                    debug!(
                        target: "rillmq::channel",
                        channel = %self.name,
                        error = %err,
                        "backend read error"
                    );
                    return None;
                }
            }
        }
    }

    /// Give back a popped message that was never delivered.
    pub fn return_undelivered(&self, message: Arc<Message>) -> Result<(), BrokerError> {
        self.put_queued(message)
    }

    /// Wait until a message can be popped. Returns `None` once the channel
    /// starts exiting. Nothing is removed until the wait completes, so the
    /// future may be dropped at any await point.
    pub async fn pop_wait(&self) -> Option<Arc<Message>> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_exiting() {
                return None;
            }
            if !self.is_paused() {
                if let Some(message) = self.pop_queued() {
                    return Some(message);
                }
            }
            notified.await;
        }
    }

    // ───────────────────────────────────────────────────────────
    // In-flight and deferred state
    // ───────────────────────────────────────────────────────────

    /// Record `message` as delivered to `client`. Returns the envelope that
    /// goes on the wire, carrying the incremented attempt count.
    pub fn start_in_flight(
        &self,
        message: Arc<Message>,
        client: &ClientState,
        timeout: Duration,
    ) -> Result<Arc<Message>, BrokerError> {
        let delivered = Arc::new(message.next_attempt());
        let id = delivered.id();
        let now = Instant::now();
        let deadline = now + timeout;
        {
            let mut tracking = self.tracking.lock();
            if tracking.in_flight.contains_key(&id) {
                return Err(BrokerError::AlreadyInFlight(id));
            }
            tracking.in_flight.insert(
                id,
                InFlight {
                    message: Arc::clone(&delivered),
                    client_id: client.id(),
                    delivered_at: now,
                    deadline,
                },
            );
            tracking.in_flight_pq.push(id, deadline);
        }
        client.sent_message();
        Ok(delivered)
    }

    /// [`start_in_flight`](Self::start_in_flight), handing the message back
    /// to the queue when it cannot be tracked.
    pub fn dispatch(
        &self,
        message: Arc<Message>,
        client: &ClientState,
        timeout: Duration,
    ) -> Result<Arc<Message>, BrokerError> {
        match self.start_in_flight(Arc::clone(&message), client, timeout) {
            Ok(delivered) => Ok(delivered),
            Err(err) => {
                self.put_queued(message)?;
                Err(err)
            }
        }
    }

    fn start_deferred(&self, message: Arc<Message>, delay: Duration) -> Result<(), BrokerError> {
        let id = message.id();
        let deadline = Instant::now() + delay;
        let mut tracking = self.tracking.lock();
        if tracking.deferred.contains_key(&id) {
            return Err(BrokerError::AlreadyInFlight(id));
        }
        tracking.deferred.insert(id, Deferred { message, deadline });
        tracking.deferred_pq.push(id, deadline);
        Ok(())
    }

    fn take_in_flight(&self, client_id: ClientId, id: MessageId) -> Result<InFlight, BrokerError> {
        let mut tracking = self.tracking.lock();
        match tracking.in_flight.get(&id) {
            None => return Err(BrokerError::NotInFlight(id)),
            Some(entry) if entry.client_id != client_id => {
                return Err(BrokerError::NotOwner(id));
            }
            Some(_) => {}
        }
        let entry = tracking
            .in_flight
            .remove(&id)
            .ok_or(BrokerError::NotInFlight(id))?;
        tracking.in_flight_pq.remove(id, entry.deadline);
        Ok(entry)
    }

    fn client(&self, client_id: ClientId) -> Option<Arc<ClientState>> {
        self.clients.read().get(&client_id).cloned()
    }

    /// Acknowledge a delivery. Only the client it was delivered to may do so.
    pub fn finish(&self, client_id: ClientId, id: MessageId) -> Result<(), BrokerError> {
        self.take_in_flight(client_id, id)?;
        if let Some(client) = self.client(client_id) {
            client.finished_message();
        }
        Ok(())
    }

    /// Return a delivery to the queue, immediately or after `delay`.
    pub fn requeue(
        &self,
        client_id: ClientId,
        id: MessageId,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let entry = self.take_in_flight(client_id, id)?;
        if let Some(client) = self.client(client_id) {
            client.requeued_message();
        }
        self.requeue_count.fetch_add(1, Ordering::Relaxed);
        if delay.is_zero() {
            self.put_queued(entry.message)
        } else {
            self.start_deferred(entry.message, delay)
        }
    }

    /// Push the deadline out by the client's message timeout, never past
    /// `delivered_at + max_msg_timeout`.
    pub fn touch(&self, client_id: ClientId, id: MessageId) -> Result<(), BrokerError> {
        let timeout = self
            .client(client_id)
            .map(|c| c.msg_timeout())
            .unwrap_or_else(|| self.ctx.options.msg_timeout());
        let max = self.ctx.options.max_msg_timeout();

        let mut guard = self.tracking.lock();
        let tracking = &mut *guard;
        let entry = tracking
            .in_flight
            .get_mut(&id)
            .ok_or(BrokerError::NotInFlight(id))?;
        if entry.client_id != client_id {
            return Err(BrokerError::NotOwner(id));
        }
        let new_deadline = (Instant::now() + timeout).min(entry.delivered_at + max);
        tracking.in_flight_pq.remove(id, entry.deadline);
        tracking.in_flight_pq.push(id, new_deadline);
        entry.deadline = new_deadline;
        Ok(())
    }

    /// Requeue every in-flight message whose deadline is `<= now`.
    /// Returns whether anything expired.
    pub fn process_in_flight_queue(&self, now: Instant) -> bool {
        if self.is_exiting() {
            return false;
        }
        let mut dirty = false;
        loop {
            let expired = {
                let mut tracking = self.tracking.lock();
                let Some(id) = tracking.in_flight_pq.pop_expired(now) else {
                    break;
                };
                tracking.in_flight.remove(&id)
            };
            dirty = true;
            let Some(entry) = expired else { continue };

            self.timeout_count.fetch_add(1, Ordering::Relaxed);
            if let Some(client) = self.client(entry.client_id) {
                client.timed_out_message();
            }
            debug!(
                target: "rillmq::channel",
                channel = %self.name,
                message_id = %entry.message.id(),
                client_id = %entry.client_id,
                "in-flight message timed out"
            );
            if let Err(err) = self.put_queued(entry.message) {
                warn!(
                    target: "rillmq::channel",
                    channel = %self.name,
                    error = %err,
                    "failed to requeue timed out message"
                );
            }
        }
        dirty
    }

    /// Queue every deferred message whose deadline is `<= now`.
    pub fn process_deferred_queue(&self, now: Instant) -> bool {
        if self.is_exiting() {
            return false;
        }
        let mut dirty = false;
        loop {
            let due = {
                let mut tracking = self.tracking.lock();
                let Some(id) = tracking.deferred_pq.pop_expired(now) else {
                    break;
                };
                tracking.deferred.remove(&id)
            };
            dirty = true;
            let Some(entry) = due else { continue };
            if let Err(err) = self.put_queued(entry.message) {
                warn!(
                    target: "rillmq::channel",
                    channel = %self.name,
                    error = %err,
                    "failed to queue deferred message"
                );
            }
        }
        dirty
    }

    // ───────────────────────────────────────────────────────────
    // Clients
    // ───────────────────────────────────────────────────────────

    pub fn add_client(&self, client: Arc<ClientState>) -> Result<(), BrokerError> {
        if self.is_exiting() {
            return Err(BrokerError::Exiting);
        }
        let max = self.ctx.options.max_channel_consumers;
        let mut clients = self.clients.write();
        if clients.contains_key(&client.id()) {
            return Ok(());
        }
        if max > 0 && clients.len() >= max {
            return Err(BrokerError::TooManyConsumers(max));
        }
        clients.insert(client.id(), client);
        Ok(())
    }

    /// Detach a client and requeue everything it still had in flight.
    pub fn remove_client(&self, client_id: ClientId) {
        let now_empty = {
            let mut clients = self.clients.write();
            if clients.remove(&client_id).is_none() {
                return;
            }
            clients.is_empty()
        };

        let stranded: Vec<InFlight> = {
            let mut guard = self.tracking.lock();
            let tracking = &mut *guard;
            let ids: Vec<MessageId> = tracking
                .in_flight
                .iter()
                .filter(|(_, entry)| entry.client_id == client_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let entry = tracking.in_flight.remove(&id)?;
                    tracking.in_flight_pq.remove(id, entry.deadline);
                    Some(entry)
                })
                .collect()
        };

        if !stranded.is_empty() {
            debug!(
                target: "rillmq::channel",
                channel = %self.name,
                client_id = %client_id,
                count = stranded.len(),
                "requeueing in-flight messages of departed client"
            );
        }
        for entry in stranded {
            self.requeue_count.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self.put_queued(entry.message) {
                warn!(
                    target: "rillmq::channel",
                    channel = %self.name,
                    error = %err,
                    "failed to requeue message of departed client"
                );
            }
        }

        if self.ephemeral && now_empty && !self.is_exiting() {
            if let Some(topic) = self.topic.upgrade() {
                if let Err(err) = topic.reap_ephemeral_channel(&self.name) {
                    debug!(
                        target: "rillmq::channel",
                        channel = %self.name,
                        error = %err,
                        "ephemeral channel already gone"
                    );
                }
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    // ───────────────────────────────────────────────────────────
    // Administrative
    // ───────────────────────────────────────────────────────────

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.ready.notify_waiters();
    }

    /// Drop every queued, in-flight and deferred message.
    pub fn empty(&self) -> Result<(), BrokerError> {
        {
            let mut tracking = self.tracking.lock();
            tracking.in_flight.clear();
            tracking.in_flight_pq.clear();
            tracking.deferred.clear();
            tracking.deferred_pq.clear();
        }
        for client in self.clients.read().values() {
            client.clear_in_flight();
        }
        self.memory.lock().clear();
        self.backend.empty()?;
        Ok(())
    }

    pub fn depth(&self) -> u64 {
        self.memory.lock().len() as u64 + self.backend.depth()
    }

    pub fn in_flight_count(&self) -> usize {
        self.tracking.lock().in_flight.len()
    }

    pub fn deferred_count(&self) -> usize {
        self.tracking.lock().deferred.len()
    }

    /// Move memory, in-flight and deferred messages into the backend so a
    /// restart can pick them up.
    pub fn flush(&self) -> Result<(), BrokerError> {
        let mut pending: Vec<Arc<Message>> = self.memory.lock().drain(..).collect();
        {
            let mut tracking = self.tracking.lock();
            pending.extend(tracking.in_flight.drain().map(|(_, e)| e.message));
            let mut deferred: Vec<Deferred> = tracking.deferred.drain().map(|(_, e)| e).collect();
            deferred.sort_by_key(|e| e.deadline);
            pending.extend(deferred.into_iter().map(|e| e.message));
            tracking.in_flight_pq.clear();
            tracking.deferred_pq.clear();
        }
        if pending.is_empty() {
            return Ok(());
        }
        let mut failed = 0usize;
        for message in &pending {
            if self.write_backend(message).is_err() {
                failed += 1;
            }
        }
        info!(
            target: "rillmq::channel",
            topic = %self.topic_name,
            channel = %self.name,
            flushed = pending.len() - failed,
            failed,
            "flushed channel buffers to backend"
        );
        if failed > 0 {
            return Err(BrokerError::FlushFailed { failed });
        }
        Ok(())
    }

    /// Stop serving: close attached clients, flush, sync and release the backend.
    pub fn close(&self) -> Result<(), BrokerError> {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ready.notify_waiters();
        for client in self.clients.read().values() {
            client.close();
        }
        let flushed = self.flush();
        self.backend.close()?;
        flushed
    }

    /// Stop serving and discard all state, including on-disk data.
    pub fn delete(&self) -> Result<(), BrokerError> {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ready.notify_waiters();
        for client in self.clients.read().values() {
            client.close();
        }
        {
            let mut tracking = self.tracking.lock();
            tracking.in_flight.clear();
            tracking.in_flight_pq.clear();
            tracking.deferred.clear();
            tracking.deferred_pq.clear();
        }
        self.memory.lock().clear();
        self.backend.delete()?;
        Ok(())
    }

    pub fn stats(&self) -> ChannelStats {
        let (in_flight_count, deferred_count) = {
            let tracking = self.tracking.lock();
            (tracking.in_flight.len(), tracking.deferred.len())
        };
        let clients = self.clients.read().values().map(|c| c.stats()).collect();
        ChannelStats {
            channel_name: self.name.clone(),
            depth: self.depth(),
            backend_depth: self.backend.depth(),
            in_flight_count,
            deferred_count,
            message_count: self.message_count.load(Ordering::Relaxed),
            requeue_count: self.requeue_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
            paused: self.is_paused(),
            clients,
        }
    }
}

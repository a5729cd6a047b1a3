use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::core::message::now_nanos;
use crate::core::stats::ClientStats;

/// Per-connection identifier, unique for the daemon's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ClientId {
    fn from(raw: u64) -> Self {
        ClientId(raw)
    }
}

/// What the client told us about itself in IDENTIFY.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub remote_address: String,
    pub tls: bool,
    pub deflate: bool,
    pub snappy: bool,
    pub authed: bool,
}

/// Flow-control state shared between a session and the channel it
/// subscribes to.
///
/// `RDY n` sets both the ready count and the remaining credit to `n`. Each
/// delivery spends one credit and adds one in-flight message; the session
/// may deliver while credit remains and in-flight stays below the ready
/// count.
#[derive(Debug)]
pub struct ClientState {
    id: ClientId,
    info: RwLock<ClientInfo>,
    msg_timeout_ms: AtomicU64,
    ready_count: AtomicI64,
    credit: AtomicI64,
    in_flight: AtomicI64,
    message_count: AtomicU64,
    finish_count: AtomicU64,
    requeue_count: AtomicU64,
    closing: AtomicBool,
    connected_at: i64,
    wake: Notify,
}

impl ClientState {
    pub fn new(id: ClientId, remote_address: String, msg_timeout: Duration) -> Self {
        Self {
            id,
            info: RwLock::new(ClientInfo {
                remote_address,
                ..ClientInfo::default()
            }),
            msg_timeout_ms: AtomicU64::new(msg_timeout.as_millis() as u64),
            ready_count: AtomicI64::new(0),
            credit: AtomicI64::new(0),
            in_flight: AtomicI64::new(0),
            message_count: AtomicU64::new(0),
            finish_count: AtomicU64::new(0),
            requeue_count: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            connected_at: now_nanos(),
            wake: Notify::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn update_info<F: FnOnce(&mut ClientInfo)>(&self, f: F) {
        f(&mut *self.info.write());
    }

    pub fn info(&self) -> ClientInfo {
        self.info.read().clone()
    }

    pub fn msg_timeout(&self) -> Duration {
        Duration::from_millis(self.msg_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_msg_timeout(&self, timeout: Duration) {
        self.msg_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_ready(&self, count: i64) {
        self.ready_count.store(count, Ordering::SeqCst);
        self.credit.store(count, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub fn ready_count(&self) -> i64 {
        self.ready_count.load(Ordering::SeqCst)
    }

    pub fn credit(&self) -> i64 {
        self.credit.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_ready_for_messages(&self) -> bool {
        !self.is_closing()
            && self.credit() > 0
            && self.in_flight() < self.ready_count()
    }

    pub fn sent_message(&self) {
        self.credit.fetch_sub(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.message_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finished_message(&self) {
        self.finish_count.fetch_add(1, Ordering::Relaxed);
        self.release_in_flight();
    }

    pub fn requeued_message(&self) {
        self.requeue_count.fetch_add(1, Ordering::Relaxed);
        self.release_in_flight();
    }

    pub fn timed_out_message(&self) {
        self.release_in_flight();
    }

    /// Forget all in-flight accounting, used when the channel is emptied.
    pub fn clear_in_flight(&self) {
        self.in_flight.store(0, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn release_in_flight(&self) {
        // Never go negative if the channel was emptied underneath us.
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some((n - 1).max(0)));
        self.wake.notify_waiters();
    }

    /// Ask the owning session to stop; it observes this through [`Self::wake`].
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Woken whenever readiness may have changed.
    pub fn wake(&self) -> &Notify {
        &self.wake
    }

    pub fn stats(&self) -> ClientStats {
        let info = self.info.read();
        ClientStats {
            id: self.id.0,
            client_id: info.client_id.clone(),
            hostname: info.hostname.clone(),
            user_agent: info.user_agent.clone(),
            remote_address: info.remote_address.clone(),
            ready_count: self.ready_count(),
            in_flight_count: self.in_flight(),
            message_count: self.message_count.load(Ordering::Relaxed),
            finish_count: self.finish_count.load(Ordering::Relaxed),
            requeue_count: self.requeue_count.load(Ordering::Relaxed),
            connected_at: self.connected_at,
            tls: info.tls,
            deflate: info.deflate,
            snappy: info.snappy,
            authed: info.authed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientState {
        ClientState::new(ClientId(1), "127.0.0.1:1".into(), Duration::from_secs(60))
    }

    #[test]
    fn credit_is_spent_per_delivery_and_restored_by_rdy() {
        let c = client();
        assert!(!c.is_ready_for_messages());

        c.set_ready(2);
        assert!(c.is_ready_for_messages());
        c.sent_message();
        c.sent_message();
        assert!(!c.is_ready_for_messages());

        // Acknowledging does not hand back credit.
        c.finished_message();
        assert_eq!(c.in_flight(), 1);
        assert!(!c.is_ready_for_messages());

        c.set_ready(2);
        assert!(c.is_ready_for_messages());
    }

    #[test]
    fn in_flight_never_exceeds_ready_count() {
        let c = client();
        c.set_ready(3);
        for _ in 0..3 {
            c.sent_message();
        }
        c.set_ready(3);
        assert_eq!(c.credit(), 3);
        assert!(!c.is_ready_for_messages(), "3 in flight with RDY 3");
        c.requeued_message();
        assert!(c.is_ready_for_messages());
    }

    #[test]
    fn closing_client_is_never_ready() {
        let c = client();
        c.set_ready(10);
        c.close();
        assert!(!c.is_ready_for_messages());
    }

    #[test]
    fn release_saturates_at_zero() {
        let c = client();
        c.timed_out_message();
        assert_eq!(c.in_flight(), 0);
    }
}

use std::collections::BTreeSet;
use std::time::Instant;

use crate::core::message::MessageId;

/// Message ids ordered by deadline.
///
/// Callers keep the deadline alongside their own record of the id so an
/// entry can be removed or moved without a scan.
#[derive(Debug, Default)]
pub struct DeadlineQueue {
    entries: BTreeSet<(Instant, MessageId)>,
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: MessageId, deadline: Instant) {
        self.entries.insert((deadline, id));
    }

    pub fn remove(&mut self, id: MessageId, deadline: Instant) -> bool {
        self.entries.remove(&(deadline, id))
    }

    /// Remove and return the earliest entry whose deadline is `<= now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<MessageId> {
        let first = *self.entries.first()?;
        if first.0 > now {
            return None;
        }
        self.entries.pop_first().map(|(_, id)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pops_only_expired_in_deadline_order() {
        let base = Instant::now();
        let mut pq = DeadlineQueue::new();
        pq.push(MessageId::from_u64(3), base + Duration::from_millis(30));
        pq.push(MessageId::from_u64(1), base + Duration::from_millis(10));
        pq.push(MessageId::from_u64(2), base + Duration::from_millis(20));

        let now = base + Duration::from_millis(25);
        assert_eq!(pq.pop_expired(now), Some(MessageId::from_u64(1)));
        assert_eq!(pq.pop_expired(now), Some(MessageId::from_u64(2)));
        assert_eq!(pq.pop_expired(now), None);
        assert_eq!(pq.len(), 1);
    }

    #[test]
    fn remove_needs_matching_deadline() {
        let deadline = Instant::now();
        let mut pq = DeadlineQueue::new();
        pq.push(MessageId::from_u64(9), deadline);
        assert!(!pq.remove(MessageId::from_u64(9), deadline + Duration::from_millis(1)));
        assert!(pq.remove(MessageId::from_u64(9), deadline));
        assert!(pq.is_empty());
    }
}

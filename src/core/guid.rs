//! Message id generation.
//!
//! Ids pack a millisecond timestamp, the 10-bit node id and a 12-bit
//! per-millisecond sequence into a `u64`, rendered as 16 hex characters.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::core::message::MessageId;

const NODE_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;

#[derive(Debug)]
pub struct GuidFactory {
    node_id: u64,
    state: Mutex<GuidState>,
}

#[derive(Debug, Default)]
struct GuidState {
    last_ms: u64,
    sequence: u64,
}

impl GuidFactory {
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id: u64::from(node_id) & NODE_MASK,
            state: Mutex::new(GuidState::default()),
        }
    }

    pub fn next_id(&self) -> MessageId {
        MessageId::from_u64(self.next_raw(now_millis()))
    }

    fn next_raw(&self, now_ms: u64) -> u64 {
        let mut state = self.state.lock();
        // A clock step backwards keeps issuing from the last seen millisecond.
        let ms = now_ms.max(state.last_ms);
        if ms == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond; borrow the next one.
                state.last_ms += 1;
            }
        } else {
            state.last_ms = ms;
            state.sequence = 0;
        }
        (state.last_ms << (NODE_BITS + SEQUENCE_BITS))
            | (self.node_id << SEQUENCE_BITS)
            | state.sequence
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

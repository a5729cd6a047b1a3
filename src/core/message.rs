use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const MESSAGE_ID_LEN: usize = 16;
/// timestamp (8) + attempts (2) + id (16)
pub const MESSAGE_HEADER_LEN: usize = 8 + 2 + MESSAGE_ID_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageDecodeError {
    #[error("message too short: {0} bytes")]
    TooShort(usize),

    #[error("invalid message id")]
    InvalidId,
}

/// 16 ASCII hex characters, as written on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; MESSAGE_ID_LEN]);

impl MessageId {
    pub fn from_u64(raw: u64) -> Self {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut out = [0u8; MESSAGE_ID_LEN];
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = (MESSAGE_ID_LEN - 1 - i) * 4;
            *slot = HEX[((raw >> shift) & 0xf) as usize];
        }
        MessageId(out)
    }

    /// Parse an id as sent by a client in FIN/REQ/TOUCH.
    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        let bytes: [u8; MESSAGE_ID_LEN] = raw.try_into().ok()?;
        if bytes.iter().all(u8::is_ascii_hexdigit) {
            Some(MessageId(bytes))
        } else {
            None
        }
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // from_u64/from_slice only ever store ASCII hex digits.
        std::str::from_utf8(&self.0).unwrap_or("")
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.as_str())
    }
}

/// Immutable message envelope. Shared as `Arc<Message>` between buffers and
/// in-flight tracking; redelivery produces a new envelope with a bumped
/// attempt counter instead of mutating this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    body: Bytes,
    timestamp: i64,
    attempts: u16,
    /// Delivery delay requested at publish time (DPUB). Not persisted.
    deferred: Duration,
}

impl Message {
    pub fn new(id: MessageId, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            body: body.into(),
            timestamp: now_nanos(),
            attempts: 0,
            deferred: Duration::ZERO,
        }
    }

    pub fn with_deferred(mut self, deferred: Duration) -> Self {
        self.deferred = deferred;
        self
    }

    /// Copy of this envelope carrying one more delivery attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempts: self.attempts.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn deferred(&self) -> Duration {
        self.deferred
    }

    pub fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_LEN + self.body.len()
    }

    /// `[8 BE timestamp ns][2 BE attempts][16 id][body]`
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_i64(self.timestamp);
        dst.put_u16(self.attempts);
        dst.put_slice(self.id.as_bytes());
        dst.put_slice(&self.body);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut src: Bytes) -> Result<Self, MessageDecodeError> {
        if src.len() < MESSAGE_HEADER_LEN {
            return Err(MessageDecodeError::TooShort(src.len()));
        }
        let timestamp = src.get_i64();
        let attempts = src.get_u16();
        let id = MessageId::from_slice(&src[..MESSAGE_ID_LEN])
            .ok_or(MessageDecodeError::InvalidId)?;
        src.advance(MESSAGE_ID_LEN);
        Ok(Self {
            id,
            body: src,
            timestamp,
            attempts,
            deferred: Duration::ZERO,
        })
    }
}

pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_lowercase_hex() {
        let id = MessageId::from_u64(0x0123_4567_89ab_cdef);
        assert_eq!(id.as_str(), "0123456789abcdef");
        assert_eq!(MessageId::from_slice(b"0123456789abcdef"), Some(id));
        assert_eq!(MessageId::from_slice(b"0123456789abcdeZ"), None);
        assert_eq!(MessageId::from_slice(b"short"), None);
    }

    #[test]
    fn encode_layout_matches_wire_format() {
        let msg = Message::new(MessageId::from_u64(7), Bytes::from_static(b"hello"))
            .next_attempt();
        let encoded = msg.encode();

        assert_eq!(encoded.len(), MESSAGE_HEADER_LEN + 5);
        assert_eq!(&encoded[..8], &msg.timestamp().to_be_bytes());
        assert_eq!(&encoded[8..10], &[0, 1]);
        assert_eq!(&encoded[10..26], b"0000000000000007");
        assert_eq!(&encoded[26..], b"hello");

        let decoded = Message::decode(encoded).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let err = Message::decode(Bytes::from_static(b"tiny")).unwrap_err();
        assert_eq!(err, MessageDecodeError::TooShort(4));
    }

    #[test]
    fn next_attempt_leaves_original_untouched() {
        let first = Message::new(MessageId::from_u64(1), "body");
        let second = first.next_attempt().next_attempt();
        assert_eq!(first.attempts(), 0);
        assert_eq!(second.attempts(), 2);
        assert_eq!(second.body(), first.body());
    }
}

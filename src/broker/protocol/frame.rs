//! Server-to-client frames: `[4 BE size][4 BE frame type][data]`, where
//! `size` counts the type field plus the data.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::core::message::Message;

pub const MAGIC_V2: &[u8; 4] = b"  V2";
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const OK: &[u8] = b"OK";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

/// Upper bound accepted by [`try_decode_frame`].
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    Response = 0,
    Error = 1,
    Message = 2,
}

impl FrameType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(FrameType::Response),
            1 => Some(FrameType::Error),
            2 => Some(FrameType::Message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub data: Bytes,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("frame size {0} is smaller than its type field")]
    TooShort(usize),
    #[error("frame size {0} exceeds limit")]
    TooLarge(usize),
    #[error("unknown frame type {0}")]
    UnknownType(u32),
}

pub fn encode_frame(frame_type: FrameType, data: &[u8], dst: &mut BytesMut) {
    dst.reserve(8 + data.len());
    dst.put_u32((4 + data.len()) as u32);
    dst.put_u32(frame_type as u32);
    dst.put_slice(data);
}

pub fn encode_message_frame(message: &Message, dst: &mut BytesMut) {
    let len = message.encoded_len();
    dst.reserve(8 + len);
    dst.put_u32((4 + len) as u32);
    dst.put_u32(FrameType::Message as u32);
    message.encode_into(dst);
}

/// Split one complete frame off `src`, or return `Ok(None)` if more bytes
/// are needed.
pub fn try_decode_frame(src: &mut BytesMut) -> Result<Option<Frame>, FrameDecodeError> {
    if src.len() < 4 {
        return Ok(None);
    }
    let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if size < 4 {
        return Err(FrameDecodeError::TooShort(size));
    }
    if size > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(size));
    }
    if src.len() < 4 + size {
        return Ok(None);
    }
    src.advance(4);
    let raw_type = src.get_u32();
    let frame_type = FrameType::from_u32(raw_type).ok_or(FrameDecodeError::UnknownType(raw_type))?;
    let data = src.split_to(size - 4).freeze();
    Ok(Some(Frame { frame_type, data }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::MessageId;

    #[test]
    fn response_frame_layout() {
        let mut buf = BytesMut::new();
        encode_frame(FrameType::Response, OK, &mut buf);
        assert_eq!(&buf[..], &[0, 0, 0, 6, 0, 0, 0, 0, b'O', b'K']);
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let mut buf = BytesMut::new();
        encode_frame(FrameType::Error, b"E_INVALID nope", &mut buf);
        let mut partial = BytesMut::from(&buf[..7]);
        assert_eq!(try_decode_frame(&mut partial), Ok(None));

        let frame = try_decode_frame(&mut buf).expect("decode").expect("frame");
        assert_eq!(frame.frame_type, FrameType::Error);
        assert_eq!(&frame.data[..], b"E_INVALID nope");
        assert!(buf.is_empty());
    }

    #[test]
    fn message_frame_carries_encoded_message() {
        let msg = Message::new(MessageId::from_u64(42), Bytes::from_static(b"hello"));
        let mut buf = BytesMut::new();
        encode_message_frame(&msg, &mut buf);
        let frame = try_decode_frame(&mut buf).expect("decode").expect("frame");
        assert_eq!(frame.frame_type, FrameType::Message);
        let decoded = Message::decode(frame.data).expect("message");
        assert_eq!(decoded.body().as_ref(), b"hello");
        assert_eq!(decoded.id(), msg.id());
    }

    #[test]
    fn rejects_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u32(9);
        assert_eq!(try_decode_frame(&mut buf), Err(FrameDecodeError::UnknownType(9)));
    }
}

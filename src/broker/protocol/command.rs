//! Client-to-server command decoding.
//!
//! A command is a space separated line terminated by `\n`. Commands that
//! carry data are followed by a 4-byte big-endian length and that many
//! bytes. Oversized bodies are skipped on the wire so the stream stays
//! aligned and the connection can continue.

use bytes::{Buf, Bytes, BytesMut};

use crate::broker::protocol::error::{ProtocolError, E_BAD_BODY, E_BAD_MESSAGE};

/// Longest command line accepted before the connection is dropped.
pub const MAX_LINE_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Identify,
    Auth,
    Sub,
    Pub,
    Mpub,
    Dpub,
    Rdy,
    Fin,
    Req,
    Touch,
    Cls,
    Nop,
}

impl Verb {
    fn parse(raw: &[u8]) -> Option<Self> {
        Some(match raw {
            b"IDENTIFY" => Verb::Identify,
            b"AUTH" => Verb::Auth,
            b"SUB" => Verb::Sub,
            b"PUB" => Verb::Pub,
            b"MPUB" => Verb::Mpub,
            b"DPUB" => Verb::Dpub,
            b"RDY" => Verb::Rdy,
            b"FIN" => Verb::Fin,
            b"REQ" => Verb::Req,
            b"TOUCH" => Verb::Touch,
            b"CLS" => Verb::Cls,
            b"NOP" => Verb::Nop,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Identify => "IDENTIFY",
            Verb::Auth => "AUTH",
            Verb::Sub => "SUB",
            Verb::Pub => "PUB",
            Verb::Mpub => "MPUB",
            Verb::Dpub => "DPUB",
            Verb::Rdy => "RDY",
            Verb::Fin => "FIN",
            Verb::Req => "REQ",
            Verb::Touch => "TOUCH",
            Verb::Cls => "CLS",
            Verb::Nop => "NOP",
        }
    }

    pub fn has_body(self) -> bool {
        matches!(
            self,
            Verb::Identify | Verb::Auth | Verb::Pub | Verb::Mpub | Verb::Dpub
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub verb: Verb,
    pub params: Vec<String>,
    pub body: Option<Bytes>,
}

#[derive(Debug)]
pub struct CommandDecoder {
    max_msg_size: u64,
    max_body_size: u64,
    pending: Option<(Verb, Vec<String>)>,
    discard: usize,
}

impl CommandDecoder {
    pub fn new(max_msg_size: u64, max_body_size: u64) -> Self {
        Self {
            max_msg_size,
            max_body_size,
            pending: None,
            discard: 0,
        }
    }

    /// Decode the next complete command. `Ok(None)` means more input is
    /// needed. A non-fatal error leaves the decoder ready for the next
    /// command.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        if self.discard > 0 {
            let n = self.discard.min(src.len());
            src.advance(n);
            self.discard -= n;
            if self.discard > 0 {
                return Ok(None);
            }
        }

        if self.pending.is_none() {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_LINE_LEN {
                    return Err(ProtocolError::invalid("command line too long"));
                }
                return Ok(None);
            };
            let line = src.split_to(pos + 1);
            let line = line[..pos].strip_suffix(b"\r").unwrap_or(&line[..pos]);
            let mut parts = line.split(|b| *b == b' ').filter(|p| !p.is_empty());
            let Some(raw_verb) = parts.next() else {
                return Err(ProtocolError::invalid("empty command"));
            };
            let verb = Verb::parse(raw_verb).ok_or_else(|| {
                ProtocolError::invalid(format!(
                    "invalid command {}",
                    String::from_utf8_lossy(raw_verb)
                ))
            })?;
            let params = parts
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .collect();
            if !verb.has_body() {
                return Ok(Some(Request {
                    verb,
                    params,
                    body: None,
                }));
            }
            self.pending = Some((verb, params));
        }

        if src.len() < 4 {
            return Ok(None);
        }
        let Some((verb, _)) = self.pending.as_ref() else {
            return Ok(None);
        };
        let verb = *verb;
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        let (limit, code) = match verb {
            Verb::Pub | Verb::Dpub => (self.max_msg_size, E_BAD_MESSAGE),
            _ => (self.max_body_size, E_BAD_BODY),
        };
        if len as u64 > limit {
            src.advance(4);
            self.pending = None;
            self.discard = len;
            let skipped = self.discard.min(src.len());
            src.advance(skipped);
            self.discard -= skipped;
            return Err(ProtocolError::soft(
                code,
                format!("{} body too big {len} > {limit}", verb.as_str()),
            ));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let body = src.split_to(len).freeze();
        let Some((verb, params)) = self.pending.take() else {
            return Ok(None);
        };
        Ok(Some(Request {
            verb,
            params,
            body: Some(body),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn decoder() -> CommandDecoder {
        CommandDecoder::new(8, 64)
    }

    #[test]
    fn parses_plain_commands() {
        let mut buf = BytesMut::from(&b"SUB t1 c1\r\nRDY 3\nNOP\n"[..]);
        let mut dec = decoder();
        let sub = dec.decode(&mut buf).expect("sub").expect("complete");
        assert_eq!(sub.verb, Verb::Sub);
        assert_eq!(sub.params, vec!["t1", "c1"]);
        let rdy = dec.decode(&mut buf).expect("rdy").expect("complete");
        assert_eq!(rdy.params, vec!["3"]);
        assert_eq!(dec.decode(&mut buf).expect("nop").expect("complete").verb, Verb::Nop);
        assert_eq!(dec.decode(&mut buf), Ok(None));
    }

    #[test]
    fn body_may_arrive_in_pieces() {
        let mut dec = decoder();
        let mut buf = BytesMut::from(&b"PUB t1\n\x00\x00"[..]);
        assert_eq!(dec.decode(&mut buf), Ok(None));
        buf.put_slice(b"\x00\x05hel");
        assert_eq!(dec.decode(&mut buf), Ok(None));
        buf.put_slice(b"lo");
        let req = dec.decode(&mut buf).expect("pub").expect("complete");
        assert_eq!(req.body.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn oversized_body_is_skipped_and_stream_continues() {
        let mut dec = decoder();
        let mut buf = BytesMut::from(&b"PUB t1\n"[..]);
        buf.put_u32(10);
        buf.put_slice(b"0123");
        let err = dec.decode(&mut buf).expect_err("too big");
        assert_eq!(err.code, E_BAD_MESSAGE);
        assert!(!err.fatal);

        buf.put_slice(b"456789NOP\n");
        let next = dec.decode(&mut buf).expect("next").expect("complete");
        assert_eq!(next.verb, Verb::Nop);
    }

    #[test]
    fn unknown_verb_is_fatal() {
        let mut buf = BytesMut::from(&b"BOGUS x\n"[..]);
        let err = decoder().decode(&mut buf).expect_err("unknown");
        assert!(err.fatal);
        assert_eq!(err.message, "invalid command BOGUS");
    }

    #[test]
    fn runaway_line_is_fatal() {
        let mut buf = BytesMut::from(&vec![b'A'; MAX_LINE_LEN + 1][..]);
        assert!(decoder().decode(&mut buf).expect_err("too long").fatal);
    }
}

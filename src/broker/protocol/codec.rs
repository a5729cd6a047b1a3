//! Connection byte stream with optional TLS and stream compression.
//!
//! The transform set is fixed once IDENTIFY completes: TLS wraps the
//! socket, and deflate or snappy wraps everything written or read after
//! that.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;

const READ_CHUNK: usize = 16 * 1024;

pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

fn invalid_data(err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

// ───────────────────────────────────────────────────────────
// Deflate (raw, sync-flushed per write)
// ───────────────────────────────────────────────────────────

pub struct DeflateCodec {
    compress: Compress,
    decompress: Decompress,
}

impl DeflateCodec {
    pub fn new(level: u32) -> Self {
        Self {
            compress: Compress::new(flate2::Compression::new(level), false),
            decompress: Decompress::new(false),
        }
    }

    pub fn encode(&mut self, mut input: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(4096);
            }
            let before = self.compress.total_in();
            self.compress
                .compress_vec(input, &mut out, FlushCompress::Sync)
                .map_err(invalid_data)?;
            let consumed = (self.compress.total_in() - before) as usize;
            input = &input[consumed..];
            // The sync flush is complete once it stops filling the buffer.
            if input.is_empty() && out.len() < out.capacity() {
                break;
            }
        }
        dst.extend_from_slice(&out);
        Ok(())
    }

    pub fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()> {
        let mut out = Vec::with_capacity(src.len() * 2 + 1024);
        loop {
            if out.capacity() - out.len() < 1024 {
                out.reserve(out.capacity().max(4096));
            }
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress_vec(&src[..], &mut out, FlushDecompress::Sync)
                .map_err(invalid_data)?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = self.decompress.total_out() - before_out;
            src.advance(consumed);
            if status == Status::StreamEnd {
                break;
            }
            if src.is_empty() && out.len() < out.capacity() {
                break;
            }
            if consumed == 0 && produced == 0 {
                break;
            }
        }
        dst.extend_from_slice(&out);
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────
// Snappy framing format
// ───────────────────────────────────────────────────────────

const SNAPPY_STREAM_ID: &[u8] = b"\xff\x06\x00\x00sNaPpY";
const SNAPPY_MAX_BLOCK: usize = 65536;
const CHUNK_COMPRESSED: u8 = 0x00;
const CHUNK_UNCOMPRESSED: u8 = 0x01;
const CHUNK_PADDING: u8 = 0xfe;
const CHUNK_STREAM_ID: u8 = 0xff;

fn masked_crc(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

pub struct SnappyCodec {
    encoder: snap::raw::Encoder,
    decoder: snap::raw::Decoder,
    wrote_stream_id: bool,
}

impl Default for SnappyCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SnappyCodec {
    pub fn new() -> Self {
        Self {
            encoder: snap::raw::Encoder::new(),
            decoder: snap::raw::Decoder::new(),
            wrote_stream_id: false,
        }
    }

    pub fn encode(&mut self, input: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        if !self.wrote_stream_id {
            dst.put_slice(SNAPPY_STREAM_ID);
            self.wrote_stream_id = true;
        }
        for block in input.chunks(SNAPPY_MAX_BLOCK) {
            let crc = masked_crc(block);
            let compressed = self.encoder.compress_vec(block).map_err(invalid_data)?;
            let (kind, payload): (u8, &[u8]) = if compressed.len() < block.len() {
                (CHUNK_COMPRESSED, &compressed)
            } else {
                (CHUNK_UNCOMPRESSED, block)
            };
            let len = (payload.len() + 4) as u32;
            dst.put_u8(kind);
            dst.put_slice(&len.to_le_bytes()[..3]);
            dst.put_u32_le(crc);
            dst.put_slice(payload);
        }
        Ok(())
    }

    /// Consume every complete chunk in `src`; a partial chunk stays put.
    pub fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> io::Result<()> {
        while src.len() >= 4 {
            let kind = src[0];
            let len = u32::from_le_bytes([src[1], src[2], src[3], 0]) as usize;
            if src.len() < 4 + len {
                break;
            }
            src.advance(4);
            let chunk = src.split_to(len);
            match kind {
                CHUNK_STREAM_ID => {
                    if &chunk[..] != b"sNaPpY" {
                        return Err(invalid_data("bad snappy stream identifier"));
                    }
                }
                CHUNK_COMPRESSED | CHUNK_UNCOMPRESSED => {
                    if chunk.len() < 4 {
                        return Err(invalid_data("snappy chunk too short"));
                    }
                    let expected = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let data = if kind == CHUNK_COMPRESSED {
                        self.decoder
                            .decompress_vec(&chunk[4..])
                            .map_err(invalid_data)?
                    } else {
                        chunk[4..].to_vec()
                    };
                    if masked_crc(&data) != expected {
                        return Err(invalid_data("snappy checksum mismatch"));
                    }
                    dst.extend_from_slice(&data);
                }
                CHUNK_PADDING | 0x80..=0xfd => {}
                other => {
                    return Err(invalid_data(format!("unskippable snappy chunk {other:#x}")));
                }
            }
        }
        Ok(())
    }
}

pub enum Compression {
    None,
    Deflate(Box<DeflateCodec>),
    Snappy(Box<SnappyCodec>),
}

impl Compression {
    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Deflate(_) => "deflate",
            Compression::Snappy(_) => "snappy",
        }
    }
}

// ───────────────────────────────────────────────────────────
// Transport
// ───────────────────────────────────────────────────────────

/// The connection as the session sees it: plain frames in, plain frames out.
pub struct Transport {
    stream: Option<Box<dyn Stream>>,
    compression: Compression,
    tls: bool,
    raw: BytesMut,
    scratch: BytesMut,
    /// Decoded bytes waiting to be parsed into commands.
    pub inbuf: BytesMut,
}

impl Transport {
    pub fn new<S: Stream + 'static>(stream: S) -> Self {
        Self {
            stream: Some(Box::new(stream)),
            compression: Compression::None,
            tls: false,
            raw: BytesMut::with_capacity(READ_CHUNK),
            scratch: BytesMut::new(),
            inbuf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    fn stream(&mut self) -> io::Result<&mut Box<dyn Stream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn compression(&self) -> &Compression {
        &self.compression
    }

    /// Read more bytes into `inbuf`. Returns the number of bytes taken off
    /// the socket; zero means the peer closed the connection.
    pub async fn read(&mut self) -> io::Result<usize> {
        if matches!(self.compression, Compression::None) {
            let stream = self.stream.as_mut().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "transport closed")
            })?;
            self.inbuf.reserve(READ_CHUNK);
            return stream.read_buf(&mut self.inbuf).await;
        }

        let stream = self.stream.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "transport closed")
        })?;
        self.raw.reserve(READ_CHUNK);
        let n = stream.read_buf(&mut self.raw).await?;
        match &mut self.compression {
            Compression::Deflate(codec) => codec.decode(&mut self.raw, &mut self.inbuf)?,
            Compression::Snappy(codec) => codec.decode(&mut self.raw, &mut self.inbuf)?,
            Compression::None => {}
        }
        Ok(n)
    }

    /// Write `data` through the negotiated transforms and flush.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let payload: &[u8] = match &mut self.compression {
            Compression::None => data,
            Compression::Deflate(codec) => {
                self.scratch.clear();
                codec.encode(data, &mut self.scratch)?;
                &self.scratch
            }
            Compression::Snappy(codec) => {
                self.scratch.clear();
                codec.encode(data, &mut self.scratch)?;
                &self.scratch
            }
        };
        let stream = self.stream.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "transport closed")
        })?;
        stream.write_all(payload).await?;
        stream.flush().await
    }

    pub async fn upgrade_tls(&mut self, acceptor: &TlsAcceptor) -> io::Result<()> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))?;
        let tls = acceptor.accept(stream).await?;
        self.stream = Some(Box::new(tls));
        self.tls = true;
        Ok(())
    }

    pub fn enable_deflate(&mut self, level: u32) {
        self.compression = Compression::Deflate(Box::new(DeflateCodec::new(level)));
    }

    pub fn enable_snappy(&mut self) {
        self.compression = Compression::Snappy(Box::new(SnappyCodec::new()));
    }

    pub async fn shutdown(&mut self) {
        if let Ok(stream) = self.stream() {
            let _ = stream.shutdown().await;
        }
        self.stream = None;
    }
}

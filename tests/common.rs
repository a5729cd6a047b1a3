#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rillmq::broker::protocol::frame::{try_decode_frame, Frame, FrameType, HEARTBEAT, MAGIC_V2};
use rillmq::core::message::Message;
use rillmq::{Daemon, Options};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rillmq::logging::try_init_logging(Some("warn"));
    });
}

pub fn test_options(data_path: &Path) -> Options {
    Options {
        tcp_address: "127.0.0.1:0".to_string(),
        data_path: data_path.to_path_buf(),
        queue_scan_interval_ms: 20,
        queue_scan_refresh_interval_ms: 50,
        ..Options::default()
    }
}

/// Daemon bound to an ephemeral port.
pub async fn start_daemon(options: Options) -> (Daemon, std::net::SocketAddr) {
    init_logging();
    let daemon = Daemon::new(options).expect("daemon");
    daemon.load_metadata().expect("load metadata");
    let addr = daemon.run().await.expect("run");
    (daemon, addr)
}

/// Minimal V2 client: writes commands, reads frames, answers heartbeats.
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream.write_all(MAGIC_V2).await.expect("magic");
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    pub async fn send_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.expect("write");
    }

    pub async fn command(&mut self, line: &str) {
        self.send_raw(format!("{line}\n").as_bytes()).await;
    }

    pub async fn command_with_body(&mut self, line: &str, body: &[u8]) {
        let mut buf = BytesMut::new();
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);
        self.send_raw(&buf).await;
    }

    /// Next non-heartbeat frame, or `None` on EOF.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = try_decode_frame(&mut self.buf).expect("frame") {
                if frame.frame_type == FrameType::Response && &frame.data[..] == HEARTBEAT {
                    self.command("NOP").await;
                    continue;
                }
                return Some(frame);
            }
            let n = timeout(WAIT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for frame")
                .expect("read");
            if n == 0 {
                return None;
            }
        }
    }

    /// Like `next_frame` but returns `None` if nothing arrives within `wait`.
    pub async fn try_next_frame(&mut self, wait: Duration) -> Option<Frame> {
        timeout(wait, self.next_frame()).await.ok().flatten()
    }

    pub async fn expect_response(&mut self) -> Bytes {
        let frame = self.next_frame().await.expect("connection closed");
        assert_eq!(
            frame.frame_type,
            FrameType::Response,
            "unexpected frame {:?}",
            String::from_utf8_lossy(&frame.data)
        );
        frame.data
    }

    pub async fn expect_ok(&mut self) {
        assert_eq!(&self.expect_response().await[..], b"OK");
    }

    pub async fn expect_error(&mut self) -> String {
        let frame = self.next_frame().await.expect("connection closed");
        assert_eq!(frame.frame_type, FrameType::Error);
        String::from_utf8_lossy(&frame.data).into_owned()
    }

    pub async fn expect_message(&mut self) -> Message {
        let frame = self.next_frame().await.expect("connection closed");
        assert_eq!(
            frame.frame_type,
            FrameType::Message,
            "unexpected frame {:?}",
            String::from_utf8_lossy(&frame.data)
        );
        Message::decode(frame.data).expect("message")
    }

    pub async fn subscribe(&mut self, topic: &str, channel: &str) {
        self.command(&format!("SUB {topic} {channel}")).await;
        self.expect_ok().await;
    }

    pub async fn publish(&mut self, topic: &str, body: &[u8]) {
        self.command_with_body(&format!("PUB {topic}"), body).await;
        self.expect_ok().await;
    }

    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

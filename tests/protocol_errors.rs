#[path = "common.rs"]
mod common;

use std::time::Duration;

use common::{start_daemon, test_options, TestClient, WAIT};
use rillmq::broker::protocol::identify::IdentifyResponse;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn bad_magic_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (daemon, addr) = start_daemon(test_options(dir.path())).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(b"  V1").await.expect("write");
    let mut raw = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut raw))
        .await
        .expect("server closes")
        .expect("read");
    let text = String::from_utf8_lossy(&raw);
    assert!(text.contains("E_BAD_PROTOCOL"), "{text}");

    daemon.shutdown().await;
}

#[tokio::test]
async fn fatal_errors_close_the_connection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (daemon, addr) = start_daemon(test_options(dir.path())).await;

    let mut client = TestClient::connect(addr).await;
    client.command("SUB bad!topic c").await;
    assert!(client.expect_error().await.starts_with("E_BAD_TOPIC"));
    assert!(client.next_frame().await.is_none(), "connection should be closed");

    let mut client = TestClient::connect(addr).await;
    client.command("FIN 0000000000000001").await;
    assert!(client.expect_error().await.starts_with("E_INVALID"));
    assert!(client.next_frame().await.is_none());

    let mut client = TestClient::connect(addr).await;
    client.subscribe("t", "c").await;
    client.command_with_body("PUB t", b"x").await;
    assert!(client.expect_error().await.starts_with("E_INVALID"));
    assert!(client.next_frame().await.is_none());

    daemon.shutdown().await;
}

#[tokio::test]
async fn soft_errors_keep_the_connection_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let options = rillmq::Options {
        max_msg_size: 8,
        ..test_options(dir.path())
    };
    let (daemon, addr) = start_daemon(options).await;

    let mut client = TestClient::connect(addr).await;
    client.command_with_body("PUB t", b"far too large").await;
    assert!(client.expect_error().await.starts_with("E_BAD_MESSAGE"));
    client.publish("t", b"small").await;

    let mut consumer = TestClient::connect(addr).await;
    consumer.subscribe("t", "c").await;
    consumer.command("RDY 99999").await;
    assert!(consumer.expect_error().await.starts_with("E_INVALID"));
    consumer.command("FIN 00000000000000ff").await;
    assert!(consumer.expect_error().await.starts_with("E_FIN_FAILED"));
    consumer.command("CLS").await;
    assert_eq!(&consumer.expect_response().await[..], b"CLOSE_WAIT");

    daemon.shutdown().await;
}

#[tokio::test]
async fn identify_negotiates_features() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (daemon, addr) = start_daemon(test_options(dir.path())).await;

    let mut client = TestClient::connect(addr).await;
    client
        .command_with_body(
            "IDENTIFY",
            br#"{"client_id":"c1","hostname":"h","user_agent":"test/1.0","feature_negotiation":true,
                "heartbeat_interval":2000,"msg_timeout":5000,"sample_rate":0}"#,
        )
        .await;
    let body = client.expect_response().await;
    let resp: IdentifyResponse = serde_json::from_slice(&body).expect("json");
    assert_eq!(resp.max_rdy_count, 2500);
    assert_eq!(resp.msg_timeout, 5000);
    assert!(!resp.tls_v1);
    assert!(!resp.auth_required);
    assert_eq!(resp.version, env!("CARGO_PKG_VERSION"));

    client
        .command_with_body("IDENTIFY", br#"{"client_id":"again"}"#)
        .await;
    assert!(client.expect_error().await.starts_with("E_INVALID"));
    assert!(client.next_frame().await.is_none());

    let mut bad = TestClient::connect(addr).await;
    bad.command_with_body("IDENTIFY", br#"{"deflate":true,"snappy":true}"#)
        .await;
    assert!(bad.expect_error().await.starts_with("E_BAD_BODY"));

    daemon.shutdown().await;
}

#[tokio::test]
async fn heartbeats_are_sent_and_silence_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (daemon, addr) = start_daemon(test_options(dir.path())).await;

    let mut client = TestClient::connect(addr).await;
    client
        .command_with_body("IDENTIFY", br#"{"heartbeat_interval":1000}"#)
        .await;
    client.expect_ok().await;

    // next_frame answers heartbeats, so the connection survives
    assert!(client.try_next_frame(Duration::from_millis(2500)).await.is_none());
    client.publish("hb", b"still here").await;

    daemon.shutdown().await;
}

#[tokio::test]
async fn auth_gates_data_commands() {
    let dir = tempfile::tempdir().expect("tempdir");
    let options = rillmq::Options {
        auth_secrets: vec!["letmein".to_string()],
        ..test_options(dir.path())
    };
    let (daemon, addr) = start_daemon(options).await;

    let mut anonymous = TestClient::connect(addr).await;
    anonymous.command_with_body("PUB t", b"x").await;
    assert!(anonymous.expect_error().await.starts_with("E_UNAUTHORIZED"));

    let mut wrong = TestClient::connect(addr).await;
    wrong.command_with_body("IDENTIFY", b"{}").await;
    wrong.expect_ok().await;
    wrong.command_with_body("AUTH", b"nope").await;
    assert!(wrong.expect_error().await.starts_with("E_AUTH_FAILED"));

    let mut client = TestClient::connect(addr).await;
    client
        .command_with_body("IDENTIFY", br#"{"feature_negotiation":true}"#)
        .await;
    let resp: IdentifyResponse =
        serde_json::from_slice(&client.expect_response().await).expect("json");
    assert!(resp.auth_required);
    client.command_with_body("AUTH", b"letmein").await;
    let grant: serde_json::Value =
        serde_json::from_slice(&client.expect_response().await).expect("json");
    assert_eq!(grant["identity"], "static");
    client.publish("t", b"x").await;

    daemon.shutdown().await;
}

#[tokio::test]
async fn shutdown_does_not_wait_for_connections_without_magic() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (daemon, addr) = start_daemon(test_options(dir.path())).await;

    let silent = TcpStream::connect(addr).await.expect("connect");
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(3), daemon.shutdown())
        .await
        .expect("shutdown finished while a client never sent the magic");
    drop(silent);
}

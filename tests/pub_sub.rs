#[path = "common.rs"]
mod common;

use std::time::Duration;

use common::{start_daemon, test_options, TestClient};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_consume_and_requeue() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (daemon, addr) = start_daemon(test_options(dir.path())).await;

    let mut consumer = TestClient::connect(addr).await;
    consumer.subscribe("orders", "billing").await;
    consumer.command("RDY 1").await;

    let mut producer = TestClient::connect(addr).await;
    producer.publish("orders", b"hello").await;

    let first = consumer.expect_message().await;
    assert_eq!(&first.body()[..], b"hello");
    assert_eq!(first.attempts(), 1);

    // credit is only restored by a fresh RDY
    consumer.command(&format!("REQ {} 0", first.id())).await;
    consumer.command("RDY 1").await;
    let second = consumer.expect_message().await;
    assert_eq!(second.id(), first.id());
    assert_eq!(second.attempts(), 2);

    consumer.command(&format!("FIN {}", second.id())).await;
    consumer.command("NOP").await;
    assert!(consumer.try_next_frame(Duration::from_millis(200)).await.is_none());

    let stats = daemon.stats();
    assert_eq!(stats[0].channels[0].in_flight_count, 0);
    assert_eq!(stats[0].channels[0].requeue_count, 1);

    consumer.close().await;
    producer.close().await;
    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rdy_bounds_messages_in_flight() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (daemon, addr) = start_daemon(test_options(dir.path())).await;

    let mut consumer = TestClient::connect(addr).await;
    consumer.subscribe("events", "worker").await;
    consumer.command("RDY 3").await;

    let mut producer = TestClient::connect(addr).await;
    for i in 0..5 {
        producer.publish("events", format!("m{i}").as_bytes()).await;
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(consumer.expect_message().await);
    }
    assert!(
        consumer.try_next_frame(Duration::from_millis(300)).await.is_none(),
        "a fourth message arrived while three were in flight"
    );

    consumer.command(&format!("FIN {}", received[0].id())).await;
    assert!(
        consumer.try_next_frame(Duration::from_millis(200)).await.is_none(),
        "credit was spent, nothing until the next RDY"
    );
    consumer.command("RDY 3").await;
    let fourth = consumer.expect_message().await;
    assert_eq!(&fourth.body()[..], b"m3");

    consumer.close().await;
    producer.close().await;
    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_requeues_in_flight_messages() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (daemon, addr) = start_daemon(test_options(dir.path())).await;

    let mut first = TestClient::connect(addr).await;
    first.subscribe("jobs", "runners").await;
    first.command("RDY 1").await;
    let mut producer = TestClient::connect(addr).await;
    producer.publish("jobs", b"work").await;
    let delivered = first.expect_message().await;
    first.close().await;

    let mut second = TestClient::connect(addr).await;
    second.subscribe("jobs", "runners").await;
    second.command("RDY 1").await;
    let redelivered = second.expect_message().await;
    assert_eq!(redelivered.id(), delivered.id());
    assert_eq!(redelivered.attempts(), 2);

    second.close().await;
    producer.close().await;
    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rdy_zero_then_disconnect_requeues_in_flight_messages() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (daemon, addr) = start_daemon(test_options(dir.path())).await;

    let mut first = TestClient::connect(addr).await;
    first.subscribe("batch", "workers").await;
    first.command("RDY 2").await;
    let mut producer = TestClient::connect(addr).await;
    producer.publish("batch", b"a").await;
    producer.publish("batch", b"b").await;
    let held = [first.expect_message().await, first.expect_message().await];

    first.command("RDY 0").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    producer.publish("batch", b"c").await;
    assert!(first.try_next_frame(Duration::from_millis(200)).await.is_none());
    first.close().await;

    let mut second = TestClient::connect(addr).await;
    second.subscribe("batch", "workers").await;
    second.command("RDY 3").await;
    let mut got = Vec::new();
    for _ in 0..3 {
        got.push(second.expect_message().await);
    }
    for message in &held {
        let again = got
            .iter()
            .find(|m| m.id() == message.id())
            .expect("held message redelivered");
        assert_eq!(again.attempts(), 2);
    }
    let fresh = got
        .iter()
        .find(|m| m.body().as_ref() == b"c")
        .expect("undelivered message");
    assert_eq!(fresh.attempts(), 1);
    assert_eq!(daemon.stats()[0].channels[0].in_flight_count, 3);

    second.close().await;
    producer.close().await;
    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_channel_gets_its_own_copy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (daemon, addr) = start_daemon(test_options(dir.path())).await;

    let mut a = TestClient::connect(addr).await;
    a.subscribe("fan", "a").await;
    a.command("RDY 10").await;
    let mut b = TestClient::connect(addr).await;
    b.subscribe("fan", "b").await;
    b.command("RDY 10").await;

    let mut producer = TestClient::connect(addr).await;
    let mut body = Vec::new();
    body.extend_from_slice(&2u32.to_be_bytes());
    for part in [&b"one"[..], &b"two"[..]] {
        body.extend_from_slice(&(part.len() as u32).to_be_bytes());
        body.extend_from_slice(part);
    }
    producer.command_with_body("MPUB fan", &body).await;
    producer.expect_ok().await;

    for client in [&mut a, &mut b] {
        let m1 = client.expect_message().await;
        let m2 = client.expect_message().await;
        assert_eq!(&m1.body()[..], b"one");
        assert_eq!(&m2.body()[..], b"two");
    }

    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deferred_publish_and_message_timeout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (daemon, addr) = start_daemon(test_options(dir.path())).await;

    let mut consumer = TestClient::connect(addr).await;
    consumer
        .command_with_body("IDENTIFY", br#"{"msg_timeout":1000}"#)
        .await;
    consumer.expect_ok().await;
    consumer.subscribe("later", "c").await;
    consumer.command("RDY 1").await;

    let mut producer = TestClient::connect(addr).await;
    producer.command_with_body("DPUB later 400", b"soon").await;
    producer.expect_ok().await;

    assert!(consumer.try_next_frame(Duration::from_millis(200)).await.is_none());
    let first = consumer.expect_message().await;
    assert_eq!(&first.body()[..], b"soon");
    consumer.command("RDY 1").await;

    // never finished: the scanner times it out and it comes back
    let again = consumer.expect_message().await;
    assert_eq!(again.id(), first.id());
    assert_eq!(again.attempts(), 2);
    assert_eq!(daemon.stats()[0].channels[0].timeout_count, 1);

    daemon.shutdown().await;
}

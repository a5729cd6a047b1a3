#[path = "common.rs"]
mod common;

use common::{start_daemon, test_options, TestClient};
use rillmq::core::metadata::METADATA_FILE;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_messages_and_metadata_survive_restart() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let (daemon, addr) = start_daemon(test_options(dir.path())).await;
        daemon.create_channel("durable", "keep").expect("channel");
        daemon.create_channel("durable", "paused").expect("channel");
        daemon.pause_channel("durable", "paused").expect("pause");
        daemon.create_channel("durable", "gone#ephemeral").expect("channel");

        let mut producer = TestClient::connect(addr).await;
        for i in 0..3 {
            producer.publish("durable", format!("m{i}").as_bytes()).await;
        }
        producer.close().await;
        daemon.shutdown().await;
    }

    let raw = std::fs::read_to_string(dir.path().join(METADATA_FILE)).expect("metadata");
    assert!(!raw.contains("ephemeral"), "{raw}");

    let (daemon, addr) = start_daemon(test_options(dir.path())).await;
    let stats = daemon.stats();
    assert_eq!(stats.len(), 1);
    let names: Vec<_> = stats[0].channels.iter().map(|c| c.channel_name.as_str()).collect();
    assert_eq!(names, vec!["keep", "paused"]);
    assert!(stats[0].channels[1].paused);
    assert_eq!(stats[0].channels[0].depth, 3);

    let mut consumer = TestClient::connect(addr).await;
    consumer.subscribe("durable", "keep").await;
    consumer.command("RDY 3").await;
    for i in 0..3 {
        let message = consumer.expect_message().await;
        assert_eq!(&message.body()[..], format!("m{i}").as_bytes());
        consumer.command(&format!("FIN {}", message.id())).await;
    }

    consumer.close().await;
    daemon.shutdown().await;
}

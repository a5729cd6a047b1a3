use rillmq::config::TlsRequired;
use rillmq::Options;

#[test]
fn load_config_matches_toml() {
    let opts = Options::from_file("rillmq.toml").expect("failed to load config");

    assert_eq!(opts.tcp_address, "127.0.0.1:4150");
    assert_eq!(opts.http_address, "127.0.0.1:4151");
    assert_eq!(opts.data_path, std::path::PathBuf::from("./data"));
    assert_eq!(opts.mem_queue_size, 5000);
    assert_eq!(opts.max_bytes_per_file, 10_485_760);
    assert_eq!(opts.sync_every, 1000);
    assert_eq!(opts.msg_timeout_ms, 30_000);
    assert_eq!(opts.max_rdy_count, 500);
    assert_eq!(opts.auth_secrets, vec!["supersecret".to_string()]);
    assert_eq!(opts.lookupd_tcp_addresses, vec!["127.0.0.1:4160".to_string()]);
    assert_eq!(opts.tls_required, TlsRequired::Off);
    assert_eq!(opts.max_deflate_level, 9);
    assert_eq!(opts.log_level.as_deref(), Some("info"));
    assert!(opts.auth_enabled());
    assert!(!opts.tls_enabled());

    // untouched fields keep their defaults
    assert_eq!(opts.max_msg_size, 1024 * 1024);
    assert_eq!(opts.queue_scan_selection_count, 20);
    opts.validate().expect("sample config validates");
}

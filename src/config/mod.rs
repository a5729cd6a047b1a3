//! Runtime options for the broker.
//!
//! Options are resolved once at startup (defaults, then an optional TOML
//! file, then `RILLMQ_*` environment overrides) and shared as an immutable
//! `Arc<Options>` snapshot for the lifetime of the daemon.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Whether plain-text clients may issue data commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsRequired {
    #[default]
    Off,
    TcpTls,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Options {
    // basic
    pub node_id: u16,
    pub log_level: Option<String>,
    pub tcp_address: String,
    pub http_address: String,
    pub broadcast_address: String,
    pub lookupd_tcp_addresses: Vec<String>,
    pub auth_secrets: Vec<String>,

    // backing queue
    pub data_path: PathBuf,
    pub mem_queue_size: usize,
    pub max_bytes_per_file: u64,
    pub sync_every: u64,
    pub sync_timeout_ms: u64,

    // scan loop
    pub queue_scan_interval_ms: u64,
    pub queue_scan_refresh_interval_ms: u64,
    pub queue_scan_selection_count: usize,
    pub queue_scan_worker_pool_max: usize,
    pub queue_scan_dirty_percent: f64,

    // messages
    pub msg_timeout_ms: u64,
    pub max_msg_timeout_ms: u64,
    pub max_msg_size: u64,
    pub max_body_size: u64,
    pub max_req_timeout_ms: u64,
    pub client_timeout_ms: u64,

    // client overridable
    pub max_heartbeat_interval_ms: u64,
    pub max_rdy_count: u64,
    pub max_output_buffer_size: u64,
    pub max_output_buffer_timeout_ms: u64,
    pub min_output_buffer_timeout_ms: u64,
    pub output_buffer_timeout_ms: u64,
    pub max_channel_consumers: usize,

    // statsd (accepted for compatibility, nothing is emitted)
    pub statsd_address: Option<String>,
    pub statsd_prefix: String,
    pub statsd_interval_ms: u64,

    // tls
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_required: TlsRequired,

    // compression
    pub deflate_enabled: bool,
    pub max_deflate_level: u32,
    pub snappy_enabled: bool,
}

impl Default for Options {
    fn default() -> Self {
        let hostname = local_hostname();
        Self {
            node_id: default_node_id(&hostname),
            log_level: None,
            tcp_address: "0.0.0.0:4150".to_string(),
            http_address: "0.0.0.0:4151".to_string(),
            broadcast_address: hostname,
            lookupd_tcp_addresses: Vec::new(),
            auth_secrets: Vec::new(),

            data_path: PathBuf::from("."),
            mem_queue_size: 10_000,
            max_bytes_per_file: 100 * MIB,
            sync_every: 2500,
            sync_timeout_ms: 2_000,

            queue_scan_interval_ms: 100,
            queue_scan_refresh_interval_ms: 5_000,
            queue_scan_selection_count: 20,
            queue_scan_worker_pool_max: 4,
            queue_scan_dirty_percent: 0.25,

            msg_timeout_ms: 60_000,
            max_msg_timeout_ms: 15 * 60_000,
            max_msg_size: MIB,
            max_body_size: 5 * MIB,
            max_req_timeout_ms: 60 * 60_000,
            client_timeout_ms: 60_000,

            max_heartbeat_interval_ms: 60_000,
            max_rdy_count: 2500,
            max_output_buffer_size: 64 * KIB,
            max_output_buffer_timeout_ms: 30_000,
            min_output_buffer_timeout_ms: 25,
            output_buffer_timeout_ms: 250,
            max_channel_consumers: 0,

            statsd_address: None,
            statsd_prefix: "rillmq.%s".to_string(),
            statsd_interval_ms: 60_000,

            tls_cert: None,
            tls_key: None,
            tls_required: TlsRequired::Off,

            deflate_enabled: true,
            max_deflate_level: 6,
            snappy_enabled: true,
        }
    }
}

impl Options {
    /// Load options from an optional TOML file and `RILLMQ_*` environment variables.
    ///
    /// Precedence: built-in defaults, then file values, then environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = env::var("RILLMQ_CONFIG").ok().map(PathBuf::from);
        let effective_path = path.map(Path::to_path_buf).or(env_path);

        let mut opts = match effective_path {
            Some(p) => Self::from_file(p)?,
            None => Options::default(),
        };
        opts.apply_env()?;
        Ok(opts)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = env::var("RILLMQ_TCP_ADDRESS") {
            self.tcp_address = v;
        }
        if let Ok(v) = env::var("RILLMQ_DATA_PATH") {
            self.data_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("RILLMQ_MEM_QUEUE_SIZE") {
            self.mem_queue_size = parse_env("RILLMQ_MEM_QUEUE_SIZE", &v)?;
        }
        if let Ok(v) = env::var("RILLMQ_MAX_BYTES_PER_FILE") {
            self.max_bytes_per_file = parse_env("RILLMQ_MAX_BYTES_PER_FILE", &v)?;
        }
        if let Ok(v) = env::var("RILLMQ_SYNC_EVERY") {
            self.sync_every = parse_env("RILLMQ_SYNC_EVERY", &v)?;
        }
        if let Ok(v) = env::var("RILLMQ_NODE_ID") {
            self.node_id = parse_env("RILLMQ_NODE_ID", &v)?;
        }
        if let Ok(v) = env::var("RILLMQ_MAX_RDY_COUNT") {
            self.max_rdy_count = parse_env("RILLMQ_MAX_RDY_COUNT", &v)?;
        }
        if let Ok(v) = env::var("RILLMQ_AUTH_SECRETS") {
            self.auth_secrets = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = env::var("RILLMQ_LOG_LEVEL") {
            self.log_level = Some(v);
        }
        Ok(())
    }

    /// Reject option combinations the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id > 1023 {
            return Err(ConfigError::Invalid(format!(
                "node_id {} must be in [0, 1023]",
                self.node_id
            )));
        }
        if !(1..=9).contains(&self.max_deflate_level) {
            return Err(ConfigError::Invalid(format!(
                "max_deflate_level {} must be in [1, 9]",
                self.max_deflate_level
            )));
        }
        if self.min_output_buffer_timeout_ms > self.max_output_buffer_timeout_ms {
            return Err(ConfigError::Invalid(
                "min_output_buffer_timeout_ms exceeds max_output_buffer_timeout_ms".into(),
            ));
        }
        if self.msg_timeout_ms > self.max_msg_timeout_ms {
            return Err(ConfigError::Invalid(
                "msg_timeout_ms exceeds max_msg_timeout_ms".into(),
            ));
        }
        if self.queue_scan_worker_pool_max == 0 {
            return Err(ConfigError::Invalid(
                "queue_scan_worker_pool_max must be at least 1".into(),
            ));
        }
        if self.queue_scan_selection_count == 0 {
            return Err(ConfigError::Invalid(
                "queue_scan_selection_count must be at least 1".into(),
            ));
        }
        if !(self.queue_scan_dirty_percent > 0.0 && self.queue_scan_dirty_percent <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "queue_scan_dirty_percent {} must be in (0, 1]",
                self.queue_scan_dirty_percent
            )));
        }
        if self.max_msg_size > self.max_body_size {
            return Err(ConfigError::Invalid(
                "max_msg_size exceeds max_body_size".into(),
            ));
        }
        if self.max_bytes_per_file < 1024 {
            return Err(ConfigError::Invalid(
                "max_bytes_per_file must be at least 1024".into(),
            ));
        }
        if self.tls_required != TlsRequired::Off
            && (self.tls_cert.is_none() || self.tls_key.is_none())
        {
            return Err(ConfigError::Invalid(
                "tls_required needs both tls_cert and tls_key".into(),
            ));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::Invalid(
                "tls_cert and tls_key must be set together".into(),
            ));
        }
        Ok(())
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn queue_scan_interval(&self) -> Duration {
        Duration::from_millis(self.queue_scan_interval_ms)
    }

    pub fn queue_scan_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.queue_scan_refresh_interval_ms)
    }

    pub fn msg_timeout(&self) -> Duration {
        Duration::from_millis(self.msg_timeout_ms)
    }

    pub fn max_msg_timeout(&self) -> Duration {
        Duration::from_millis(self.max_msg_timeout_ms)
    }

    pub fn max_req_timeout(&self) -> Duration {
        Duration::from_millis(self.max_req_timeout_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn max_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.max_heartbeat_interval_ms)
    }

    pub fn output_buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.output_buffer_timeout_ms)
    }

    pub fn min_output_buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.min_output_buffer_timeout_ms)
    }

    pub fn max_output_buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.max_output_buffer_timeout_ms)
    }

    pub fn auth_enabled(&self) -> bool {
        !self.auth_secrets.is_empty()
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

fn parse_env<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::Parse(format!("{key}: {e}")))
}

fn local_hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_node_id(hostname: &str) -> u16 {
    (crc32c::crc32c(hostname.as_bytes()) % 1024) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let opts = Options::default();
        opts.validate().expect("defaults must be valid");
        assert!(opts.node_id < 1024);
        assert_eq!(opts.mem_queue_size, 10_000);
        assert_eq!(opts.max_bytes_per_file, 100 * MIB);
        assert_eq!(opts.msg_timeout(), Duration::from_secs(60));
        assert_eq!(opts.max_msg_timeout(), Duration::from_secs(15 * 60));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let opts = Options::from_toml_str(
            r#"
            tcp_address = "127.0.0.1:5150"
            mem_queue_size = 5
            tls_required = "off"
            "#,
        )
        .expect("parse");
        assert_eq!(opts.tcp_address, "127.0.0.1:5150");
        assert_eq!(opts.mem_queue_size, 5);
        assert_eq!(opts.sync_every, 2500);
        assert_eq!(opts.max_rdy_count, 2500);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut opts = Options {
            node_id: 2048,
            ..Options::default()
        };
        assert!(matches!(opts.validate(), Err(ConfigError::Invalid(_))));

        opts.node_id = 1;
        opts.max_deflate_level = 0;
        assert!(opts.validate().is_err());

        opts.max_deflate_level = 6;
        opts.tls_required = TlsRequired::TcpTls;
        assert!(opts.validate().is_err());

        opts.tls_required = TlsRequired::Off;
        opts.queue_scan_dirty_percent = 1.5;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn unknown_type_is_a_toml_error() {
        let err = Options::from_toml_str("mem_queue_size = \"lots\"").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }
}

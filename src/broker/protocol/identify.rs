//! IDENTIFY feature negotiation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::protocol::error::{ProtocolError, E_BAD_BODY};
use crate::config::Options;

pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 16 * 1024;
const MIN_OUTPUT_BUFFER_SIZE: i64 = 64;
const MIN_HEARTBEAT_INTERVAL_MS: i64 = 1000;
const MIN_MSG_TIMEOUT_MS: i64 = 1000;
const DEFAULT_DEFLATE_LEVEL: i32 = 6;

/// What a client asks for. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdentifyRequest {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub feature_negotiation: bool,
    pub heartbeat_interval: i64,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: i32,
    pub snappy: bool,
    pub sample_rate: i32,
    pub msg_timeout: i64,
}

/// JSON body returned when the client set `feature_negotiation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub max_rdy_count: u64,
    pub version: String,
    pub max_msg_timeout: u64,
    pub msg_timeout: u64,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: u32,
    pub max_deflate_level: u32,
    pub snappy: bool,
    pub sample_rate: u8,
    pub auth_required: bool,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
}

/// Settings the session applies after a successful IDENTIFY.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    /// `None` disables heartbeats and the read deadline.
    pub heartbeat_interval: Option<Duration>,
    /// Zero disables output buffering.
    pub output_buffer_size: usize,
    /// `None` flushes every write.
    pub output_buffer_timeout: Option<Duration>,
    pub tls: bool,
    pub deflate: Option<u32>,
    pub snappy: bool,
    pub sample_rate: u8,
    pub msg_timeout: Duration,
}

impl Negotiated {
    /// Settings for a connection that never sends IDENTIFY.
    pub fn defaults(options: &Options) -> Self {
        Self {
            heartbeat_interval: Some(options.client_timeout() / 2),
            output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
            output_buffer_timeout: Some(options.output_buffer_timeout()),
            tls: false,
            deflate: None,
            snappy: false,
            sample_rate: 0,
            msg_timeout: options.msg_timeout(),
        }
    }

    pub fn response(&self, options: &Options, auth_required: bool) -> IdentifyResponse {
        IdentifyResponse {
            max_rdy_count: options.max_rdy_count,
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_msg_timeout: options.max_msg_timeout_ms,
            msg_timeout: self.msg_timeout.as_millis() as u64,
            tls_v1: self.tls,
            deflate: self.deflate.is_some(),
            deflate_level: self.deflate.unwrap_or(0),
            max_deflate_level: options.max_deflate_level,
            snappy: self.snappy,
            sample_rate: self.sample_rate,
            auth_required,
            output_buffer_size: if self.output_buffer_size == 0 {
                -1
            } else {
                self.output_buffer_size as i64
            },
            output_buffer_timeout: self
                .output_buffer_timeout
                .map(|d| d.as_millis() as i64)
                .unwrap_or(-1),
        }
    }
}

fn bad_body(message: String) -> ProtocolError {
    ProtocolError::fatal(E_BAD_BODY, message)
}

/// Validate `req` against the daemon limits.
pub fn negotiate(
    req: &IdentifyRequest,
    options: &Options,
    tls_available: bool,
) -> Result<Negotiated, ProtocolError> {
    let defaults = Negotiated::defaults(options);

    let heartbeat_interval = match req.heartbeat_interval {
        -1 => None,
        0 => defaults.heartbeat_interval,
        ms if ms < MIN_HEARTBEAT_INTERVAL_MS || ms as u64 > options.max_heartbeat_interval_ms => {
            return Err(bad_body(format!(
                "IDENTIFY heartbeat interval ({ms}) is invalid"
            )));
        }
        ms => Some(Duration::from_millis(ms as u64)),
    };

    let output_buffer_size = match req.output_buffer_size {
        -1 => 0,
        0 => defaults.output_buffer_size,
        size if size < MIN_OUTPUT_BUFFER_SIZE || size as u64 > options.max_output_buffer_size => {
            return Err(bad_body(format!(
                "IDENTIFY output buffer size ({size}) is invalid"
            )));
        }
        size => size as usize,
    };

    let output_buffer_timeout = match req.output_buffer_timeout {
        -1 => None,
        0 => defaults.output_buffer_timeout,
        ms if ms < 0
            || (ms as u64) < options.min_output_buffer_timeout_ms
            || ms as u64 > options.max_output_buffer_timeout_ms =>
        {
            return Err(bad_body(format!(
                "IDENTIFY output buffer timeout ({ms}) is invalid"
            )));
        }
        ms => Some(Duration::from_millis(ms as u64)),
    };

    if !(0..=99).contains(&req.sample_rate) {
        return Err(bad_body(format!(
            "IDENTIFY sample rate ({}) is invalid",
            req.sample_rate
        )));
    }

    let msg_timeout = match req.msg_timeout {
        0 => defaults.msg_timeout,
        ms if ms < MIN_MSG_TIMEOUT_MS || ms as u64 > options.max_msg_timeout_ms => {
            return Err(bad_body(format!("IDENTIFY msg timeout ({ms}) is invalid")));
        }
        ms => Duration::from_millis(ms as u64),
    };

    let deflate = options.deflate_enabled && req.deflate;
    let snappy = options.snappy_enabled && req.snappy;
    if deflate && snappy {
        return Err(bad_body(
            "cannot enable both deflate and snappy compression".to_string(),
        ));
    }
    let deflate = if deflate {
        let requested = if req.deflate_level <= 0 {
            DEFAULT_DEFLATE_LEVEL
        } else {
            req.deflate_level
        };
        Some((requested as u32).min(options.max_deflate_level))
    } else {
        None
    };

    Ok(Negotiated {
        heartbeat_interval,
        output_buffer_size,
        output_buffer_timeout,
        tls: tls_available && req.tls_v1,
        deflate,
        snappy,
        sample_rate: req.sample_rate as u8,
        msg_timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> IdentifyRequest {
        serde_json::from_str(json).expect("json")
    }

    #[test]
    fn empty_request_gets_defaults() {
        let opts = Options::default();
        let n = negotiate(&parse("{}"), &opts, false).expect("negotiate");
        assert_eq!(n, Negotiated::defaults(&opts));
        assert_eq!(n.heartbeat_interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn explicit_values_and_disables() {
        let opts = Options::default();
        let n = negotiate(
            &parse(
                r#"{"heartbeat_interval":-1,"output_buffer_size":-1,"output_buffer_timeout":-1,
                    "msg_timeout":5000,"sample_rate":20,"deflate":true,"deflate_level":9,
                    "tls_v1":true,"unknown_field":1}"#,
            ),
            &opts,
            false,
        )
        .expect("negotiate");
        assert_eq!(n.heartbeat_interval, None);
        assert_eq!(n.output_buffer_size, 0);
        assert_eq!(n.output_buffer_timeout, None);
        assert_eq!(n.msg_timeout, Duration::from_secs(5));
        assert_eq!(n.sample_rate, 20);
        assert_eq!(n.deflate, Some(6), "capped by max_deflate_level");
        assert!(!n.tls, "no TLS material configured");

        let resp = n.response(&opts, false);
        assert_eq!(resp.output_buffer_size, -1);
        assert_eq!(resp.deflate_level, 6);
        assert_eq!(resp.msg_timeout, 5000);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let opts = Options::default();
        for body in [
            r#"{"heartbeat_interval":10}"#,
            r#"{"heartbeat_interval":999999999}"#,
            r#"{"output_buffer_size":10}"#,
            r#"{"output_buffer_timeout":1}"#,
            r#"{"sample_rate":100}"#,
            r#"{"msg_timeout":10}"#,
            r#"{"deflate":true,"snappy":true}"#,
        ] {
            let err = negotiate(&parse(body), &opts, true).expect_err(body);
            assert_eq!(err.code, E_BAD_BODY, "{body}");
            assert!(err.fatal);
        }
    }

    #[test]
    fn disabled_compression_is_not_negotiated() {
        let opts = Options {
            snappy_enabled: false,
            ..Options::default()
        };
        let n = negotiate(&parse(r#"{"snappy":true}"#), &opts, true).expect("negotiate");
        assert!(!n.snappy);
    }
}

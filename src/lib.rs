//! RillMQ – a single-node topic/channel message broker speaking the V2
//! wire protocol.
//!
//! This crate exports
//!  * `core`    – messages, topics, channels, backing queues, timeout scanning
//!  * `broker`  – V2 protocol sessions, the TCP accept loop and the daemon
//!  * `config`  – TOML + environment runtime configuration
//!  * `logging` – tracing subscriber setup
//!
//! Applications can embed the daemon (`Daemon::new` → `run` → `shutdown`)
//! or drive topics directly through `core`.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod config;
pub mod core;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use broker::Daemon;
pub use config::{ConfigError, Options};
pub use core::error::BrokerError;

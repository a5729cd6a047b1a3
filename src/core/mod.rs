//! Queue engine: messages, topics, channels, backing queues and the
//! timeout scanner. Nothing in here knows about sockets.

pub mod auth;
pub mod channel;
pub mod client;
pub mod context;
pub mod error;
pub mod guid;
pub mod lookup;
pub mod message;
pub mod metadata;
pub mod names;
pub mod pqueue;
pub mod queue;
pub mod queue_scan;
pub mod stats;
pub mod topics;

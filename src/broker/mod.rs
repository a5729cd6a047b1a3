//! # Broker Module
//!
//! Everything between the socket and the core queue engine.
//!
//! - `protocol`: V2 command decoding, frames, IDENTIFY and the client session.
//! - `engine`: the accept loop that spawns one session per connection.
//! - `daemon`: process-level wiring and the administrative API.

pub mod daemon;
pub mod engine;
pub mod protocol;

pub use daemon::Daemon;

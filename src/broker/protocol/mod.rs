//! The V2 client protocol: command decoding, response frames, feature
//! negotiation and the per-connection session.

pub mod codec;
pub mod command;
pub mod error;
pub mod frame;
pub mod identify;
pub mod session;

pub use error::ProtocolError;
pub use session::{Session, SessionContext};

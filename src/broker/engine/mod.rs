//! TCP accept loop for V2 clients.

pub mod server;

pub use server::Server;

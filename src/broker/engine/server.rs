//! Accept loop for V2 client connections.
//!
//! Each connection gets its own session task. On shutdown the loop stops
//! accepting, then waits for every session to finish so that their
//! in-flight messages are back in the channel queues before the daemon
//! flushes to disk.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, Instrument};

use crate::broker::protocol::{Session, SessionContext};
use crate::core::client::ClientId;

pub struct Server {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    shutdown: watch::Receiver<bool>,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        ctx: Arc<SessionContext>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            ctx,
            shutdown,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until a shutdown signal is received, then drain
    /// the sessions it spawned.
    pub async fn run(self) {
        let bind_addr = self
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let span = info_span!("tcp_server", bind_addr = %bind_addr);
        self.accept_loop().instrument(span).await
    }

    async fn accept_loop(self) {
        let Server {
            listener,
            ctx,
            shutdown,
        } = self;
        info!(target: "rillmq::daemon", "accepting V2 clients");

        let mut next_conn_id: u64 = 1;
        let mut shutdown_rx = shutdown.clone();
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            let conn_id = ClientId(next_conn_id);
                            next_conn_id = next_conn_id.wrapping_add(1);
                            if let Err(err) = stream.set_nodelay(true) {
                                debug!(target: "rillmq::daemon", error = %err, "set_nodelay failed");
                            }
                            debug!(target: "rillmq::daemon", client_id = %conn_id, remote = %addr, "accepted connection");

                            let session = Session::new(
                                conn_id,
                                stream,
                                addr.to_string(),
                                Arc::clone(&ctx),
                                shutdown.clone(),
                            );
                            sessions.spawn(session.run());
                        }
                        Err(err) => {
                            error!(target: "rillmq::daemon", error = %err, "accept error");
                        }
                    }
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = joined {
                        error!(target: "rillmq::daemon", error = %err, "session task failed");
                    }
                }
                result = shutdown_rx.changed() => {
                    match result {
                        Ok(_) => info!(target: "rillmq::daemon", "shutdown signal received; stopping accept loop"),
                        Err(_) => info!(target: "rillmq::daemon", "shutdown sender dropped; stopping accept loop"),
                    }
                    break;
                }
            }
        }

        drop(listener);
        let open = sessions.len();
        if open > 0 {
            info!(target: "rillmq::daemon", open, "waiting for client sessions to close");
        }
        while let Some(joined) = sessions.join_next().await {
            if let Err(err) = joined {
                error!(target: "rillmq::daemon", error = %err, "session task failed");
            }
        }
    }
}

//! Process-level wiring.
//!
//! A [`Daemon`] owns the topic registry and the three background tasks
//! (accept loop, queue scan loop, sync loop). `shutdown()` tears them down
//! in a fixed order: stop accepting and close sessions, stop scanning,
//! flush memory buffers, persist metadata, then close and sync every
//! backing queue.

use std::fs::{self, File};
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio::time::{interval, MissedTickBehavior};
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::broker::engine::Server;
use crate::broker::protocol::SessionContext;
use crate::config::Options;
use crate::core::auth::{Authorizer, StaticSecretAuthorizer};
use crate::core::channel::Channel;
use crate::core::context::Context;
use crate::core::error::BrokerError;
use crate::core::lookup::LoggingNotifier;
use crate::core::metadata::JsonFileStore;
use crate::core::queue_scan::QueueScanner;
use crate::core::stats::TopicStats;
use crate::core::topics::{Topic, TopicRegistry};

#[derive(Default)]
struct Tasks {
    server: Option<JoinHandle<()>>,
    scanner: Option<JoinHandle<()>>,
    sync: Option<JoinHandle<()>>,
}

pub struct Daemon {
    options: Arc<Options>,
    registry: Arc<TopicRegistry>,
    sessions: Arc<SessionContext>,
    /// Stops the accept loop and every client session.
    accept_shutdown: watch::Sender<bool>,
    /// Stops the scan and sync loops.
    background_shutdown: watch::Sender<bool>,
    tasks: Mutex<Tasks>,
    local_addr: Mutex<Option<SocketAddr>>,
}

fn load_tls(cert: &Path, key: &Path) -> anyhow::Result<TlsAcceptor> {
    let mut cert_reader = BufReader::new(
        File::open(cert).with_context(|| format!("opening TLS certificate {}", cert.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing TLS certificate {}", cert.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates in {}", cert.display()));
    }

    let mut key_reader = BufReader::new(
        File::open(key).with_context(|| format!("opening TLS key {}", key.display()))?,
    );
    let private_key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("parsing TLS key {}", key.display()))?
        .ok_or_else(|| anyhow!("no private key in {}", key.display()))?;

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("selecting TLS protocol versions")?
    .with_no_client_auth()
    .with_single_cert(certs, private_key)
    .context("building TLS server config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Runs every fsync and metadata write on the blocking pool, either on the
/// sync timer or as soon as a queue or the registry asks for it.
async fn sync_loop(
    registry: Arc<TopicRegistry>,
    options: Arc<Options>,
    mut shutdown: watch::Receiver<bool>,
) {
    let requests = Arc::clone(&registry.context().sync_requests);
    let mut tick = interval(options.sync_timeout());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
            _ = requests.notified() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        let registry = Arc::clone(&registry);
        let synced = task::spawn_blocking(move || {
            registry.sync_backends();
            registry.persist_if_dirty();
        })
        .await;
        if let Err(err) = synced {
            error!(target: "rillmq::daemon", error = %err, "sync pass failed");
        }
    }
    debug!(target: "rillmq::daemon", "sync loop stopped");
}

async fn join_task(name: &str, handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if let Err(err) = handle.await {
            error!(target: "rillmq::daemon", task = name, error = %err, "background task failed");
        }
    }
}

impl Daemon {
    /// Build the daemon from validated options. Nothing is bound yet.
    pub fn new(options: Options) -> anyhow::Result<Self> {
        options.validate().context("invalid configuration")?;
        fs::create_dir_all(&options.data_path).with_context(|| {
            format!("creating data path {}", options.data_path.display())
        })?;
        let options = Arc::new(options);

        let tls = match (&options.tls_cert, &options.tls_key) {
            (Some(cert), Some(key)) => Some(load_tls(cert, key)?),
            _ => None,
        };
        let authorizer: Option<Arc<dyn Authorizer>> = if options.auth_enabled() {
            Some(Arc::new(StaticSecretAuthorizer::from_secrets(
                options.auth_secrets.iter().cloned(),
            )))
        } else {
            None
        };

        let lookup = Arc::new(LoggingNotifier::new(options.lookupd_tcp_addresses.clone()));
        let ctx = Arc::new(Context::new(Arc::clone(&options), lookup));
        let store = Arc::new(JsonFileStore::new(&options.data_path));
        let registry = TopicRegistry::new(ctx, store);

        let sessions = Arc::new(SessionContext {
            registry: Arc::clone(&registry),
            options: Arc::clone(&options),
            authorizer,
            tls,
        });

        let (accept_shutdown, _) = watch::channel(false);
        let (background_shutdown, _) = watch::channel(false);

        Ok(Self {
            options,
            registry,
            sessions,
            accept_shutdown,
            background_shutdown,
            tasks: Mutex::new(Tasks::default()),
            local_addr: Mutex::new(None),
        })
    }

    pub fn options(&self) -> &Arc<Options> {
        &self.options
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// Recreate topics and channels from the metadata file.
    pub fn load_metadata(&self) -> anyhow::Result<()> {
        self.registry
            .load_metadata()
            .context("loading metadata")?;
        info!(
            target: "rillmq::daemon",
            topics = self.registry.list_topics().len(),
            "metadata loaded"
        );
        Ok(())
    }

    /// Bind the TCP listener and spawn the background tasks. Returns the
    /// bound address.
    pub async fn run(&self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.options.tcp_address)
            .await
            .with_context(|| format!("binding {}", self.options.tcp_address))?;
        let server = Server::new(
            listener,
            Arc::clone(&self.sessions),
            self.accept_shutdown.subscribe(),
        );
        let addr = server.local_addr().context("reading listener address")?;
        *self.local_addr.lock() = Some(addr);
        info!(
            target: "rillmq::daemon",
            tcp_address = %addr,
            http_address = %self.options.http_address,
            data_path = %self.options.data_path.display(),
            tls = self.sessions.tls.is_some(),
            auth = self.sessions.authorizer.is_some(),
            "rillmqd listening"
        );

        let scanner = QueueScanner::new(Arc::clone(&self.registry), Arc::clone(&self.options));
        let sync = sync_loop(
            Arc::clone(&self.registry),
            Arc::clone(&self.options),
            self.background_shutdown.subscribe(),
        );

        let mut tasks = self.tasks.lock();
        tasks.server = Some(tokio::spawn(server.run()));
        tasks.scanner = Some(tokio::spawn(
            scanner.run(self.background_shutdown.subscribe()),
        ));
        tasks.sync = Some(tokio::spawn(sync));
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Stop everything and leave the data directory consistent.
    pub async fn shutdown(&self) {
        info!(target: "rillmq::daemon", "shutting down");
        let (server, scanner, sync) = {
            let mut tasks = self.tasks.lock();
            (tasks.server.take(), tasks.scanner.take(), tasks.sync.take())
        };

        self.accept_shutdown.send_replace(true);
        join_task("server", server).await;

        self.background_shutdown.send_replace(true);
        join_task("scanner", scanner).await;
        join_task("sync", sync).await;

        let registry = Arc::clone(&self.registry);
        let closed = task::spawn_blocking(move || {
            registry.flush_all();
            if let Err(err) = registry.persist_metadata() {
                error!(target: "rillmq::daemon", error = %err, "failed to persist metadata at exit");
            }
            registry.close_all();
        })
        .await;
        if let Err(err) = closed {
            error!(target: "rillmq::daemon", error = %err, "closing topics failed");
        }
        info!(target: "rillmq::daemon", "shutdown complete");
    }

    // ───────────────────────────────────────────────────────────
    // Administrative API
    // ───────────────────────────────────────────────────────────

    pub fn stats(&self) -> Vec<TopicStats> {
        self.registry.stats()
    }

    fn topic(&self, name: &str) -> Result<Arc<Topic>, BrokerError> {
        self.registry
            .get_topic(name)
            .ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))
    }

    fn channel(&self, topic: &str, channel: &str) -> Result<Arc<Channel>, BrokerError> {
        self.topic(topic)?
            .channel(channel)
            .ok_or_else(|| BrokerError::ChannelNotFound(channel.to_string()))
    }

    pub fn create_topic(&self, name: &str) -> Result<(), BrokerError> {
        self.registry.create_or_get_topic(name).map(|_| ())
    }

    pub fn delete_topic(&self, name: &str) -> Result<(), BrokerError> {
        self.registry.delete_topic(name)
    }

    pub fn pause_topic(&self, name: &str) -> Result<(), BrokerError> {
        self.topic(name)?.pause();
        info!(target: "rillmq::daemon", topic = %name, "paused topic");
        Ok(())
    }

    pub fn unpause_topic(&self, name: &str) -> Result<(), BrokerError> {
        self.topic(name)?.unpause();
        info!(target: "rillmq::daemon", topic = %name, "unpaused topic");
        Ok(())
    }

    pub fn empty_topic(&self, name: &str) -> Result<(), BrokerError> {
        self.topic(name)?.empty()
    }

    pub fn create_channel(&self, topic: &str, channel: &str) -> Result<(), BrokerError> {
        self.registry
            .create_or_get_topic(topic)?
            .get_channel(channel)
            .map(|_| ())
    }

    pub fn delete_channel(&self, topic: &str, channel: &str) -> Result<(), BrokerError> {
        self.topic(topic)?.delete_channel(channel)
    }

    pub fn pause_channel(&self, topic: &str, channel: &str) -> Result<(), BrokerError> {
        self.channel(topic, channel)?.pause();
        info!(target: "rillmq::daemon", topic = %topic, channel = %channel, "paused channel");
        self.registry.request_persist();
        Ok(())
    }

    pub fn unpause_channel(&self, topic: &str, channel: &str) -> Result<(), BrokerError> {
        self.channel(topic, channel)?.unpause();
        info!(target: "rillmq::daemon", topic = %topic, channel = %channel, "unpaused channel");
        self.registry.request_persist();
        Ok(())
    }

    pub fn empty_channel(&self, topic: &str, channel: &str) -> Result<(), BrokerError> {
        self.channel(topic, channel)?.empty()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let running = self.tasks.lock().server.is_some();
        if running {
            warn!(target: "rillmq::daemon", "daemon dropped without shutdown()");
            self.accept_shutdown.send_replace(true);
            self.background_shutdown.send_replace(true);
        }
    }
}

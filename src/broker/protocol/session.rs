//! One V2 client connection.
//!
//! The session waits on several things at once: the next inbound bytes, the
//! next deliverable message of its channel (only while the client has RDY
//! credit), the heartbeat and read deadlines, the output buffer deadline,
//! and daemon shutdown. Whatever fires first is turned into an [`Event`]
//! and handled with exclusive access to the session.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::broker::protocol::codec::{Stream, Transport};
use crate::broker::protocol::command::{CommandDecoder, Request, Verb};
use crate::broker::protocol::error::*;
use crate::broker::protocol::frame::{
    encode_frame, encode_message_frame, FrameType, CLOSE_WAIT, HEARTBEAT, MAGIC_V2, OK,
};
use crate::broker::protocol::identify::{negotiate, IdentifyRequest, Negotiated};
use crate::config::{Options, TlsRequired};
use crate::core::auth::{Authorizer, Secret};
use crate::core::channel::Channel;
use crate::core::client::{ClientId, ClientState};
use crate::core::error::BrokerError;
use crate::core::message::{Message, MessageId};
use crate::core::names;
use crate::core::topics::TopicRegistry;

const SUB_RETRIES: usize = 2;
const SUB_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Everything a session needs from the daemon.
pub struct SessionContext {
    pub registry: Arc<TopicRegistry>,
    pub options: Arc<Options>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub tls: Option<TlsAcceptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Subscribed,
    Publishing,
    /// After CLS: no new deliveries, FIN/REQ/TOUCH still accepted.
    Closing,
}

#[derive(Debug, Error)]
enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

type CommandResult = Result<Option<Bytes>, SessionError>;

enum Event {
    Read(io::Result<usize>),
    Message(Option<Arc<Message>>),
    Wake,
    Heartbeat,
    ReadTimeout,
    Flush,
    Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

pub struct Session {
    id: ClientId,
    remote: String,
    ctx: Arc<SessionContext>,
    transport: Transport,
    decoder: CommandDecoder,
    client: Arc<ClientState>,
    channel: Option<Arc<Channel>>,
    state: State,
    identified: bool,
    authed: bool,
    settings: Negotiated,
    out: BytesMut,
    flush_at: Option<Instant>,
    last_read: Instant,
    last_heartbeat: Instant,
    shutdown: watch::Receiver<bool>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_message(channel: Option<Arc<Channel>>) -> Option<Arc<Message>> {
    match channel {
        Some(channel) => channel.pop_wait().await,
        None => std::future::pending().await,
    }
}

fn ok() -> CommandResult {
    Ok(Some(Bytes::from_static(OK)))
}

fn require_body(verb: Verb, body: Option<Bytes>) -> Result<Bytes, ProtocolError> {
    body.ok_or_else(|| {
        ProtocolError::fatal(E_BAD_BODY, format!("{} failed to read body", verb.as_str()))
    })
}

fn parse_id(verb: Verb, params: &[String]) -> Result<MessageId, ProtocolError> {
    let raw = params.first().ok_or_else(|| {
        ProtocolError::invalid(format!("{} insufficient number of params", verb.as_str()))
    })?;
    MessageId::from_slice(raw.as_bytes())
        .ok_or_else(|| ProtocolError::invalid(format!("{} invalid message id {raw}", verb.as_str())))
}

/// Ownership violations close the connection; a message that already
/// timed out or was finished only produces an error frame.
/// Only a topic that is going away ends the connection; storage trouble is
/// reported and the producer may retry.
fn publish_error(code: &'static str, verb: Verb, err: BrokerError) -> ProtocolError {
    let message = format!("{} failed {err}", verb.as_str());
    match err {
        BrokerError::Exiting => ProtocolError::fatal(code, message),
        _ => {
            warn!(target: "rillmq::session", error = %err, verb = verb.as_str(), "publish failed");
            ProtocolError::soft(code, message)
        }
    }
}

fn tracking_error(code: &'static str, verb: Verb, id: MessageId, err: BrokerError) -> ProtocolError {
    let message = format!("{} {id} failed {err}", verb.as_str());
    match err {
        BrokerError::NotOwner(_) => ProtocolError::fatal(code, message),
        _ => ProtocolError::soft(code, message),
    }
}

/// Split an MPUB body into message bodies.
fn parse_mpub(mut body: Bytes, max_msg_size: u64) -> Result<Vec<Bytes>, ProtocolError> {
    if body.len() < 4 {
        return Err(ProtocolError::fatal(E_BAD_BODY, "MPUB invalid body size"));
    }
    let count = body.get_u32();
    if count < 1 {
        return Err(ProtocolError::fatal(
            E_BAD_BODY,
            format!("MPUB invalid message count {count}"),
        ));
    }
    let mut bodies = Vec::with_capacity(count.min(1024) as usize);
    for idx in 0..count {
        if body.len() < 4 {
            return Err(ProtocolError::fatal(E_BAD_BODY, "MPUB insufficient body"));
        }
        let size = body.get_u32() as usize;
        if size == 0 {
            return Err(ProtocolError::fatal(
                E_BAD_MESSAGE,
                format!("MPUB invalid message({idx}) body size 0"),
            ));
        }
        if size as u64 > max_msg_size {
            return Err(ProtocolError::soft(
                E_BAD_MESSAGE,
                format!("MPUB message({idx}) too big {size} > {max_msg_size}"),
            ));
        }
        if body.len() < size {
            return Err(ProtocolError::fatal(E_BAD_BODY, "MPUB insufficient body"));
        }
        bodies.push(body.split_to(size));
    }
    if !body.is_empty() {
        return Err(ProtocolError::fatal(E_BAD_BODY, "MPUB trailing bytes after messages"));
    }
    Ok(bodies)
}

impl Session {
    pub fn new<S: Stream + 'static>(
        id: ClientId,
        stream: S,
        remote: String,
        ctx: Arc<SessionContext>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let options = &ctx.options;
        let client = Arc::new(ClientState::new(id, remote.clone(), options.msg_timeout()));
        let decoder = CommandDecoder::new(options.max_msg_size, options.max_body_size);
        let settings = Negotiated::defaults(options);
        let now = Instant::now();
        Self {
            id,
            remote,
            transport: Transport::new(stream),
            decoder,
            client,
            channel: None,
            state: State::Init,
            identified: false,
            authed: false,
            settings,
            out: BytesMut::with_capacity(4096),
            flush_at: None,
            last_read: now,
            last_heartbeat: now,
            shutdown,
            ctx,
        }
    }

    pub fn client(&self) -> &Arc<ClientState> {
        &self.client
    }

    pub async fn run(self) {
        let span = info_span!("session", client_id = %self.id, remote = %self.remote);
        self.run_instrumented().instrument(span).await
    }

    async fn run_instrumented(mut self) {
        debug!(target: "rillmq::session", "client connected");
        match self.serve().await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                debug!(target: "rillmq::session", "client hung up")
            }
            Err(err) => debug!(target: "rillmq::session", error = %err, "connection error"),
        }

        if let Err(err) = self.flush().await {
            trace!(target: "rillmq::session", error = %err, "final flush failed");
        }
        self.client.close();
        if let Some(channel) = self.channel.take() {
            channel.remove_client(self.id);
        }
        self.transport.shutdown().await;
        info!(target: "rillmq::session", "client disconnected");
    }

    async fn serve(&mut self) -> io::Result<()> {
        if !self.read_magic().await? {
            return Ok(());
        }

        loop {
            if self.client.is_closing() {
                debug!(target: "rillmq::session", "closed by broker");
                return Ok(());
            }
            if *self.shutdown.borrow() {
                return Ok(());
            }

            let client = Arc::clone(&self.client);
            let wake = client.wake().notified();
            tokio::pin!(wake);
            wake.as_mut().enable();

            let deliverable = self.state == State::Subscribed && self.client.is_ready_for_messages();
            let channel = self.channel.clone();
            let heartbeat_at = self.settings.heartbeat_interval.map(|hb| self.last_heartbeat + hb);
            let read_deadline = self.settings.heartbeat_interval.map(|hb| self.last_read + hb * 2);
            let flush_at = self.flush_at;

            let event = tokio::select! {
                res = self.transport.read() => Event::Read(res),
                msg = next_message(channel), if deliverable => Event::Message(msg),
                _ = &mut wake, if !deliverable => Event::Wake,
                _ = sleep_until_opt(heartbeat_at) => Event::Heartbeat,
                _ = sleep_until_opt(read_deadline) => Event::ReadTimeout,
                _ = sleep_until_opt(flush_at) => Event::Flush,
                _ = self.shutdown.changed() => Event::Shutdown,
            };

            match event {
                Event::Read(Ok(0)) => return Ok(()),
                Event::Read(Ok(_)) => {
                    self.last_read = Instant::now();
                    if self.process_commands().await? == Flow::Close {
                        return Ok(());
                    }
                }
                Event::Read(Err(err)) => return Err(err),
                Event::Message(Some(message)) => self.deliver(message).await?,
                Event::Message(None) => {
                    if self.channel.as_ref().is_some_and(|c| c.is_exiting()) {
                        debug!(target: "rillmq::session", "channel is exiting");
                        return Ok(());
                    }
                }
                Event::Wake => {}
                Event::Heartbeat => {
                    self.last_heartbeat = Instant::now();
                    self.send_frame(FrameType::Response, HEARTBEAT).await?;
                }
                Event::ReadTimeout => {
                    info!(target: "rillmq::session", "no data within two heartbeat intervals");
                    return Ok(());
                }
                Event::Flush => self.flush().await?,
                Event::Shutdown => return Ok(()),
            }
        }
    }

    /// False when the peer went away, sent the wrong magic or the broker is
    /// shutting down first.
    async fn read_magic(&mut self) -> io::Result<bool> {
        let deadline = Instant::now() + self.ctx.options.client_timeout();
        while self.transport.inbuf.len() < MAGIC_V2.len() {
            if *self.shutdown.borrow() {
                return Ok(false);
            }
            let n = tokio::select! {
                read = timeout_at(deadline, self.transport.read()) => read
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no protocol magic"))??,
                _ = self.shutdown.changed() => {
                    debug!(target: "rillmq::session", "shutdown before protocol magic");
                    return Ok(false);
                }
            };
            if n == 0 {
                return Ok(false);
            }
        }
        let magic = self.transport.inbuf.split_to(MAGIC_V2.len());
        if &magic[..] != MAGIC_V2 {
            warn!(target: "rillmq::session", magic = ?&magic[..], "bad protocol magic");
            let err = ProtocolError::fatal(E_BAD_PROTOCOL, "client sent bad protocol magic");
            self.send_frame(FrameType::Error, err.wire_text().as_bytes()).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn process_commands(&mut self) -> io::Result<Flow> {
        loop {
            let request = match self.decoder.decode(&mut self.transport.inbuf) {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(Flow::Continue),
                Err(err) => {
                    if self.send_error(&err).await? == Flow::Close {
                        return Ok(Flow::Close);
                    }
                    continue;
                }
            };

            trace!(target: "rillmq::session", verb = request.verb.as_str(), "command");
            match self.exec(request).await {
                Ok(Some(response)) => self.send_frame(FrameType::Response, &response).await?,
                Ok(None) => {}
                Err(SessionError::Protocol(err)) => {
                    if self.send_error(&err).await? == Flow::Close {
                        return Ok(Flow::Close);
                    }
                }
                Err(SessionError::Io(err)) => return Err(err),
            }
        }
    }

    async fn exec(&mut self, request: Request) -> CommandResult {
        let Request { verb, params, body } = request;

        if self.ctx.options.tls_required != TlsRequired::Off
            && !self.transport.is_tls()
            && !matches!(verb, Verb::Identify | Verb::Auth | Verb::Nop | Verb::Cls)
        {
            return Err(ProtocolError::invalid(format!(
                "cannot {} in current state (TLS required)",
                verb.as_str()
            ))
            .into());
        }

        match verb {
            Verb::Identify => self.identify(body).await,
            Verb::Auth => self.auth(body),
            Verb::Sub => self.sub(&params).await,
            Verb::Rdy => self.rdy(&params),
            Verb::Fin => self.fin(&params),
            Verb::Req => self.req(&params),
            Verb::Touch => self.touch(&params),
            Verb::Cls => self.cls(),
            Verb::Nop => Ok(None),
            Verb::Pub => self.publish(&params, body),
            Verb::Mpub => self.mpublish(&params, body),
            Verb::Dpub => self.dpublish(&params, body),
        }
    }

    fn check_auth(&self, verb: Verb) -> Result<(), ProtocolError> {
        if self.ctx.authorizer.is_some() && !self.authed {
            return Err(ProtocolError::fatal(
                E_UNAUTHORIZED,
                format!("AUTH required before {}", verb.as_str()),
            ));
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────
    // Negotiation
    // ───────────────────────────────────────────────────────────

    async fn identify(&mut self, body: Option<Bytes>) -> CommandResult {
        if self.identified || self.state != State::Init {
            return Err(ProtocolError::invalid("cannot IDENTIFY in current state").into());
        }
        let body = require_body(Verb::Identify, body)?;
        let request: IdentifyRequest = serde_json::from_slice(&body).map_err(|_| {
            ProtocolError::fatal(E_BAD_BODY, "IDENTIFY failed to decode JSON body")
        })?;

        let options = Arc::clone(&self.ctx.options);
        let negotiated = negotiate(&request, &options, self.ctx.tls.is_some())?;
        self.identified = true;

        self.client.update_info(|info| {
            info.client_id = request.client_id.clone();
            info.hostname = request.hostname.clone();
            info.user_agent = request.user_agent.clone();
            info.tls = negotiated.tls;
            info.deflate = negotiated.deflate.is_some();
            info.snappy = negotiated.snappy;
        });
        self.client.set_msg_timeout(negotiated.msg_timeout);
        self.settings = negotiated.clone();
        self.last_heartbeat = Instant::now();

        debug!(
            target: "rillmq::session",
            client = %request.client_id,
            hostname = %request.hostname,
            user_agent = %request.user_agent,
            tls = negotiated.tls,
            deflate = negotiated.deflate.is_some(),
            snappy = negotiated.snappy,
            "identified"
        );

        let response = if request.feature_negotiation {
            let body = negotiated.response(&options, self.ctx.authorizer.is_some());
            let json = serde_json::to_vec(&body)
                .map_err(|e| ProtocolError::fatal(E_INVALID, format!("IDENTIFY response: {e}")))?;
            Bytes::from(json)
        } else {
            Bytes::from_static(OK)
        };
        self.send_frame(FrameType::Response, &response).await?;

        if negotiated.tls {
            if let Some(acceptor) = self.ctx.tls.clone() {
                self.transport.upgrade_tls(&acceptor).await?;
                debug!(target: "rillmq::session", "upgraded to TLS");
                self.send_frame(FrameType::Response, OK).await?;
            }
        }
        if let Some(level) = negotiated.deflate {
            self.transport.enable_deflate(level);
            self.send_frame(FrameType::Response, OK).await?;
        } else if negotiated.snappy {
            self.transport.enable_snappy();
            self.send_frame(FrameType::Response, OK).await?;
        }
        Ok(None)
    }

    fn auth(&mut self, body: Option<Bytes>) -> CommandResult {
        if self.state != State::Init {
            return Err(ProtocolError::invalid("cannot AUTH in current state").into());
        }
        if !self.identified {
            return Err(ProtocolError::invalid("AUTH requires IDENTIFY first").into());
        }
        if self.authed {
            return Err(ProtocolError::invalid("AUTH already set").into());
        }
        let Some(authorizer) = self.ctx.authorizer.clone() else {
            return Err(ProtocolError::fatal(E_AUTH_DISABLED, "AUTH disabled").into());
        };
        let body = require_body(Verb::Auth, body)?;
        if body.is_empty() {
            return Err(ProtocolError::fatal(E_BAD_BODY, "AUTH invalid body size 0").into());
        }

        let secret = Secret::new(String::from_utf8_lossy(&body).into_owned());
        let grant = authorizer
            .authorize(&self.remote, self.transport.is_tls(), &secret)
            .ok_or_else(|| ProtocolError::fatal(E_AUTH_FAILED, "AUTH failed"))?;
        self.authed = true;
        self.client.update_info(|info| info.authed = true);
        info!(target: "rillmq::session", identity = %grant.identity, "authenticated");

        let json = serde_json::to_vec(&grant)
            .map_err(|e| ProtocolError::fatal(E_AUTH_FAILED, format!("AUTH response: {e}")))?;
        Ok(Some(Bytes::from(json)))
    }

    // ───────────────────────────────────────────────────────────
    // Consuming
    // ───────────────────────────────────────────────────────────

    async fn sub(&mut self, params: &[String]) -> CommandResult {
        if self.state != State::Init {
            return Err(ProtocolError::invalid("cannot SUB in current state").into());
        }
        let [topic_name, channel_name, ..] = params else {
            return Err(ProtocolError::invalid("SUB insufficient number of parameters").into());
        };
        if !names::is_valid_name(topic_name) {
            return Err(ProtocolError::fatal(
                E_BAD_TOPIC,
                format!("SUB topic name {topic_name} is not valid"),
            )
            .into());
        }
        if !names::is_valid_name(channel_name) {
            return Err(ProtocolError::fatal(
                E_BAD_CHANNEL,
                format!("SUB channel name {channel_name} is not valid"),
            )
            .into());
        }
        self.check_auth(Verb::Sub)?;

        // An ephemeral channel whose last client just left may be mid-deletion.
        let mut attempt = 0;
        let channel = loop {
            let topic = self
                .ctx
                .registry
                .create_or_get_topic(topic_name)
                .map_err(|e| ProtocolError::fatal(E_BAD_TOPIC, format!("SUB failed {e}")))?;
            let channel = topic
                .get_channel(channel_name)
                .map_err(|e| ProtocolError::fatal(E_BAD_CHANNEL, format!("SUB failed {e}")))?;
            match channel.add_client(Arc::clone(&self.client)) {
                Ok(()) => break channel,
                Err(BrokerError::Exiting) if attempt < SUB_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(SUB_RETRY_DELAY).await;
                }
                Err(BrokerError::TooManyConsumers(max)) => {
                    return Err(ProtocolError::fatal(
                        E_TOO_MANY_CHANNEL_CONSUMERS,
                        format!("channel consumers for {topic_name}:{channel_name} exceeds limit of {max}"),
                    )
                    .into());
                }
                Err(err) => {
                    return Err(ProtocolError::invalid(format!("SUB failed {err}")).into());
                }
            }
        };

        info!(
            target: "rillmq::session",
            topic = %topic_name,
            channel = %channel_name,
            "subscribed"
        );
        self.channel = Some(channel);
        self.state = State::Subscribed;
        ok()
    }

    fn rdy(&mut self, params: &[String]) -> CommandResult {
        if self.state == State::Closing {
            debug!(target: "rillmq::session", "ignoring RDY after CLS");
            return Ok(None);
        }
        if self.state != State::Subscribed {
            return Err(ProtocolError::invalid("cannot RDY in current state").into());
        }
        let count = match params.first() {
            None => 1,
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| ProtocolError::invalid(format!("RDY could not parse count {raw}")))?,
        };
        let max = self.ctx.options.max_rdy_count as i64;
        if !(0..=max).contains(&count) {
            return Err(ProtocolError::soft(
                E_INVALID,
                format!("RDY count {count} out of range 0-{max}"),
            )
            .into());
        }
        self.client.set_ready(count);
        Ok(None)
    }

    fn subscribed_channel(&self, verb: Verb) -> Result<Arc<Channel>, ProtocolError> {
        match (&self.channel, self.state) {
            (Some(channel), State::Subscribed | State::Closing) => Ok(Arc::clone(channel)),
            _ => Err(ProtocolError::invalid(format!(
                "cannot {} in current state",
                verb.as_str()
            ))),
        }
    }

    fn fin(&mut self, params: &[String]) -> CommandResult {
        let channel = self.subscribed_channel(Verb::Fin)?;
        let id = parse_id(Verb::Fin, params)?;
        channel
            .finish(self.id, id)
            .map_err(|e| tracking_error(E_FIN_FAILED, Verb::Fin, id, e))?;
        Ok(None)
    }

    fn req(&mut self, params: &[String]) -> CommandResult {
        let channel = self.subscribed_channel(Verb::Req)?;
        let id = parse_id(Verb::Req, params)?;
        let raw = params
            .get(1)
            .ok_or_else(|| ProtocolError::invalid("REQ insufficient number of params"))?;
        let requested = raw
            .parse::<i64>()
            .map_err(|_| ProtocolError::invalid(format!("REQ could not parse timeout {raw}")))?;
        let max = self.ctx.options.max_req_timeout_ms as i64;
        let clamped = requested.clamp(0, max);
        if clamped != requested {
            debug!(
                target: "rillmq::session",
                requested,
                clamped,
                "REQ timeout out of range, clamped"
            );
        }
        channel
            .requeue(self.id, id, Duration::from_millis(clamped as u64))
            .map_err(|e| tracking_error(E_REQ_FAILED, Verb::Req, id, e))?;
        Ok(None)
    }

    fn touch(&mut self, params: &[String]) -> CommandResult {
        let channel = self.subscribed_channel(Verb::Touch)?;
        let id = parse_id(Verb::Touch, params)?;
        channel
            .touch(self.id, id)
            .map_err(|e| tracking_error(E_TOUCH_FAILED, Verb::Touch, id, e))?;
        Ok(None)
    }

    fn cls(&mut self) -> CommandResult {
        if self.state != State::Subscribed {
            return Err(ProtocolError::invalid("cannot CLS in current state").into());
        }
        self.client.set_ready(0);
        self.state = State::Closing;
        Ok(Some(Bytes::from_static(CLOSE_WAIT)))
    }

    async fn deliver(&mut self, message: Arc<Message>) -> io::Result<()> {
        let Some(channel) = self.channel.clone() else {
            return Ok(());
        };
        if self.state != State::Subscribed || !self.client.is_ready_for_messages() {
            if let Err(err) = channel.return_undelivered(message) {
                warn!(target: "rillmq::session", error = %err, "failed to return undelivered message");
            }
            return Ok(());
        }

        let rate = u32::from(self.settings.sample_rate);
        let sampled_out = rate > 0 && rand::thread_rng().gen_range(1..=100u32) > rate;
        if sampled_out {
            trace!(target: "rillmq::session", message_id = %message.id(), "sampled out");
            return Ok(());
        }

        let delivered = match channel.dispatch(message, &self.client, self.client.msg_timeout()) {
            Ok(delivered) => delivered,
            Err(err) => {
                warn!(target: "rillmq::session", error = %err, "could not start in-flight");
                return Ok(());
            }
        };
        encode_message_frame(&delivered, &mut self.out);

        let size = self.settings.output_buffer_size;
        let flush_now = size == 0
            || self.out.len() >= size
            || self.settings.output_buffer_timeout.is_none()
            || !self.client.is_ready_for_messages();
        if flush_now {
            self.flush().await?;
        } else if self.flush_at.is_none() {
            self.flush_at = self
                .settings
                .output_buffer_timeout
                .map(|timeout| Instant::now() + timeout);
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────
    // Publishing
    // ───────────────────────────────────────────────────────────

    fn begin_publish(&self, verb: Verb, params: &[String]) -> Result<String, ProtocolError> {
        if matches!(self.state, State::Subscribed | State::Closing) {
            return Err(ProtocolError::invalid(format!(
                "cannot {} in current state",
                verb.as_str()
            )));
        }
        let topic = params.first().ok_or_else(|| {
            ProtocolError::invalid(format!("{} insufficient number of parameters", verb.as_str()))
        })?;
        if !names::is_valid_name(topic) {
            return Err(ProtocolError::fatal(
                E_BAD_TOPIC,
                format!("{} topic name {topic} is not valid", verb.as_str()),
            ));
        }
        self.check_auth(verb)?;
        Ok(topic.clone())
    }

    fn publish_to(
        &mut self,
        topic_name: &str,
        messages: Vec<Message>,
        code: &'static str,
        verb: Verb,
    ) -> CommandResult {
        let topic = self
            .ctx
            .registry
            .create_or_get_topic(topic_name)
            .map_err(|e| publish_error(code, verb, e))?;
        topic
            .publish_multiple(messages)
            .map_err(|e| publish_error(code, verb, e))?;
        self.state = State::Publishing;
        ok()
    }

    fn new_message(&self, body: Bytes) -> Message {
        Message::new(self.ctx.registry.context().guid.next_id(), body)
    }

    fn publish(&mut self, params: &[String], body: Option<Bytes>) -> CommandResult {
        let topic = self.begin_publish(Verb::Pub, params)?;
        let body = require_body(Verb::Pub, body)?;
        if body.is_empty() {
            return Err(ProtocolError::fatal(E_BAD_MESSAGE, "PUB invalid message body size 0").into());
        }
        let message = self.new_message(body);
        self.publish_to(&topic, vec![message], E_PUB_FAILED, Verb::Pub)
    }

    fn mpublish(&mut self, params: &[String], body: Option<Bytes>) -> CommandResult {
        let topic = self.begin_publish(Verb::Mpub, params)?;
        let body = require_body(Verb::Mpub, body)?;
        let bodies = parse_mpub(body, self.ctx.options.max_msg_size)?;
        let messages = bodies.into_iter().map(|b| self.new_message(b)).collect();
        self.publish_to(&topic, messages, E_MPUB_FAILED, Verb::Mpub)
    }

    fn dpublish(&mut self, params: &[String], body: Option<Bytes>) -> CommandResult {
        let topic = self.begin_publish(Verb::Dpub, params)?;
        let raw = params
            .get(1)
            .ok_or_else(|| ProtocolError::invalid("DPUB insufficient number of parameters"))?;
        let defer_ms = raw
            .parse::<i64>()
            .map_err(|_| ProtocolError::invalid(format!("DPUB could not parse timeout {raw}")))?;
        let max = self.ctx.options.max_req_timeout_ms as i64;
        if !(0..=max).contains(&defer_ms) {
            return Err(ProtocolError::invalid(format!(
                "DPUB timeout {defer_ms} out of range 0-{max}"
            ))
            .into());
        }
        let body = require_body(Verb::Dpub, body)?;
        if body.is_empty() {
            return Err(ProtocolError::fatal(E_BAD_MESSAGE, "DPUB invalid message body size 0").into());
        }
        let message = self
            .new_message(body)
            .with_deferred(Duration::from_millis(defer_ms as u64));
        self.publish_to(&topic, vec![message], E_DPUB_FAILED, Verb::Dpub)
    }

    // ───────────────────────────────────────────────────────────
    // Output
    // ───────────────────────────────────────────────────────────

    async fn flush(&mut self) -> io::Result<()> {
        self.flush_at = None;
        if self.out.is_empty() {
            return Ok(());
        }
        let data = self.out.split();
        self.transport.write_all(&data).await
    }

    async fn send_frame(&mut self, frame_type: FrameType, data: &[u8]) -> io::Result<()> {
        encode_frame(frame_type, data, &mut self.out);
        self.flush().await
    }

    async fn send_error(&mut self, err: &ProtocolError) -> io::Result<Flow> {
        if err.fatal {
            warn!(target: "rillmq::session", code = err.code, error = %err.message, "closing on protocol error");
        } else {
            debug!(target: "rillmq::session", code = err.code, error = %err.message, "protocol error");
        }
        self.send_frame(FrameType::Error, err.wire_text().as_bytes())
            .await?;
        Ok(if err.fatal { Flow::Close } else { Flow::Continue })
    }
}

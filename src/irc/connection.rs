//! A single IRC transport connection.
//!
//! Wraps the wire protocol library (irc-proto) the way the rest of the
//! bridge wants to consume it: typed [`IrcEvent`]s out, paced lines in,
//! with registration, ping keepalive and error classification handled
//! here. One connection maps to one [`super::session::BridgedClient`]
//! while that session is in its Connected state.
//!
//! ```text
//! ConnectionInstance::create (retry loop, optionally via scheduler)
//!    ↓ dial → TLS? → register (PASS/SASL/NICK/USER … RPL_WELCOME)
//!    ↓ split
//! ┌──────────────┐      ┌───────────────┐
//! │  read loop   │      │  write loop   │
//! │  (translate, │      │  (flood-paced │
//! │   waiters,   │      │   sends)      │
//! │   watchdog)  │      │               │
//! └──────┬───────┘      └───────▲───────┘
//!        ▼ SessionEvent stream  │ ConnectionHandle::send
//! ```

use crate::error::ConnectError;
use crate::irc::events::{IrcEvent, SessionEvent};
use crate::irc::ident_listener;
use crate::irc::isupport::Isupport;
use crate::irc::scheduler;
use crate::irc::server::IrcServer;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use irc_proto::{CapSubCommand, ChannelMode, Command, IrcCodec, Message, Mode, Response};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

/// The time we're willing to wait for registration when connecting.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// The delay between messages when there are >1 messages to send.
const FLOOD_PROTECTION_DELAY: Duration = Duration::from_millis(700);
/// Extra backoff after the network told us we're reconnecting too fast.
const THROTTLE_WAIT: Duration = Duration::from_secs(20);
const BASE_RETRY_TIME: Duration = Duration::from_secs(1);
/// Registration nick-collision retries before giving up.
const MAX_NICK_RETRIES: usize = 5;

/// ERROR-line fragments that mean the host hit a connection-class limit.
const CONN_LIMIT_MESSAGES: &[&str] = &[
    "too many host connections", // ircd-seven
    "no more connections allowed in your connection class",
    "this server is full", // unrealircd
];

// Numeric replies handled here, by code so no name spelling is load-bearing.
const ERR_ERRONEOUSNICKNAME: u16 = 432;
const ERR_NICKNAMEINUSE: u16 = 433;
const ERR_NICKCOLLISION: u16 = 436;
const ERR_UNAVAILRESOURCE: u16 = 437;
const ERR_PASSWDMISMATCH: u16 = 464;
const ERR_YOUREBANNEDCREEP: u16 = 465;
const RPL_WELCOME: u16 = 1;
const RPL_ISUPPORT: u16 = 5;
const RPL_CHANNELMODEIS: u16 = 324;
const RPL_NAMREPLY: u16 = 353;
const RPL_ENDOFNAMES: u16 = 366;
const RPL_LOGGEDIN: u16 = 900;
const RPL_SASLSUCCESS: u16 = 903;
const ERR_SASLFAIL: u16 = 904;
const ERR_SASLTOOLONG: u16 = 905;
const ERR_SASLABORTED: u16 = 906;

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The network told us to slow down.
    Throttled,
    /// A fatal protocol-level error.
    IrcError,
    /// TCP-level failure (reset, refused, EOF).
    NetError,
    /// Registration never completed in time.
    Timeout,
    /// An ERROR line we could not classify.
    RawError,
    /// Connection-class limit (I-line).
    TooManyConns,
    /// K-lined/X-lined. Intentional; do not reconnect.
    Banned,
    /// Administrative kill of the session.
    Killed,
    /// Idle timeout cycling.
    Idle,
    /// Cycled out by the client limit.
    LimitReached,
    /// The server went quiet past the ping deadline.
    PingTimeout,
    /// Deliberate disconnect so that a fresh session can take over.
    WantsReconnect,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Throttled => "throttled",
            Self::IrcError => "irc_error",
            Self::NetError => "net_error",
            Self::Timeout => "timeout",
            Self::RawError => "raw_error",
            Self::TooManyConns => "toomanyconns",
            Self::Banned => "banned",
            Self::Killed => "killed",
            Self::Idle => "idle",
            Self::LimitReached => "limit_reached",
            Self::PingTimeout => "ping_timeout",
            Self::WantsReconnect => "iwanttoreconnect",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity parameters for one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOpts {
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub password: Option<String>,
    /// Local IPv6 source address to bind, when the network allocates
    /// per-user blocks.
    pub local_address: Option<Ipv6Addr>,
    /// `None` retries forever (the bot structurally must connect).
    pub max_attempts: Option<u32>,
}

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}
type IrcStream = Box<dyn AsyncStream>;
type IrcFramed = Framed<IrcStream, IrcCodec>;

enum Outbound {
    Line(Message),
    /// Sent, flushed, then the socket is dropped.
    Final(Message),
}

struct ConnShared {
    domain: String,
    homeserver_domain: String,
    ping_rate: Duration,
    ping_timeout: Duration,
    out_tx: mpsc::UnboundedSender<Outbound>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    dead: AtomicBool,
    shutdown: Notify,
    nick: RwLock<String>,
    username: String,
    local_port: Option<u16>,
    isupport: RwLock<Isupport>,
    /// Folded channel name -> folded nicks seen in it, fed by JOIN/NAMES.
    /// Gives QUIT and NICK events their channel fan-out.
    members: Mutex<HashMap<String, HashSet<String>>>,
    /// NAMES aggregation in progress, per folded channel.
    pending_names: Mutex<HashMap<String, HashMap<String, String>>>,
    waiters: Mutex<Vec<Box<dyn FnMut(&Message) -> bool + Send>>>,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
    last_outbound: Mutex<Instant>,
    last_inbound: Mutex<Instant>,
}

/// Cheap, clonable handle onto a live connection. Held inside the
/// session's `Connected` state.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnShared>,
}

/// Connection factory. See [`ConnectionInstance::create`].
pub struct ConnectionInstance;

impl ConnectionInstance {
    /// Establish a connection, retrying with staggered backoff until it
    /// succeeds, the attempt budget runs out, or the network rejects us
    /// in a way that makes retrying pointless (ban, I-line).
    ///
    /// When the server configures a reconnect interval, each attempt is
    /// paced through the per-domain scheduler queue so mass reconnects
    /// don't stampede the IRCd.
    pub async fn create(
        server: &Arc<IrcServer>,
        opts: ConnectOpts,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<ConnectionHandle, ConnectError> {
        let mut attempts: u32 = 0;
        let mut extra_delay = Duration::ZERO;
        loop {
            let result = match server.reconnect_interval() {
                Some(interval) => {
                    let domain = server.domain().to_string();
                    let nick = opts.nick.clone();
                    let task_server = server.clone();
                    let task_opts = opts.clone();
                    let task_events = events_tx.clone();
                    scheduler::reschedule(&domain, &nick, interval, extra_delay, move || {
                        Self::attempt(task_server, task_opts, task_events)
                    })
                    .await?
                }
                None => Self::attempt(server.clone(), opts.clone(), events_tx.clone()).await,
            };

            let err = match result {
                Ok(handle) => return Ok(handle),
                Err(err) => err,
            };

            attempts += 1;
            error!(
                domain = %server.domain(),
                nick = %opts.nick,
                attempts,
                error = %err,
                "Connection attempt failed"
            );

            match &err {
                ConnectError::Banned | ConnectError::TooManyConnections => return Err(err),
                ConnectError::Throttled => extra_delay += THROTTLE_WAIT,
                _ => {}
            }
            if let Some(max) = opts.max_attempts
                && attempts >= max
            {
                return Err(err);
            }

            // staggered delay to avoid thundering-herd on mass disconnects
            let jitter = {
                let mut rng = rand::thread_rng();
                BASE_RETRY_TIME.mul_f64(rng.r#gen::<f64>())
                    + Duration::from_millis(rng.gen_range(0..=attempts as u64 * 1000))
            };
            let delay = jitter + extra_delay;
            info!(
                domain = %server.domain(),
                nick = %opts.nick,
                delay_ms = delay.as_millis() as u64,
                "Retrying connection"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One dial + registration attempt.
    async fn attempt(
        server: Arc<IrcServer>,
        opts: ConnectOpts,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<ConnectionHandle, ConnectError> {
        let _ident_guard = ident_listener::connect_begin();
        let (stream, local_port) = dial(&server, opts.local_address).await?;
        let codec = IrcCodec::new("utf-8").map_err(|e| ConnectError::Net(e.to_string()))?;
        let mut framed: IrcFramed = Framed::new(stream, codec);

        let registered = tokio::time::timeout(
            CONNECT_TIMEOUT,
            register(&mut framed, &server, &opts),
        )
        .await
        .map_err(|_| ConnectError::Timeout)??;

        if let Some(port) = local_port {
            ident_listener::set_mapping(&opts.username, port);
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ConnShared {
            domain: server.domain().to_string(),
            homeserver_domain: server.homeserver_domain().to_string(),
            ping_rate: server.ping_rate(),
            ping_timeout: server.ping_timeout(),
            out_tx,
            events_tx,
            dead: AtomicBool::new(false),
            shutdown: Notify::new(),
            nick: RwLock::new(registered.nick),
            username: opts.username.clone(),
            local_port,
            isupport: RwLock::new(registered.isupport),
            members: Mutex::new(HashMap::new()),
            pending_names: Mutex::new(HashMap::new()),
            waiters: Mutex::new(Vec::new()),
            disconnect_reason: Mutex::new(None),
            last_outbound: Mutex::new(Instant::now()),
            last_inbound: Mutex::new(Instant::now()),
        });

        let (sink, stream) = framed.split();
        tokio::spawn(write_loop(sink, out_rx, shared.clone()));
        tokio::spawn(read_loop(stream, shared.clone()));

        Ok(ConnectionHandle { shared })
    }
}

/// What registration produced.
struct Registered {
    nick: String,
    isupport: Isupport,
}

/// Resolve, bind and connect the TCP (and optionally TLS) stream.
async fn dial(
    server: &Arc<IrcServer>,
    local_address: Option<Ipv6Addr>,
) -> Result<(IrcStream, Option<u16>), ConnectError> {
    let (host, port) = server.random_address();
    let want_v6 = local_address.is_some() || server.ipv6_only();

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| ConnectError::Net(format!("lookup {host}: {e}")))?
        .collect();
    let addr = addrs
        .iter()
        .find(|a| !want_v6 || a.is_ipv6())
        .or(addrs.first())
        .copied()
        .ok_or_else(|| ConnectError::Net(format!("no addresses for {host}")))?;

    let tcp = match local_address {
        Some(ip) => {
            let socket = TcpSocket::new_v6().map_err(|e| ConnectError::Net(e.to_string()))?;
            socket
                .bind(SocketAddr::new(IpAddr::V6(ip), 0))
                .map_err(|e| ConnectError::Net(format!("bind {ip}: {e}")))?;
            socket
                .connect(addr)
                .await
                .map_err(|e| ConnectError::Net(e.to_string()))?
        }
        None => TcpStream::connect(addr)
            .await
            .map_err(|e| ConnectError::Net(e.to_string()))?,
    };
    let local_port = tcp.local_addr().ok().map(|a| a.port());

    if !server.use_tls() {
        return Ok((Box::new(tcp) as IrcStream, local_port));
    }

    let tls_config = tls_config(server)?;
    let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(host.clone())
        .map_err(|e| ConnectError::Net(format!("invalid TLS name {host}: {e}")))?;
    let connector = TlsConnector::from(Arc::new(tls_config));
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ConnectError::Net(format!("tls: {e}")))?;
    Ok((Box::new(tls) as IrcStream, local_port))
}

fn tls_config(server: &IrcServer) -> Result<tokio_rustls::rustls::ClientConfig, ConnectError> {
    let mut roots = tokio_rustls::rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        let _ = roots.add(cert);
    }
    if let Some(path) = server.tls_ca_file() {
        let pem = std::fs::read(path)
            .map_err(|e| ConnectError::Net(format!("read CA bundle {path}: {e}")))?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| ConnectError::Net(format!("parse CA bundle: {e}")))?;
            let _ = roots.add(cert);
        }
    }
    Ok(tokio_rustls::rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Drive NICK/USER (and PASS or SASL PLAIN) until the server welcomes us.
/// Adopts whatever nick the network actually assigned as source of truth.
async fn register(
    framed: &mut IrcFramed,
    server: &Arc<IrcServer>,
    opts: &ConnectOpts,
) -> Result<Registered, ConnectError> {
    let use_sasl = server.use_sasl() && opts.password.is_some();
    let mut nick = opts.nick.clone();
    let mut nick_retries = 0usize;
    let mut isupport = Isupport::default();

    if use_sasl {
        send(framed, Command::CAP(None, CapSubCommand::REQ, None, Some("sasl".into()))).await?;
    } else if let Some(password) = &opts.password {
        send(framed, Command::PASS(password.clone())).await?;
    }
    send(framed, Command::NICK(nick.clone())).await?;
    send(
        framed,
        Command::USER(opts.username.clone(), "0".into(), opts.realname.clone()),
    )
    .await?;

    loop {
        let msg = match framed.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Err(ConnectError::Net(e.to_string())),
            None => return Err(ConnectError::Net("connection closed during registration".into())),
        };

        match &msg.command {
            Command::PING(s1, s2) => {
                send(framed, Command::PONG(s1.clone(), s2.clone())).await?;
            }
            Command::CAP(_, CapSubCommand::ACK, param, suffix) => {
                let acked = param.as_deref().or(suffix.as_deref()).unwrap_or("");
                if acked.contains("sasl") {
                    send(framed, Command::AUTHENTICATE("PLAIN".into())).await?;
                }
            }
            Command::CAP(_, CapSubCommand::NAK, _, _) => {
                return Err(ConnectError::Registration("server refused SASL".into()));
            }
            Command::AUTHENTICATE(chunk) if chunk == "+" => {
                let password = opts.password.clone().unwrap_or_default();
                let payload = format!("\0{}\0{}", opts.username, password);
                send(framed, Command::AUTHENTICATE(BASE64.encode(payload))).await?;
            }
            Command::ERROR(text) => {
                return Err(connect_error_from_reason(classify_error_text(text), text));
            }
            Command::Response(resp, args) => match *resp as u16 {
                RPL_WELCOME => {
                    let assigned = args.first().cloned().unwrap_or(nick);
                    return Ok(Registered {
                        nick: assigned,
                        isupport,
                    });
                }
                RPL_ISUPPORT => {
                    apply_isupport(&mut isupport, args);
                }
                RPL_LOGGEDIN => {}
                RPL_SASLSUCCESS => {
                    send(framed, Command::CAP(None, CapSubCommand::END, None, None)).await?;
                }
                ERR_SASLFAIL | ERR_SASLTOOLONG | ERR_SASLABORTED => {
                    return Err(ConnectError::Registration(format!(
                        "SASL authentication failed: {}",
                        args.last().map(String::as_str).unwrap_or("")
                    )));
                }
                ERR_ERRONEOUSNICKNAME | ERR_NICKNAMEINUSE | ERR_NICKCOLLISION
                | ERR_UNAVAILRESOURCE => {
                    nick_retries += 1;
                    if nick_retries > MAX_NICK_RETRIES {
                        return Err(ConnectError::Registration(format!(
                            "could not negotiate a nick (last tried {nick})"
                        )));
                    }
                    nick.push('_');
                    send(framed, Command::NICK(nick.clone())).await?;
                }
                ERR_PASSWDMISMATCH => {
                    return Err(ConnectError::Registration("password mismatch".into()));
                }
                ERR_YOUREBANNEDCREEP => return Err(ConnectError::Banned),
                _ => {}
            },
            _ => {}
        }
    }
}

async fn send(framed: &mut IrcFramed, command: Command) -> Result<(), ConnectError> {
    framed
        .send(Message {
            tags: None,
            prefix: None,
            command,
        })
        .await
        .map_err(|e| ConnectError::Net(e.to_string()))
}

fn connect_error_from_reason(reason: DisconnectReason, text: &str) -> ConnectError {
    match reason {
        DisconnectReason::Banned => ConnectError::Banned,
        DisconnectReason::TooManyConns => ConnectError::TooManyConnections,
        DisconnectReason::Throttled => ConnectError::Throttled,
        _ => ConnectError::Registration(text.to_string()),
    }
}

/// Classify an ERROR line into a disconnect reason.
fn classify_error_text(text: &str) -> DisconnectReason {
    // E.g. 'Closing Link: gateway/session (Bad user info)' means X:LINE
    if text.starts_with("Closing Link") && text.contains("(Bad user info)") {
        return DisconnectReason::Banned;
    }
    let lower = text.to_lowercase();
    if lower.contains("throttl") {
        return DisconnectReason::Throttled;
    }
    if lower.contains("banned") || lower.contains("k-lined") {
        return DisconnectReason::Banned;
    }
    if CONN_LIMIT_MESSAGES.iter().any(|m| lower.contains(m)) {
        return DisconnectReason::TooManyConns;
    }
    DisconnectReason::RawError
}

fn apply_isupport(isupport: &mut Isupport, args: &[String]) {
    // first arg is our nick, the trailing arg is "are supported ..."
    if args.len() > 2 {
        isupport.apply_tokens(args[1..args.len() - 1].iter().map(String::as_str));
    }
}

// ============================================================================
// I/O tasks
// ============================================================================

async fn write_loop(
    mut sink: SplitSink<IrcFramed, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<ConnShared>,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Line(msg) => {
                if sink.send(msg).await.is_err() {
                    break;
                }
                *shared.last_outbound.lock() = Instant::now();
                if !rx.is_empty() {
                    tokio::time::sleep(FLOOD_PROTECTION_DELAY).await;
                }
            }
            Outbound::Final(msg) => {
                let _ = sink.send(msg).await;
                let _ = sink.flush().await;
                break;
            }
        }
    }
}

async fn read_loop(mut stream: SplitStream<IrcFramed>, shared: Arc<ConnShared>) {
    loop {
        let timeout_at = *shared.last_inbound.lock() + shared.ping_timeout;
        let probe_at = *shared.last_outbound.lock() + shared.ping_rate;
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(msg)) => {
                    *shared.last_inbound.lock() = Instant::now();
                    shared.handle_message(msg);
                    if shared.dead.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(domain = %shared.domain, error = %e, "Read error");
                    shared.begin_disconnect(DisconnectReason::NetError, None);
                    break;
                }
                None => {
                    shared.begin_disconnect(DisconnectReason::NetError, None);
                    break;
                }
            },
            _ = shared.shutdown.notified() => break,
            _ = tokio::time::sleep_until(timeout_at) => {
                info!(
                    domain = %shared.domain,
                    nick = %shared.nick.read(),
                    "Ping timeout: knifing connection"
                );
                shared.begin_disconnect(DisconnectReason::PingTimeout, None);
                break;
            }
            _ = tokio::time::sleep_until(probe_at) => {
                // Do what XChat does. Stamp the outbound clock now so a
                // stalled writer can't make this arm spin.
                *shared.last_outbound.lock() = Instant::now();
                let ts = chrono::Utc::now().timestamp_millis();
                shared.send_line(Command::PING(format!("LAG{ts}"), None));
            }
        }
    }
    shared.finish_disconnect();
}

// ============================================================================
// Shared connection state
// ============================================================================

impl ConnShared {
    fn send_line(&self, command: Command) {
        let _ = self.out_tx.send(Outbound::Line(Message {
            tags: None,
            prefix: None,
            command,
        }));
    }

    fn begin_disconnect(&self, reason: DisconnectReason, text: Option<String>) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(domain = %self.domain, nick = %self.nick.read(), reason = %reason, "Disconnecting");
        *self.disconnect_reason.lock() = Some(reason);
        let quit = text.unwrap_or_else(|| reason.as_str().to_string());
        let _ = self.out_tx.send(Outbound::Final(Message {
            tags: None,
            prefix: None,
            command: Command::QUIT(Some(quit)),
        }));
        // notify_one leaves a permit, so the read loop sees this even if
        // it is between select iterations
        self.shutdown.notify_one();
    }

    /// Emit the terminal event exactly once and drop pending waiters so
    /// in-flight operations resolve with a disconnect error.
    fn finish_disconnect(&self) {
        self.dead.store(true, Ordering::SeqCst);
        let reason = (*self.disconnect_reason.lock()).unwrap_or(DisconnectReason::NetError);
        self.waiters.lock().clear();
        if let Some(port) = self.local_port {
            ident_listener::remove_mapping(port);
        }
        let _ = self
            .events_tx
            .send(SessionEvent::internal(IrcEvent::Disconnected { reason }));
    }

    fn handle_message(&self, msg: Message) {
        // keepalive and CTCP VERSION are wire chatter, not events
        if let Command::PING(s1, s2) = &msg.command {
            self.send_line(Command::PONG(s1.clone(), s2.clone()));
            return;
        }
        if let Command::PRIVMSG(target, text) = &msg.command
            && *target == *self.nick.read()
            && text.trim_end_matches('\u{1}') == "\u{1}VERSION"
        {
            if let Some(from) = msg.source_nickname() {
                self.send_line(Command::NOTICE(
                    from.to_string(),
                    format!("\u{1}VERSION mxircd bridged via {}\u{1}", self.homeserver_domain),
                ));
            }
            return;
        }

        // pending operations get first look at the raw message
        {
            let mut waiters = self.waiters.lock();
            waiters.retain_mut(|waiter| !waiter(&msg));
        }

        for event in self.translate(&msg) {
            if self.events_tx.send(event).is_err() {
                return;
            }
        }
    }

    /// Translate a wire message into session events, updating the
    /// connection-local channel/member bookkeeping as a side effect.
    fn translate(&self, msg: &Message) -> Vec<SessionEvent> {
        let claim = claim_line(msg);
        let from = msg.source_nickname().unwrap_or("").to_string();
        let self_nick = self.nick.read().clone();

        match &msg.command {
            Command::PRIVMSG(target, text) => {
                if let Some(action) = text
                    .strip_prefix("\u{1}ACTION ")
                    .map(|t| t.trim_end_matches('\u{1}'))
                {
                    vec![SessionEvent {
                        line: claim,
                        event: IrcEvent::Action {
                            from,
                            to: target.clone(),
                            text: action.to_string(),
                        },
                    }]
                } else if text.starts_with('\u{1}') {
                    Vec::new() // other CTCP queries are not bridged
                } else {
                    vec![SessionEvent {
                        line: claim,
                        event: IrcEvent::Message {
                            from,
                            to: target.clone(),
                            text: text.clone(),
                        },
                    }]
                }
            }
            Command::NOTICE(target, text) => {
                if from.is_empty() {
                    return Vec::new(); // server notices are not bridged
                }
                vec![SessionEvent {
                    line: claim,
                    event: IrcEvent::Notice {
                        from,
                        to: target.clone(),
                        text: text.clone(),
                    },
                }]
            }
            Command::JOIN(chanlist, _, _) => chanlist
                .split(',')
                .filter(|c| !c.is_empty())
                .map(|channel| {
                    self.member_join(channel, &from);
                    SessionEvent {
                        line: claim.clone(),
                        event: IrcEvent::Join {
                            channel: channel.to_string(),
                            nick: from.clone(),
                        },
                    }
                })
                .collect(),
            Command::PART(chanlist, reason) => chanlist
                .split(',')
                .filter(|c| !c.is_empty())
                .map(|channel| {
                    self.member_part(channel, &from, &self_nick);
                    SessionEvent {
                        line: claim.clone(),
                        event: IrcEvent::Part {
                            channel: channel.to_string(),
                            nick: from.clone(),
                            reason: reason.clone(),
                        },
                    }
                })
                .collect(),
            Command::KICK(channel, users, reason) => users
                .split(',')
                .filter(|u| !u.is_empty())
                .map(|kicked| {
                    self.member_part(channel, kicked, &self_nick);
                    SessionEvent {
                        line: claim.clone(),
                        event: IrcEvent::Kick {
                            channel: channel.clone(),
                            nick: kicked.to_string(),
                            by: from.clone(),
                            reason: reason.clone(),
                        },
                    }
                })
                .collect(),
            Command::QUIT(reason) => {
                let channels = self.member_quit(&from);
                vec![SessionEvent {
                    line: claim,
                    event: IrcEvent::Quit {
                        nick: from,
                        reason: reason.clone(),
                        channels,
                    },
                }]
            }
            Command::NICK(new_nick) => {
                if from == self_nick {
                    *self.nick.write() = new_nick.clone();
                }
                let channels = self.member_rename(&from, new_nick);
                vec![SessionEvent {
                    line: claim,
                    event: IrcEvent::NickChange {
                        old: from,
                        new: new_nick.clone(),
                        channels,
                    },
                }]
            }
            Command::TOPIC(channel, topic) => vec![SessionEvent {
                line: claim,
                event: IrcEvent::Topic {
                    channel: channel.clone(),
                    topic: topic.clone().unwrap_or_default(),
                    by: from,
                },
            }],
            Command::INVITE(_, channel) => vec![SessionEvent::internal(IrcEvent::Invite {
                channel: channel.clone(),
                from,
            })],
            Command::ChannelMODE(target, modes) => modes
                .iter()
                .filter_map(|mode| {
                    let (enabled, channel_mode, arg) = match mode {
                        Mode::Plus(m, a) => (true, m, a.clone()),
                        Mode::Minus(m, a) => (false, m, a.clone()),
                        _ => return None,
                    };
                    Some(SessionEvent {
                        line: claim.clone(),
                        event: IrcEvent::Mode {
                            target: target.clone(),
                            by: from.clone(),
                            mode: channel_mode_char(channel_mode),
                            enabled,
                            arg,
                        },
                    })
                })
                .collect(),
            Command::ERROR(text) => {
                self.begin_disconnect(classify_error_text(text), None);
                Vec::new()
            }
            Command::Response(resp, args) => self.translate_response(*resp, args),
            _ => Vec::new(),
        }
    }

    fn translate_response(&self, resp: Response, args: &[String]) -> Vec<SessionEvent> {
        match resp as u16 {
            RPL_ISUPPORT => {
                let mut isupport = self.isupport.write();
                apply_isupport(&mut isupport, args);
                Vec::new()
            }
            RPL_NAMREPLY => {
                // [me, symbol, channel, "nick1 @nick2 ..."]
                if args.len() < 4 {
                    return Vec::new();
                }
                let channel = &args[2];
                let folded = self.case_fold(channel);
                let isupport = self.isupport.read();
                let mut pending = self.pending_names.lock();
                let entry = pending.entry(folded.clone()).or_default();
                let mut members = self.members.lock();
                let chan_members = members.entry(folded).or_default();
                for name in args[3].split_whitespace() {
                    let (prefixes, nick) = isupport.split_name(name);
                    chan_members.insert(isupport.to_lower(&nick));
                    entry.insert(nick, prefixes);
                }
                Vec::new()
            }
            RPL_ENDOFNAMES => {
                // [me, channel, "End of /NAMES list"]
                let Some(channel) = args.get(1) else {
                    return Vec::new();
                };
                let folded = self.case_fold(channel);
                let names = self.pending_names.lock().remove(&folded).unwrap_or_default();
                // NAMES claims hash only the channel: every session would
                // otherwise re-process whole directory syncs.
                vec![SessionEvent {
                    line: Some(format!("server_sent names {folded}")),
                    event: IrcEvent::Names {
                        channel: channel.clone(),
                        names,
                    },
                }]
            }
            RPL_CHANNELMODEIS => {
                // [me, channel, modestring, args...]
                if args.len() < 3 {
                    return Vec::new();
                }
                vec![SessionEvent::internal(IrcEvent::ModeIs {
                    target: args[1].clone(),
                    modes: args[2..].join(" "),
                })]
            }
            ERR_YOUREBANNEDCREEP => {
                self.begin_disconnect(DisconnectReason::Banned, None);
                Vec::new()
            }
            // Error numerics are surfaced, never fatal: the recognized
            // rejections (bad nick, banned channel, ...) belong to whatever
            // operation is pending, and disconnecting on them would turn a
            // rejected join into a dropped client.
            code if (400..600).contains(&code) => {
                vec![SessionEvent::internal(IrcEvent::ServerError {
                    code: format!("{resp:?}").to_lowercase(),
                    args: args.to_vec(),
                })]
            }
            _ => Vec::new(),
        }
    }

    fn case_fold(&self, s: &str) -> String {
        self.isupport.read().to_lower(s)
    }

    fn member_join(&self, channel: &str, nick: &str) {
        let folded_chan = self.case_fold(channel);
        let folded_nick = self.case_fold(nick);
        self.members
            .lock()
            .entry(folded_chan)
            .or_default()
            .insert(folded_nick);
    }

    fn member_part(&self, channel: &str, nick: &str, self_nick: &str) {
        let folded_chan = self.case_fold(channel);
        let folded_nick = self.case_fold(nick);
        let mut members = self.members.lock();
        if nick.eq_ignore_ascii_case(self_nick) {
            members.remove(&folded_chan);
        } else if let Some(chan) = members.get_mut(&folded_chan) {
            chan.remove(&folded_nick);
        }
    }

    /// Remove a quitting nick everywhere, returning the channels this
    /// connection saw them in.
    fn member_quit(&self, nick: &str) -> Vec<String> {
        let folded_nick = self.case_fold(nick);
        let mut members = self.members.lock();
        let mut channels = Vec::new();
        for (channel, nicks) in members.iter_mut() {
            if nicks.remove(&folded_nick) {
                channels.push(channel.clone());
            }
        }
        channels
    }

    fn member_rename(&self, old: &str, new: &str) -> Vec<String> {
        let folded_old = self.case_fold(old);
        let folded_new = self.case_fold(new);
        let mut members = self.members.lock();
        let mut channels = Vec::new();
        for (channel, nicks) in members.iter_mut() {
            if nicks.remove(&folded_old) {
                nicks.insert(folded_new.clone());
                channels.push(channel.clone());
            }
        }
        channels
    }
}

/// The hash input for the dedup claim table: the server line as received.
/// Sessions sharing a server receive byte-identical lines, so this is
/// stable across streams in a way locally-derived state is not. Events
/// with `None` here bypass claiming entirely (PMs, queries, lifecycle).
fn claim_line(msg: &Message) -> Option<String> {
    match &msg.command {
        Command::PRIVMSG(target, _)
        | Command::NOTICE(target, _)
        | Command::TOPIC(target, _)
        | Command::ChannelMODE(target, _)
            if !target.starts_with('#') =>
        {
            None
        }
        Command::PRIVMSG(..)
        | Command::NOTICE(..)
        | Command::TOPIC(..)
        | Command::ChannelMODE(..)
        | Command::JOIN(..)
        | Command::PART(..)
        | Command::KICK(..)
        | Command::QUIT(..)
        | Command::NICK(..) => Some(msg.to_string()),
        _ => None,
    }
}

fn channel_mode_char(mode: &ChannelMode) -> char {
    match mode {
        ChannelMode::Ban => 'b',
        ChannelMode::Exception => 'e',
        ChannelMode::Limit => 'l',
        ChannelMode::InviteOnly => 'i',
        ChannelMode::InviteException => 'I',
        ChannelMode::Key => 'k',
        ChannelMode::Moderated => 'm',
        ChannelMode::RegisteredOnly => 'r',
        ChannelMode::Secret => 's',
        ChannelMode::ProtectedTopic => 't',
        ChannelMode::NoExternalMessages => 'n',
        ChannelMode::Founder => 'q',
        ChannelMode::Admin => 'a',
        ChannelMode::Oper => 'o',
        ChannelMode::Halfop => 'h',
        ChannelMode::Voice => 'v',
        ChannelMode::Unknown(c) => *c,
        _ => '?',
    }
}

// ============================================================================
// Handle
// ============================================================================

impl ConnectionHandle {
    /// The nick the network currently knows us by.
    pub fn nick(&self) -> String {
        self.shared.nick.read().clone()
    }

    pub fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::SeqCst)
    }

    pub fn domain(&self) -> &str {
        &self.shared.domain
    }

    pub fn username(&self) -> &str {
        &self.shared.username
    }

    pub fn local_port(&self) -> Option<u16> {
        self.shared.local_port
    }

    /// Whether the wire-level channel state says we are in `channel`.
    /// Join retries consult this: the ack may have been lost while the
    /// join itself succeeded.
    pub fn in_channel(&self, channel: &str) -> bool {
        let folded = self.shared.case_fold(channel);
        self.shared.members.lock().contains_key(&folded)
    }

    pub fn case_fold(&self, s: &str) -> String {
        self.shared.case_fold(s)
    }

    pub fn with_isupport<R>(&self, f: impl FnOnce(&Isupport) -> R) -> R {
        f(&self.shared.isupport.read())
    }

    pub fn max_nick_len(&self) -> Option<usize> {
        self.shared.isupport.read().nicklen()
    }

    /// Queue a line for the paced writer.
    pub fn send(&self, command: Command) -> bool {
        if self.is_dead() {
            return false;
        }
        self.shared.send_line(command);
        true
    }

    pub fn say(&self, target: &str, text: &str) {
        for chunk in self.split_text(target, text) {
            self.send(Command::PRIVMSG(target.to_string(), chunk));
        }
    }

    pub fn notice(&self, target: &str, text: &str) {
        for chunk in self.split_text(target, text) {
            self.send(Command::NOTICE(target.to_string(), chunk));
        }
    }

    pub fn action(&self, target: &str, text: &str) {
        for chunk in self.split_text(target, text) {
            self.send(Command::PRIVMSG(
                target.to_string(),
                format!("\u{1}ACTION {chunk}\u{1}"),
            ));
        }
    }

    /// Split `text` into chunks that fit a 512-byte line with our own
    /// prefix and the target accounted for. Newlines always split.
    pub fn split_text(&self, target: &str, text: &str) -> Vec<String> {
        // ":nick!user@host PRIVMSG target :text\r\n", hostmask up to 63
        let overhead = self.nick().len() + self.username().len() + 63 + target.len() + 16;
        let budget = 512usize.saturating_sub(overhead).max(32);
        let mut chunks = Vec::new();
        for line in text.split(['\n', '\r']).filter(|l| !l.is_empty()) {
            let mut current = String::new();
            for c in line.chars() {
                if current.len() + c.len_utf8() > budget {
                    chunks.push(std::mem::take(&mut current));
                }
                current.push(c);
            }
            if !current.is_empty() {
                chunks.push(current);
            }
        }
        chunks
    }

    /// Register a pending-operation matcher. It is offered every inbound
    /// message ahead of event translation; returning `true` removes it.
    /// All matchers are dropped when the connection dies, so their
    /// `oneshot` senders resolve the waiting operation with a disconnect.
    pub(crate) fn add_matcher(&self, matcher: impl FnMut(&Message) -> bool + Send + 'static) {
        if self.is_dead() {
            return;
        }
        self.shared.waiters.lock().push(Box::new(matcher));
    }

    /// Tear the connection down. Idempotent; the session observes the
    /// resulting `Disconnected` event like any other drop.
    pub fn disconnect(&self, reason: DisconnectReason, text: Option<String>) {
        self.shared.begin_disconnect(reason, text);
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.shared.disconnect_reason.lock()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("domain", &self.shared.domain)
            .field("nick", &*self.shared.nick.read())
            .field("dead", &self.is_dead())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_error_lines() {
        assert_eq!(
            classify_error_text("Closing Link: 1.2.3.4 (Bad user info)"),
            DisconnectReason::Banned
        );
        assert_eq!(
            classify_error_text("You are being throttled"),
            DisconnectReason::Throttled
        );
        assert_eq!(
            classify_error_text("You are banned from this server"),
            DisconnectReason::Banned
        );
        assert_eq!(
            classify_error_text("Closing Link: (K-Lined)"),
            DisconnectReason::Banned
        );
        assert_eq!(
            classify_error_text("This server is full"),
            DisconnectReason::TooManyConns
        );
        assert_eq!(
            classify_error_text("Closing Link: (Quit)"),
            DisconnectReason::RawError
        );
    }

    #[test]
    fn claim_lines_cover_channel_traffic_only() {
        let msg: Message = ":n!u@h PRIVMSG #chan :hello".parse().unwrap();
        assert!(claim_line(&msg).is_some());
        let msg: Message = ":n!u@h PRIVMSG someone :hello".parse().unwrap();
        assert!(claim_line(&msg).is_none());
        let msg: Message = ":n!u@h QUIT :bye".parse().unwrap();
        assert!(claim_line(&msg).is_some());
        let msg: Message = "PING :server".parse().unwrap();
        assert!(claim_line(&msg).is_none());
    }

    #[test]
    fn identical_lines_hash_identically_across_sessions() {
        let a: Message = ":n!u@h PRIVMSG #chan :hello".parse().unwrap();
        let b: Message = ":n!u@h PRIVMSG #chan :hello".parse().unwrap();
        assert_eq!(claim_line(&a), claim_line(&b));
    }
}

//! The bridged client session state machine.
//!
//! One `BridgedClient` is one virtual IRC connection: a Matrix user's
//! presence on one network, or the network's bot session. Status moves
//! strictly forward:
//!
//! ```text
//! Created ──connect()──▶ Connecting ──welcome──▶ Connected ──drop──▶ Dead
//!                             │                      │
//!                             └──────failure─────────┘        (a fresh
//!    any ──kill()──▶ Killed (absorbing)                        instance
//!                                                              reconnects)
//! ```
//!
//! The `Connected` state carries the live connection handle; a Dead
//! session is never revived in place - the pool builds a replacement from
//! the freshest persisted config.

use crate::db::IrcClientConfig;
use crate::error::{ClientError, CreateClientError, JoinError, NickChangeError};
use crate::irc::broker::IrcEventBroker;
use crate::irc::connection::{
    ConnectOpts, ConnectionHandle, ConnectionInstance, DisconnectReason,
};
use crate::irc::events::{ActionKind, IrcAction, IrcEvent, SessionEvent};
use crate::irc::ident::IdentGenerator;
use crate::irc::ipv6::Ipv6Generator;
use crate::irc::nick::valid_nick;
use crate::irc::pool::ClientPool;
use crate::irc::server::IrcServer;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use irc_proto::{Command, Message};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv6Addr;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The length of time to wait before trying to join the channel again.
const JOIN_TIMEOUT: Duration = Duration::from_secs(15);
const JOIN_MAX_ATTEMPTS: u32 = 5;
const NICK_DELAY_TIMER: Duration = Duration::from_secs(10);
const WHOIS_DELAY_TIMER: Duration = Duration::from_secs(10);
const NAMES_DELAY_TIMER: Duration = Duration::from_secs(5);
const PART_DELAY_TIMER: Duration = Duration::from_secs(10);
/// Users get a bounded connect-retry budget; the bot retries forever.
const USER_CONNECT_ATTEMPTS: u32 = 10;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Created,
    Connecting,
    Connected,
    Dead,
    Killed,
}

enum SessionState {
    Created,
    Connecting,
    Connected(ConnectionHandle),
    Dead,
    Killed,
}

impl SessionState {
    fn status(&self) -> ClientStatus {
        match self {
            Self::Created => ClientStatus::Created,
            Self::Connecting => ClientStatus::Connecting,
            Self::Connected(_) => ClientStatus::Connected,
            Self::Dead => ClientStatus::Dead,
            Self::Killed => ClientStatus::Killed,
        }
    }
}

/// Aggregated WHOIS reply. `user` is always present - a reply without it
/// means the nick does not exist and surfaces as `None` instead.
#[derive(Debug, Clone)]
pub struct WhoisInfo {
    pub nick: String,
    pub user: String,
    pub host: String,
    pub realname: String,
    pub idle_secs: Option<u64>,
    pub channels: Vec<String>,
}

impl WhoisInfo {
    /// Short human-readable summary for the admin surface.
    pub fn describe(&self) -> String {
        let mut out = format!("Whois info for '{}': {}@{}", self.nick, self.user, self.host);
        out.push_str(&format!("\nReal name: {}", self.realname));
        if !self.channels.is_empty() {
            out.push_str(&format!("\nOn channels: {}", self.channels.join(" ")));
        }
        if let Some(idle) = self.idle_secs {
            out.push_str(&format!("\n{idle} seconds idle"));
        }
        out
    }
}

/// NAMES reply for one channel.
#[derive(Debug, Clone)]
pub struct NamesInfo {
    pub channel: String,
    /// nick -> status prefixes ("@", "~@", "", ...).
    pub names: HashMap<String, String>,
}

/// NAMES reply annotated with the operator-equivalent subset.
#[derive(Debug, Clone)]
pub struct OperatorsInfo {
    pub channel: String,
    pub names: HashMap<String, String>,
    pub operator_nicks: Vec<String>,
}

type SharedJoin = Shared<BoxFuture<'static, Result<(), JoinError>>>;

impl std::fmt::Debug for BridgedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgedClient")
            .field("user_id", &self.user_id)
            .field("display_name", &self.display_name)
            .field("is_bot", &self.is_bot)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

pub struct BridgedClient {
    pub server: Arc<IrcServer>,
    /// Absent for the network's bot session.
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub is_bot: bool,
    /// Stable random id, used for log decoration and queue keys.
    pub id: Uuid,
    nick: RwLock<String>,
    config: Mutex<IrcClientConfig>,
    password: Option<String>,
    state: Mutex<SessionState>,
    status_tx: watch::Sender<ClientStatus>,
    chan_list: Mutex<BTreeSet<String>>,
    last_action: Mutex<Instant>,
    explicit_disconnect: std::sync::atomic::AtomicBool,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
    join_futures: Mutex<HashMap<String, SharedJoin>>,
    cached_operators: Mutex<HashMap<String, (OperatorsInfo, Instant)>>,
    whois_pending: Mutex<HashSet<String>>,
    idle_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    pool: Weak<ClientPool>,
    broker: Arc<IrcEventBroker>,
    ident_generator: Arc<IdentGenerator>,
    ipv6_generator: Arc<Ipv6Generator>,
}

impl BridgedClient {
    #[allow(clippy::too_many_arguments)] // constructor wires every collaborator once
    pub fn new(
        server: Arc<IrcServer>,
        config: IrcClientConfig,
        user_id: Option<String>,
        display_name: Option<String>,
        is_bot: bool,
        broker: Arc<IrcEventBroker>,
        ident_generator: Arc<IdentGenerator>,
        ipv6_generator: Arc<Ipv6Generator>,
        pool: Weak<ClientPool>,
    ) -> Arc<Self> {
        let chosen = config
            .desired_nick
            .clone()
            .unwrap_or_else(|| match &user_id {
                Some(user_id) => server.nick_for_user(user_id, display_name.as_deref()),
                None => server.bot_nick().to_string(),
            });
        // lenient coercion cannot reject
        let nick = valid_nick(&chosen, false, None).unwrap_or_else(|_| chosen.clone());
        let password = config
            .password
            .clone()
            .or_else(|| server.password().map(str::to_string));

        let (status_tx, _) = watch::channel(ClientStatus::Created);
        let client = Arc::new(Self {
            server,
            user_id,
            display_name,
            is_bot,
            id: Uuid::new_v4(),
            nick: RwLock::new(nick),
            config: Mutex::new(config),
            password,
            state: Mutex::new(SessionState::Created),
            status_tx,
            chan_list: Mutex::new(BTreeSet::new()),
            last_action: Mutex::new(Instant::now()),
            explicit_disconnect: std::sync::atomic::AtomicBool::new(false),
            disconnect_reason: Mutex::new(None),
            join_futures: Mutex::new(HashMap::new()),
            cached_operators: Mutex::new(HashMap::new()),
            whois_pending: Mutex::new(HashSet::new()),
            idle_timer: Mutex::new(None),
            pool,
            broker,
            ident_generator,
            ipv6_generator,
        });
        info!(client = %client, "Created client");
        client
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn nick(&self) -> String {
        self.nick.read().clone()
    }

    pub fn status(&self) -> ClientStatus {
        self.state.lock().status()
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.status(), ClientStatus::Dead | ClientStatus::Killed)
    }

    pub fn chan_list(&self) -> Vec<String> {
        self.chan_list.lock().iter().cloned().collect()
    }

    pub fn in_channel(&self, channel: &str) -> bool {
        self.chan_list.lock().contains(channel)
    }

    pub fn last_action(&self) -> Instant {
        *self.last_action.lock()
    }

    pub fn explicit_disconnect(&self) -> bool {
        self.explicit_disconnect
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.disconnect_reason.lock()
    }

    pub fn config_snapshot(&self) -> IrcClientConfig {
        self.config.lock().clone()
    }

    fn conn(&self) -> Result<ConnectionHandle, ClientError> {
        match &*self.state.lock() {
            SessionState::Connected(handle) => Ok(handle.clone()),
            _ => Err(ClientError::NotConnected),
        }
    }

    pub fn case_fold(&self, s: &str) -> String {
        match self.conn() {
            Ok(handle) => handle.case_fold(s),
            Err(_) => s.to_lowercase(),
        }
    }

    pub fn is_user_prefix_more_powerful_than(&self, prefix: char, than: char) -> Option<bool> {
        self.conn()
            .ok()
            .map(|h| h.with_isupport(|i| i.is_prefix_more_powerful_than(prefix, than)))
    }

    pub fn mode_for_prefix(&self, prefix: char) -> Option<char> {
        self.conn()
            .ok()
            .and_then(|h| h.with_isupport(|i| i.mode_for_prefix(prefix)))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect to the network: acquire ident (and optionally an IPv6
    /// source address), open the transport, adopt the network-assigned
    /// nick, and hand the event stream to the broker.
    pub async fn connect(self: &Arc<Self>) -> Result<(), CreateClientError> {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Killed) {
                return Err(CreateClientError::Connect(
                    crate::error::ConnectError::Registration("client was killed".into()),
                ));
            }
            debug!(client = %self, "Client is now CONNECTING");
            *state = SessionState::Connecting;
        }
        let _ = self.status_tx.send(ClientStatus::Connecting);

        match self.connect_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                info!(client = %self, error = %e, "Client is now DEAD");
                let mut state = self.state.lock();
                if !matches!(*state, SessionState::Killed) {
                    *state = SessionState::Dead;
                    drop(state);
                    let _ = self.status_tx.send(ClientStatus::Dead);
                }
                Err(e)
            }
        }
    }

    async fn connect_inner(self: &Arc<Self>) -> Result<(), CreateClientError> {
        let mut config = self.config_snapshot();
        let names = self
            .ident_generator
            .get_irc_names(&mut config, &self.server, self.user_id.as_deref())
            .await?;
        if let Some(prefix) = self.server.ipv6_prefix() {
            self.ipv6_generator.generate(prefix, &mut config).await?;
        }
        *self.config.lock() = config.clone();

        // Don't use stored IPv6 addresses unless the server still has a
        // prefix, else users couldn't turn IPv6 off.
        let local_address = self
            .server
            .ipv6_prefix()
            .and_then(|_| config.ipv6_address.as_deref())
            .and_then(|a| Ipv6Addr::from_str(a).ok());

        info!(
            client = %self,
            username = %names.username,
            "Connecting to IRC server"
        );
        self.broker
            .send_metadata(
                self,
                format!(
                    "Connecting to the IRC network '{}' as {}...",
                    self.server.domain(),
                    self.nick()
                ),
                false,
            )
            .await;

        let (events_tx, events_rx) = mpsc::unbounded_channel::<SessionEvent>();
        let opts = ConnectOpts {
            nick: self.nick(),
            username: names.username,
            realname: names.realname,
            password: self.password.clone(),
            local_address,
            max_attempts: if self.is_bot {
                None
            } else {
                Some(USER_CONNECT_ATTEMPTS)
            },
        };
        let desired_nick = self.nick();
        let handle = ConnectionInstance::create(&self.server, opts, events_tx).await?;

        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Killed) {
                // killed while the dial was in flight
                handle.disconnect(DisconnectReason::Killed, None);
                return Err(CreateClientError::Connect(
                    crate::error::ConnectError::Registration("client was killed".into()),
                ));
            }
            *state = SessionState::Connected(handle.clone());
        }
        // the network may have assigned a different nick; it is the truth
        *self.nick.write() = handle.nick();
        info!(client = %self, "Client is now CONNECTED");
        let _ = self.status_tx.send(ClientStatus::Connected);

        if let Some(pool) = self.pool.upgrade() {
            pool.on_client_connected(self, &desired_nick);
        }
        self.keep_alive();

        let mut connect_text = format!(
            "You've been connected to the IRC network '{}' as {}.",
            self.server.domain(),
            self.nick()
        );
        let user_modes = self.server.user_modes();
        if !user_modes.is_empty() && !self.is_bot {
            handle.send(Command::Raw(
                "MODE".into(),
                vec![self.nick(), format!("+{user_modes}")],
            ));
            connect_text.push_str(&format!(" User modes +{user_modes} have been set."));
        }
        self.broker.send_metadata(self, connect_text, false).await;

        self.broker.add_hooks(self.clone(), events_rx);
        Ok(())
    }

    /// Reconnect a fresh instance and rejoin its channels. Sequential on
    /// purpose: blasting joins at an IRCd straight after connecting gets
    /// clients killed for flooding.
    pub async fn reconnect(self: &Arc<Self>, channels: &[String]) -> Result<(), CreateClientError> {
        self.connect().await?;
        info!(client = %self, channels = channels.len(), "Reconnected; rejoining channels");
        for channel in channels {
            if let Err(e) = self.join_channel(channel, None).await {
                error!(client = %self, channel = %channel, error = %e, "Failed to rejoin channel");
            }
        }
        Ok(())
    }

    /// Disconnect the underlying transport. Explicit disconnects (idle
    /// cycling, limit cycling, user action) never auto-reconnect.
    pub fn disconnect(&self, reason: DisconnectReason, text: impl Into<String>, explicit: bool) {
        self.explicit_disconnect
            .store(explicit, std::sync::atomic::Ordering::SeqCst);
        if let Ok(handle) = self.conn() {
            handle.disconnect(reason, Some(text.into()));
        }
    }

    /// Administrative kill: absorbing, disconnects if connected.
    pub fn kill(&self, reason: Option<String>) {
        info!(client = %self, "Killing client");
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, SessionState::Killed)
        };
        let _ = self.status_tx.send(ClientStatus::Killed);
        if let SessionState::Connected(handle) = previous {
            handle.disconnect(
                DisconnectReason::Killed,
                Some(reason.unwrap_or_else(|| "killed".into())),
            );
        }
    }

    /// Resolves when the session reaches Connected; errors if it dies
    /// first.
    pub async fn wait_for_connected(&self) -> Result<(), ClientError> {
        let mut rx = self.status_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ClientStatus::Connected => return Ok(()),
                ClientStatus::Dead | ClientStatus::Killed => {
                    return Err(ClientError::NotConnected);
                }
                ClientStatus::Created | ClientStatus::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(ClientError::NotConnected);
            }
        }
    }

    /// Bump the activity clock and (re)arm the idle watchdog. Bots and
    /// membership-mirroring networks never idle out.
    pub fn keep_alive(self: &Arc<Self>) {
        *self.last_action.lock() = Instant::now();
        if self.is_bot || self.server.mirrors_membership() {
            return;
        }
        let Some(idle_timeout) = self.server.idle_timeout() else {
            return;
        };
        let client = self.clone();
        let mut timer = self.idle_timer.lock();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            info!(client = %client, "Idle timeout has expired");
            client.disconnect(
                DisconnectReason::Idle,
                format!("Idle timeout reached: {}s", idle_timeout.as_secs()),
                true,
            );
        }));
    }

    fn clear_idle_timer(&self) {
        if let Some(timer) = self.idle_timer.lock().take() {
            timer.abort();
        }
    }

    /// Session-level handling of a connection event, ahead of the
    /// broker's claim/relay logic.
    pub(crate) async fn handle_connection_event(self: &Arc<Self>, event: &SessionEvent) {
        match &event.event {
            IrcEvent::NickChange { old, new, .. } if *old == self.nick() => {
                info!(client = %self, old = %old, new = %new, "Nick changed");
                *self.nick.write() = new.clone();
                if let Some(pool) = self.pool.upgrade() {
                    pool.on_nick_change(self, old, new);
                }
            }
            IrcEvent::ServerError { code, args } => {
                // whois is listening for this one; hide it
                if code == "err_nosuchnick"
                    && args
                        .get(1)
                        .is_some_and(|nick| self.whois_pending.lock().contains(nick))
                {
                    return;
                }
                // Errors the user must see regardless of notice settings.
                let force = matches!(
                    code.as_str(),
                    "err_nononreg" | "err_nosuchnick" | "err_cannotsendtochan"
                );
                self.broker
                    .send_metadata(
                        self,
                        format!(
                            "Received an error on {}: {} {}",
                            self.server.domain(),
                            code,
                            args.join(" ")
                        ),
                        force,
                    )
                    .await;
            }
            IrcEvent::Disconnected { reason } => self.on_disconnected(*reason).await,
            _ => {}
        }
    }

    async fn on_disconnected(self: &Arc<Self>, reason: DisconnectReason) {
        *self.disconnect_reason.lock() = Some(reason);
        if reason == DisconnectReason::Banned {
            // being banned is as intentional as a disconnect gets
            self.explicit_disconnect
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
        {
            let mut state = self.state.lock();
            if !matches!(*state, SessionState::Killed) {
                info!(client = %self, reason = %reason, "Client is now DEAD");
                *state = SessionState::Dead;
                drop(state);
                let _ = self.status_tx.send(ClientStatus::Dead);
            }
        }
        self.clear_idle_timer();
        self.broker
            .send_metadata(
                self,
                format!(
                    "Your connection to the IRC network '{}' has been lost.",
                    self.server.domain()
                ),
                false,
            )
            .await;
        if let Some(pool) = self.pool.upgrade() {
            pool.on_client_disconnected(self).await;
        }
    }

    // ========================================================================
    // Channel operations
    // ========================================================================

    /// Join a channel. Idempotent, and concurrent joins for the same
    /// channel share one attempt (and one JOIN on the wire).
    pub async fn join_channel(
        self: &Arc<Self>,
        channel: &str,
        key: Option<String>,
    ) -> Result<(), JoinError> {
        let shared = {
            let mut defers = self.join_futures.lock();
            match defers.get(channel) {
                Some(existing) => existing.clone(),
                None => {
                    let client = self.clone();
                    let chan = channel.to_string();
                    let fut: SharedJoin = async move {
                        let result = client.do_join(&chan, key).await;
                        client.join_futures.lock().remove(&chan);
                        result
                    }
                    .boxed()
                    .shared();
                    defers.insert(channel.to_string(), fut.clone());
                    fut
                }
            }
        };
        shared.await
    }

    async fn do_join(self: &Arc<Self>, channel: &str, key: Option<String>) -> Result<(), JoinError> {
        // we may be trying to join before we've connected, so wait
        if self.status() == ClientStatus::Connecting {
            self.wait_for_connected()
                .await
                .map_err(|_| JoinError::NoClient)?;
        }
        let handle = self.conn().map_err(|_| JoinError::NoClient)?;
        if !channel.starts_with('#') {
            return Ok(()); // PM target, nothing to join
        }
        if self.server.is_excluded_channel(channel) {
            return Err(JoinError::Excluded(channel.to_string()));
        }
        if handle.in_channel(channel) {
            self.add_channel(channel);
            return Ok(());
        }
        let key = key.or_else(|| self.server.channel_key(channel).map(str::to_string));

        for attempt in 1..=JOIN_MAX_ATTEMPTS {
            debug!(client = %self, channel, attempt, "Joining channel");
            let rx = self.arm_join_waiter(&handle, channel);
            handle.send(Command::JOIN(channel.to_string(), key.clone(), None));

            match tokio::time::timeout(JOIN_TIMEOUT, rx).await {
                Ok(Ok(Ok(()))) => {
                    debug!(client = %self, channel, "Joined channel");
                    self.add_channel(channel);
                    return Ok(());
                }
                Ok(Ok(Err(code))) => {
                    error!(client = %self, channel, code = %code, "Cannot join channel");
                    if let Some(pool) = self.pool.upgrade() {
                        pool.on_join_error(self, channel, &code).await;
                    }
                    self.broker
                        .send_metadata(
                            self,
                            format!(
                                "Could not join {} on '{}': {}",
                                channel,
                                self.server.domain(),
                                code
                            ),
                            true,
                        )
                        .await;
                    return Err(JoinError::Rejected(code));
                }
                Ok(Err(_)) => return Err(JoinError::NoClient), // connection died
                Err(_) => {
                    if handle.is_dead() {
                        return Err(JoinError::NoClient);
                    }
                    // the ack may have been lost while the join succeeded
                    if handle.in_channel(channel) {
                        debug!(client = %self, channel, "Timed out joining but already joined");
                        self.add_channel(channel);
                        return Ok(());
                    }
                    warn!(client = %self, channel, attempt, "Timed out joining, trying again");
                }
            }
        }
        Err(JoinError::MultipleTries(channel.to_string()))
    }

    /// One-shot waiter resolving on our own JOIN echo or a recognized
    /// hard rejection naming the channel.
    fn arm_join_waiter(
        &self,
        handle: &ConnectionHandle,
        channel: &str,
    ) -> oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let me = handle.nick();
        let isupport = handle.with_isupport(|i| i.clone());
        let want = isupport.to_lower(channel);
        handle.add_matcher(move |msg| {
            let Some(tx_ref) = tx.as_ref() else {
                return true;
            };
            if tx_ref.is_closed() {
                return true;
            }
            match &msg.command {
                Command::JOIN(chans, _, _) => {
                    let from_me = msg
                        .source_nickname()
                        .is_some_and(|n| n.eq_ignore_ascii_case(&me));
                    if from_me && chans.split(',').any(|c| isupport.to_lower(c) == want) {
                        if let Some(tx) = tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                        return true;
                    }
                    false
                }
                Command::Response(resp, args) => {
                    if let Some(code) = join_fail_code(*resp as u16)
                        && args.iter().any(|a| isupport.to_lower(a) == want)
                    {
                        if let Some(tx) = tx.take() {
                            let _ = tx.send(Err(code.to_string()));
                        }
                        return true;
                    }
                    false
                }
                _ => false,
            }
        });
        rx
    }

    /// PART a channel; the membership set is updated only once the
    /// network acknowledges.
    pub async fn leave_channel(&self, channel: &str, reason: &str) -> Result<(), ClientError> {
        let Ok(handle) = self.conn() else {
            return Ok(()); // we were never connected to the network
        };
        if !channel.starts_with('#') {
            return Ok(()); // PM room
        }
        if !self.in_channel(channel) {
            return Ok(()); // we were never joined to it
        }
        debug!(client = %self, channel, "Leaving channel");

        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let me = handle.nick();
        let isupport = handle.with_isupport(|i| i.clone());
        let want = isupport.to_lower(channel);
        handle.add_matcher(move |msg| {
            let Some(tx_ref) = tx.as_ref() else {
                return true;
            };
            if tx_ref.is_closed() {
                return true;
            }
            if let Command::PART(chans, _) = &msg.command
                && msg
                    .source_nickname()
                    .is_some_and(|n| n.eq_ignore_ascii_case(&me))
                && chans.split(',').any(|c| isupport.to_lower(c) == want)
            {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(());
                }
                return true;
            }
            false
        });
        handle.send(Command::PART(channel.to_string(), Some(reason.to_string())));

        match tokio::time::timeout(PART_DELAY_TIMER, rx).await {
            Ok(Ok(())) => {
                debug!(client = %self, channel, "Left channel");
                self.remove_channel(channel);
                Ok(())
            }
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => Err(ClientError::Timeout("part acknowledgement")),
        }
    }

    pub async fn kick(&self, nick: &str, channel: &str, reason: &str) -> Result<(), ClientError> {
        let Ok(handle) = self.conn() else {
            return Ok(()); // we were never connected to the network
        };
        if !channel.starts_with('#') || !handle.in_channel(channel) {
            return Ok(()); // we need to be joined to kick people
        }
        debug!(client = %self, nick, channel, "Kicking user");
        handle.send(Command::KICK(
            channel.to_string(),
            nick.to_string(),
            Some(reason.to_string()),
        ));
        Ok(())
    }

    fn add_channel(&self, channel: &str) {
        self.chan_list.lock().insert(channel.to_string());
    }

    fn remove_channel(&self, channel: &str) {
        self.chan_list.lock().remove(channel);
    }

    // ========================================================================
    // Nick operations
    // ========================================================================

    /// Change nick on behalf of the owning user. Validation is strict or
    /// lenient per `strict`; a coerced result that differs from the
    /// request is rejected rather than silently "suggested".
    pub async fn change_nick(
        self: &Arc<Self>,
        new_nick: &str,
        strict: bool,
    ) -> Result<String, NickChangeError> {
        info!(client = %self, new_nick, "Trying to change nick");
        let max_len = self.conn().ok().and_then(|h| h.max_nick_len());
        let valid = valid_nick(new_nick, strict, max_len)
            .map_err(|e| NickChangeError::Invalid(e.0))?;
        if valid == self.nick() {
            return Err(NickChangeError::AlreadySet(valid));
        }
        if valid != new_nick {
            return Err(NickChangeError::Invalid("Nickname is not valid".into()));
        }

        // cheap local check before paying for a network round-trip
        if let Some(pool) = self.pool.upgrade()
            && pool
                .get_bridged_client_by_nick(&self.server, &valid)
                .is_some()
        {
            return Err(NickChangeError::Taken {
                nick: valid,
                domain: self.server.domain().to_string(),
            });
        }

        let exists = self.whois(&valid).await.map_err(|e| match e {
            ClientError::Timeout(_) => NickChangeError::Timeout,
            _ => NickChangeError::NotConnected,
        })?;
        if exists.is_some() {
            return Err(NickChangeError::Taken {
                nick: valid,
                domain: self.server.domain().to_string(),
            });
        }

        self.send_nick_command(valid).await
    }

    async fn send_nick_command(self: &Arc<Self>, nick: String) -> Result<String, NickChangeError> {
        let handle = self.conn().map_err(|_| NickChangeError::NotConnected)?;
        // reserve the nick in the pool before the network confirms it, so
        // a ghost join can't race the rename
        if let Some(pool) = self.pool.upgrade() {
            pool.add_pending_nick(&self.server, &nick, self);
        }

        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let me = handle.nick();
        let want = nick.clone();
        handle.add_matcher(move |msg| {
            let Some(tx_ref) = tx.as_ref() else {
                return true;
            };
            if tx_ref.is_closed() {
                return true;
            }
            match &msg.command {
                Command::NICK(new) => {
                    if msg
                        .source_nickname()
                        .is_some_and(|n| n.eq_ignore_ascii_case(&me))
                    {
                        if let Some(tx) = tx.take() {
                            let _ = tx.send(Ok((me.clone(), new.clone())));
                        }
                        return true;
                    }
                    false
                }
                Command::Response(resp, args) => {
                    if let Some(code) = nick_fail_code(*resp as u16)
                        && args.iter().any(|a| a.eq_ignore_ascii_case(&want))
                    {
                        if let Some(tx) = tx.take() {
                            let _ = tx.send(Err(code.to_string()));
                        }
                        return true;
                    }
                    false
                }
                _ => false,
            }
        });
        handle.send(Command::NICK(nick.clone()));

        let result = tokio::time::timeout(NICK_DELAY_TIMER, rx).await;
        if let Some(pool) = self.pool.upgrade() {
            pool.remove_pending_nick(&self.server, &nick);
        }
        match result {
            Ok(Ok(Ok((old, new)))) => Ok(format!("Nick changed from '{old}' to '{new}'.")),
            Ok(Ok(Err(code))) => {
                error!(client = %self, code = %code, "Nick change error");
                Err(NickChangeError::Rejected(code))
            }
            Ok(Err(_)) => Err(NickChangeError::NotConnected),
            Err(_) => {
                error!(client = %self, nick = %nick, "Timed out trying to change nick");
                Err(NickChangeError::Timeout)
            }
        }
    }

    /// Whether a nick exists on the network.
    pub async fn check_nick_exists(self: &Arc<Self>, nick: &str) -> Result<bool, ClientError> {
        Ok(self.whois(nick).await?.is_some())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// WHOIS a nick. `Ok(None)` means the network says the nick does not
    /// exist; a timeout is an error, because the request may still have
    /// succeeded silently.
    pub async fn whois(self: &Arc<Self>, nick: &str) -> Result<Option<WhoisInfo>, ClientError> {
        let handle = self.conn()?;
        self.whois_pending.lock().insert(nick.to_string());

        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let want = nick.to_string();
        let mut builder: Option<WhoisInfo> = None;
        handle.add_matcher(move |msg| {
            let Some(tx_ref) = tx.as_ref() else {
                return true;
            };
            if tx_ref.is_closed() {
                return true;
            }
            let Command::Response(resp, args) = &msg.command else {
                return false;
            };
            if !args.get(1).is_some_and(|n| n.eq_ignore_ascii_case(&want)) {
                return false;
            }
            match *resp as u16 {
                311 => {
                    // [me, nick, user, host, "*", realname]
                    builder = Some(WhoisInfo {
                        nick: args[1].clone(),
                        user: args.get(2).cloned().unwrap_or_default(),
                        host: args.get(3).cloned().unwrap_or_default(),
                        realname: args.get(5).cloned().unwrap_or_default(),
                        idle_secs: None,
                        channels: Vec::new(),
                    });
                    false
                }
                319 => {
                    if let Some(info) = builder.as_mut() {
                        info.channels = args
                            .get(2)
                            .map(|c| c.split_whitespace().map(str::to_string).collect())
                            .unwrap_or_default();
                    }
                    false
                }
                317 => {
                    if let Some(info) = builder.as_mut() {
                        info.idle_secs = args.get(2).and_then(|i| i.parse().ok());
                    }
                    false
                }
                318 => {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(builder.take());
                    }
                    true
                }
                401 => {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(None);
                    }
                    true
                }
                _ => false,
            }
        });
        handle.send(Command::WHOIS(None, nick.to_string()));

        let result = tokio::time::timeout(WHOIS_DELAY_TIMER, rx).await;
        self.whois_pending.lock().remove(nick);
        match result {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => Err(ClientError::Timeout("whois")),
        }
    }

    /// NAMES for a channel.
    pub async fn get_nicks(&self, channel: &str) -> Result<NamesInfo, ClientError> {
        let handle = self.conn()?;
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let isupport = handle.with_isupport(|i| i.clone());
        let want = isupport.to_lower(channel);
        let mut names: HashMap<String, String> = HashMap::new();
        handle.add_matcher(move |msg| {
            let Some(tx_ref) = tx.as_ref() else {
                return true;
            };
            if tx_ref.is_closed() {
                return true;
            }
            let Command::Response(resp, args) = &msg.command else {
                return false;
            };
            match *resp as u16 {
                353 => {
                    // [me, symbol, channel, names]
                    if args.get(2).is_some_and(|c| isupport.to_lower(c) == want) {
                        for name in args.get(3).map(String::as_str).unwrap_or("").split_whitespace()
                        {
                            let (prefixes, nick) = isupport.split_name(name);
                            names.insert(nick, prefixes);
                        }
                    }
                    false
                }
                366 => {
                    if args.get(1).is_some_and(|c| isupport.to_lower(c) == want) {
                        if let Some(tx) = tx.take() {
                            let _ = tx.send(std::mem::take(&mut names));
                        }
                        return true;
                    }
                    false
                }
                _ => false,
            }
        });
        handle.send(Command::NAMES(Some(channel.to_string()), None));

        match tokio::time::timeout(NAMES_DELAY_TIMER, rx).await {
            Ok(Ok(names)) => Ok(NamesInfo {
                channel: channel.to_string(),
                names,
            }),
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => Err(ClientError::Timeout("names")),
        }
    }

    /// The operator-equivalent users of a channel: join, NAMES, part.
    ///
    /// A user counts as an operator if their most powerful prefix is `@`
    /// or anything the server ranks above it (ISUPPORT PREFIX ordering).
    pub async fn get_operators(
        self: &Arc<Self>,
        channel: &str,
        key: Option<String>,
        cache_duration: Option<Duration>,
    ) -> Result<OperatorsInfo, ClientError> {
        if cache_duration.is_some() {
            let cache = self.cached_operators.lock();
            if let Some((cached, expiry)) = cache.get(channel)
                && Instant::now() < *expiry
            {
                return Ok(cached.clone());
            }
        }

        self.join_channel(channel, key).await?;
        let names_info = self.get_nicks(channel).await?;
        self.leave_channel(channel, "User left").await?;

        let handle = self.conn()?;
        let operator_nicks = handle.with_isupport(|isupport| {
            names_info
                .names
                .iter()
                .filter(|(_, prefixes)| prefixes.chars().any(|p| isupport.is_operator_prefix(p)))
                .map(|(nick, _)| nick.clone())
                .collect::<Vec<_>>()
        });

        let info = OperatorsInfo {
            channel: names_info.channel,
            names: names_info.names,
            operator_nicks,
        };

        if let Some(ttl) = cache_duration {
            self.cached_operators
                .lock()
                .insert(channel.to_string(), (info.clone(), Instant::now() + ttl));
            let client = self.clone();
            let chan = channel.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                client.cached_operators.lock().remove(&chan);
            });
        }
        Ok(info)
    }

    /// Query channel modes; the reply arrives as a `ModeIs` event through
    /// the broker.
    pub fn mode(&self, channel_or_nick: &str) -> Result<(), ClientError> {
        let handle = self.conn()?;
        handle.send(Command::ChannelMODE(channel_or_nick.to_string(), vec![]));
        Ok(())
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Relay a Matrix-originated action onto IRC, joining the channel
    /// first if needed.
    pub async fn send_action(
        self: &Arc<Self>,
        channel: &str,
        action: IrcAction,
    ) -> Result<(), ClientError> {
        self.keep_alive();
        let expires_at = match (action.ts, self.server.message_expiry()) {
            (Some(ts), Some(expiry)) => Some(ts + expiry.as_millis() as i64),
            _ => None,
        };
        match action.kind {
            ActionKind::Topic => self.set_topic(channel, &action.text).await,
            kind => self.send_message(channel, kind, &action.text, expires_at).await,
        }
    }

    async fn send_message(
        self: &Arc<Self>,
        channel: &str,
        kind: ActionKind,
        text: &str,
        expires_at: Option<i64>,
    ) -> Result<(), ClientError> {
        self.wait_for_connected().await?;
        self.join_channel(channel, None).await?;

        // the join may have been slow; stale content is worse than none
        if let Some(expires_at) = expires_at
            && chrono::Utc::now().timestamp_millis() > expires_at
        {
            warn!(client = %self, channel, "Dropping event: too old by the time we could send");
            return Ok(());
        }

        let handle = self.conn()?;
        match kind {
            ActionKind::Message => handle.say(channel, text),
            ActionKind::Notice => handle.notice(channel, text),
            ActionKind::Emote => handle.action(channel, text),
            ActionKind::Topic => unreachable!("topic handled by send_action"),
        }
        Ok(())
    }

    async fn set_topic(self: &Arc<Self>, channel: &str, topic: &str) -> Result<(), ClientError> {
        self.join_channel(channel, None).await?;
        info!(client = %self, channel, "Setting topic");
        let handle = self.conn()?;
        handle.send(Command::TOPIC(channel.to_string(), Some(topic.to_string())));
        Ok(())
    }

    /// Push a raw command line through this session (debug surface).
    pub fn send_raw_command(&self, line: &str) -> Result<(), ClientError> {
        let handle = self.conn()?;
        let msg: Message = line
            .parse()
            .map_err(|_| ClientError::Timeout("unparseable raw command"))?;
        handle.send(msg.command);
        Ok(())
    }
}

impl std::fmt::Display for BridgedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}#{}",
            self.nick.read(),
            self.server.domain(),
            &self.id.to_string()[..8]
        )?;
        if let Some(user_id) = &self.user_id {
            write!(f, " ({user_id})")?;
        }
        Ok(())
    }
}

/// Recognized hard join rejections: retrying cannot succeed.
fn join_fail_code(code: u16) -> Option<&'static str> {
    match code {
        403 => Some("err_nosuchchannel"),
        405 => Some("err_toomanychannels"),
        471 => Some("err_channelisfull"),
        473 => Some("err_inviteonlychan"),
        474 => Some("err_bannedfromchan"),
        475 => Some("err_badchannelkey"),
        477 => Some("err_needreggednick"),
        _ => None,
    }
}

/// Recognized nick-change rejections.
fn nick_fail_code(code: u16) -> Option<&'static str> {
    match code {
        431 => Some("err_nonicknamegiven"),
        432 => Some("err_erroneusnickname"),
        433 => Some("err_nicknameinuse"),
        436 => Some("err_nickcollision"),
        437 => Some("err_unavailresource"),
        _ => None,
    }
}

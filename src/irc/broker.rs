//! Decides how events observed on IRC connections reach the Matrix side.
//!
//! Every connected client hears the same lines down its own TCP stream,
//! but each distinct event must reach the sink exactly once. When a
//! network's bot is enabled, the bot is that unique relay and everyone
//! else's channel traffic is ignored. When it is disabled, the sessions
//! compete through the claim table:
//!
//! - hash the server line; unclaimed hashes are claimed by the reporting
//!   session and forwarded;
//! - hashes claimed by a still-live session are duplicates heard on
//!   another stream: dropped;
//! - hashes claimed by a session that has since vanished from the pool
//!   are stolen - the previous claimant can never process them now.
//!
//! A claim proves nothing about a *slow* claimant: a lagging-but-alive
//! session keeps its claims, and a dead-but-undetected one can race the
//! thief into a real duplicate. That asymmetry is inherited deliberately;
//! tightening it would change what observers see during partitions.
//!
//! Channel message ordering is best-effort: per-channel, each event waits
//! up to five seconds for its predecessor's processing, then proceeds
//! anyway rather than queue indefinitely behind a slow homeserver.

use crate::irc::debounce::QuitDebouncer;
use crate::irc::dedup::{ProcessedDict, hash_line};
use crate::irc::events::{
    ActionKind, EventSink, IrcAction, IrcEvent, IrcUser, JoinKind, PartKind, SessionEvent,
};
use crate::irc::nick::is_valid_nick_start;
use crate::irc::pool::ClientPool;
use crate::irc::server::IrcServer;
use crate::irc::session::{BridgedClient, ClientStatus};
use crate::metrics;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How long a channel's previous event may hold up the next one.
const BUFFER_TIMEOUT: Duration = Duration::from_secs(5);

type ChannelChain = Shared<BoxFuture<'static, ()>>;

pub struct IrcEventBroker {
    sink: Arc<dyn EventSink>,
    pool: Weak<ClientPool>,
    processed: Arc<ProcessedDict>,
    channel_buffers: Mutex<HashMap<(String, String), ChannelChain>>,
    debouncer: Arc<QuitDebouncer>,
}

impl IrcEventBroker {
    pub fn new(sink: Arc<dyn EventSink>, pool: Weak<ClientPool>) -> Arc<Self> {
        let processed = Arc::new(ProcessedDict::new());
        processed.start_cleaner();
        Arc::new(Self {
            sink,
            pool,
            processed,
            channel_buffers: Mutex::new(HashMap::new()),
            debouncer: Arc::new(QuitDebouncer::new()),
        })
    }

    /// Attach a session's event stream. The pump gives the session first
    /// look (self-nick adoption, disconnect transitions), then runs the
    /// relay decision.
    pub fn add_hooks(
        self: &Arc<Self>,
        client: Arc<BridgedClient>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let broker = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                client.handle_connection_event(&event).await;
                if matches!(event.event, IrcEvent::Disconnected { .. }) {
                    break;
                }
                broker.dispatch(&client, event).await;
            }
        });
    }

    /// Connection status notices for the owning user. Bots and networks
    /// with notices disabled stay quiet unless the message is forced.
    pub async fn send_metadata(&self, client: &Arc<BridgedClient>, text: String, force: bool) {
        if (client.is_bot || !client.server.sends_connection_notices()) && !force {
            return;
        }
        self.sink.on_metadata(client, text, force).await;
    }

    async fn dispatch(self: &Arc<Self>, client: &Arc<BridgedClient>, event: SessionEvent) {
        let server = &client.server;
        let SessionEvent { line, event } = event;

        // Private traffic is only delivered down the recipient's own
        // stream; no claiming involved.
        match &event {
            IrcEvent::Message { to, .. }
            | IrcEvent::Notice { to, .. }
            | IrcEvent::Action { to, .. }
                if !to.starts_with('#') =>
            {
                self.dispatch_private(client, &event).await;
                return;
            }
            IrcEvent::Invite { channel, from } => {
                let from = self.make_user(server, from);
                let to = self.make_user(server, &client.nick());
                self.sink.on_invite(server, from, to, channel.clone()).await;
                return;
            }
            IrcEvent::ModeIs { target, modes } => {
                // only the bot issues MODE queries, so only it listens
                if client.is_bot {
                    self.sink
                        .on_mode_is(server, target.clone(), modes.clone())
                        .await;
                }
                return;
            }
            IrcEvent::ServerError { .. } | IrcEvent::Disconnected { .. } => return,
            _ => {}
        }

        let relay = if server.is_bot_enabled() {
            // the bot handles all the things; proxy straight through
            client.is_bot
        } else {
            !client.is_bot && self.attempt_claim(client, line.as_deref(), &event)
        };
        if !relay {
            metrics::dedup_dropped(server.domain());
            return;
        }
        self.forward(client, event).await;
    }

    /// Try to claim this line for `client`. See the module docs for the
    /// algorithm.
    fn attempt_claim(
        &self,
        client: &Arc<BridgedClient>,
        line: Option<&str>,
        event: &IrcEvent,
    ) -> bool {
        let Some(line) = line else {
            warn!(client = %client, "Unexpected unclaimed event shape; dropping");
            return false;
        };
        let domain = client.server.domain();
        let hash = hash_line(line);
        let nick = client.nick();
        // NAMES claims never expire: culling them would re-sync whole
        // member directories
        let permanent = matches!(event, IrcEvent::Names { .. });

        match self.processed.get_claimer(domain, hash) {
            None => {
                self.processed.claim(domain, hash, &nick, permanent);
                true
            }
            Some(owner) if owner == nick => {
                // dupes are not sent down the same TCP connection, so the
                // same message on the same stream is a genuine repeat
                self.processed.claim(domain, hash, &nick, permanent);
                true
            }
            Some(owner) => {
                let owner_alive = self.pool.upgrade().is_some_and(|pool| {
                    pool.get_bridged_client_by_nick(&client.server, &owner).is_some()
                });
                if owner_alive {
                    false
                } else {
                    // finders keepers
                    debug!(
                        nick = %nick,
                        previous = %owner,
                        "Stealing claim from dead session"
                    );
                    metrics::dedup_steal(domain);
                    self.processed.claim(domain, hash, &nick, permanent);
                    true
                }
            }
        }
    }

    async fn dispatch_private(&self, client: &Arc<BridgedClient>, event: &IrcEvent) {
        let server = &client.server;
        let (from, to, action) = match event {
            IrcEvent::Message { from, to, text } => {
                (from, to, IrcAction::new(ActionKind::Message, text.clone()))
            }
            IrcEvent::Notice { from, to, text } => {
                (from, to, IrcAction::new(ActionKind::Notice, text.clone()))
            }
            IrcEvent::Action { from, to, text } => {
                (from, to, IrcAction::new(ActionKind::Emote, text.clone()))
            }
            _ => return,
        };
        // check and drop here to skip the processing cost downstream
        if !is_valid_nick_start(to) {
            return;
        }
        let from = self.make_user(server, from);
        let to = self.make_user(server, to);
        self.sink.on_private_message(server, from, to, action).await;
    }

    /// Relay one claimed (or bot-proxied) event to the sink.
    async fn forward(self: &Arc<Self>, client: &Arc<BridgedClient>, event: IrcEvent) {
        let server = client.server.clone();
        match event {
            IrcEvent::Message { from, to, text } => {
                self.buffer_to_channel(&server, &from, &to, ActionKind::Message, text)
                    .await;
            }
            IrcEvent::Notice { from, to, text } => {
                self.buffer_to_channel(&server, &from, &to, ActionKind::Notice, text)
                    .await;
            }
            IrcEvent::Action { from, to, text } => {
                let from = self.make_user(&server, &from);
                self.sink
                    .on_message(&server, from, to, IrcAction::new(ActionKind::Emote, text))
                    .await;
            }
            IrcEvent::Join { channel, nick } => {
                self.debouncer.on_join(server.domain(), &nick);
                let user = self.make_user(&server, &nick);
                self.sink.on_join(&server, user, channel, JoinKind::Join).await;
            }
            IrcEvent::Part {
                channel,
                nick,
                reason,
            } => {
                let user = self.make_user(&server, &nick);
                self.sink
                    .on_part(&server, user, channel, PartKind::Part, reason)
                    .await;
            }
            IrcEvent::Kick {
                channel,
                nick,
                by,
                reason,
            } => {
                let by = self.make_user(&server, &by);
                let kicked = self.make_user(&server, &nick);
                self.sink.on_kick(&server, by, kicked, channel, reason).await;
            }
            IrcEvent::Quit {
                nick,
                reason,
                channels,
            } => {
                // debouncing can hold the leave for a long while; don't
                // stall this session's event pump behind it
                let broker = self.clone();
                tokio::spawn(async move {
                    broker.relay_quit(server, nick, reason, channels).await;
                });
            }
            IrcEvent::NickChange { old, new, channels } => {
                for channel in channels {
                    let old_user = self.make_user(&server, &old);
                    let new_user = self.make_user(&server, &new);
                    self.sink
                        .on_part(&server, old_user, channel.clone(), PartKind::Nick, None)
                        .await;
                    self.sink.on_join(&server, new_user, channel, JoinKind::Nick).await;
                }
            }
            IrcEvent::Mode {
                target,
                by,
                mode,
                enabled,
                arg,
            } => {
                self.sink.on_mode(&server, target, by, mode, enabled, arg).await;
            }
            IrcEvent::Topic { channel, topic, by } => {
                if channel.starts_with('#') {
                    let user = self.make_user(&server, &by);
                    self.sink.on_topic(&server, user, channel, topic).await;
                }
            }
            IrcEvent::Names { channel, names } => {
                // drain one name at a time so a 5000-user directory sync
                // doesn't flood the homeserver with parallel joins
                let broker = self.clone();
                let client = client.clone();
                tokio::spawn(async move {
                    broker.relay_names(client, server, channel, names).await;
                });
            }
            IrcEvent::Invite { .. }
            | IrcEvent::ModeIs { .. }
            | IrcEvent::ServerError { .. }
            | IrcEvent::Disconnected { .. } => {}
        }
    }

    async fn relay_quit(
        &self,
        server: Arc<IrcServer>,
        nick: String,
        reason: Option<String>,
        channels: Vec<String>,
    ) {
        if channels.is_empty() {
            return;
        }
        if !self.debouncer.debounce_quit(&server, &nick).await {
            return; // rejoined during the debounce window
        }
        for channel in channels {
            let user = self.make_user(&server, &nick);
            self.sink
                .on_part(&server, user, channel, PartKind::Quit, reason.clone())
                .await;
        }
    }

    async fn relay_names(
        &self,
        client: Arc<BridgedClient>,
        server: Arc<IrcServer>,
        channel: String,
        names: HashMap<String, String>,
    ) {
        debug!(channel = %channel, count = names.len(), "Syncing NAMES list");
        for (nick, prefixes) in names {
            let user = self.make_user(&server, &nick);
            self.sink
                .on_join(&server, user, channel.clone(), JoinKind::Names)
                .await;

            // report only the most powerful prefix as a mode
            let Some(top_prefix) = most_powerful_prefix(&client, &prefixes) else {
                continue;
            };
            if client.status() != ClientStatus::Connected {
                continue;
            }
            let Some(mode) = client.mode_for_prefix(top_prefix) else {
                continue;
            };
            self.sink
                .on_mode(
                    &server,
                    channel.clone(),
                    nick.clone(),
                    mode,
                    true,
                    Some(nick.clone()),
                )
                .await;
        }
    }

    /// Chain channel-targeted messages per channel, with an escape hatch:
    /// if the predecessor hasn't finished inside `BUFFER_TIMEOUT`, the
    /// next event jumps the queue rather than waiting forever.
    async fn buffer_to_channel(
        &self,
        server: &Arc<IrcServer>,
        from: &str,
        channel: &str,
        kind: ActionKind,
        text: String,
    ) {
        let key = (server.domain().to_string(), channel.to_string());
        let sink = self.sink.clone();
        let from = self.make_user(server, from);
        let server = server.clone();
        let channel_owned = channel.to_string();

        let previous = self.channel_buffers.lock().get(&key).cloned();
        let chained: ChannelChain = async move {
            if let Some(previous) = previous {
                if tokio::time::timeout(BUFFER_TIMEOUT, previous).await.is_err() {
                    warn!(channel = %channel_owned, "Previous event took too long; jumping the queue");
                }
            }
            sink.on_message(&server, from, channel_owned, IrcAction::new(kind, text))
                .await;
        }
        .boxed()
        .shared();
        self.channel_buffers.lock().insert(key.clone(), chained.clone());
        chained.clone().await;

        // drop the chain entry if we are still its tail
        let mut buffers = self.channel_buffers.lock();
        if buffers.get(&key).is_some_and(|tail| tail.ptr_eq(&chained)) {
            buffers.remove(&key);
        }
    }

    fn make_user(&self, server: &Arc<IrcServer>, nick: &str) -> IrcUser {
        let is_virtual = self
            .pool
            .upgrade()
            .is_some_and(|pool| pool.nick_is_virtual(server, nick));
        IrcUser {
            domain: server.domain().to_string(),
            nick: nick.to_string(),
            is_virtual,
        }
    }
}

/// The most powerful status prefix in `prefixes` per the connected
/// network's PREFIX ordering.
fn most_powerful_prefix(client: &Arc<BridgedClient>, prefixes: &str) -> Option<char> {
    let mut best: Option<char> = None;
    for prefix in prefixes.chars() {
        best = match best {
            None => Some(prefix),
            Some(current) => {
                if client
                    .is_user_prefix_more_powerful_than(prefix, current)
                    .unwrap_or(false)
                {
                    Some(prefix)
                } else {
                    Some(current)
                }
            }
        };
    }
    best
}

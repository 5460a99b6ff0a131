//! The connection pool: the single authoritative registry of live
//! sessions per server.
//!
//! All per-server registry state lives in one [`ServerClients`] struct
//! behind one map entry - the nick map, the userId map, the pending-nick
//! map, the bot slot and the live-connection counter - so compound
//! updates happen under one lock and the counter never needs recomputing
//! by scanning (too expensive at thousands of clients).

use crate::db::{DataStore, IrcClientConfig};
use crate::error::CreateClientError;
use crate::irc::broker::IrcEventBroker;
use crate::irc::connection::DisconnectReason;
use crate::irc::events::EventSink;
use crate::irc::ident::IdentGenerator;
use crate::irc::ipv6::Ipv6Generator;
use crate::irc::server::IrcServer;
use crate::irc::session::{BridgedClient, ClientStatus};
use crate::metrics;
use crate::util::QueuePool;
use dashmap::DashMap;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause between bot login retries; the bot's presence is structurally
/// required, so this loop never gives up.
const BOT_LOGIN_RETRY: Duration = Duration::from_secs(10);

/// Join errors that mean the user cannot be in the channel at all; the
/// Matrix side is told so it can mirror the rejection.
const KICKABLE_JOIN_ERRORS: &[&str] = &[
    "err_bannedfromchan",
    "err_inviteonlychan",
    "err_channelisfull",
    "err_badchannelkey",
    "err_needreggednick",
];

#[derive(Default)]
struct ServerClients {
    nicks: HashMap<String, Arc<BridgedClient>>,
    user_ids: HashMap<String, Arc<BridgedClient>>,
    /// Sessions whose nick the network has not confirmed yet. Slow
    /// connects may see channel joins before `connected` fires, and the
    /// ghost mapping has to exist by then.
    pending: HashMap<String, Arc<BridgedClient>>,
    bot: Option<Arc<BridgedClient>>,
    /// Live user connections; always equals the populated `user_ids`
    /// entries. Maintained incrementally because recounting on every
    /// limit check is too expensive at scale. The bot is not counted and
    /// is never subject to the limit.
    count: usize,
}

struct ReconnectionItem {
    client: Arc<BridgedClient>,
    channels: Vec<String>,
}

pub struct ClientPool {
    servers: HashMap<String, Arc<IrcServer>>,
    store: Arc<dyn DataStore>,
    sink: Arc<dyn EventSink>,
    broker: Arc<IrcEventBroker>,
    ident_generator: Arc<IdentGenerator>,
    ipv6_generator: Arc<Ipv6Generator>,
    virtual_clients: DashMap<String, ServerClients>,
    reconnect_queues: DashMap<String, Arc<QueuePool<ReconnectionItem, ()>>>,
    weak_self: Weak<ClientPool>,
}

impl ClientPool {
    pub fn new(
        servers: Vec<Arc<IrcServer>>,
        store: Arc<dyn DataStore>,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ClientPool>| {
            let broker = IrcEventBroker::new(sink.clone(), weak.clone());
            Self {
                servers: servers
                    .iter()
                    .map(|s| (s.domain().to_string(), s.clone()))
                    .collect(),
                store: store.clone(),
                sink,
                broker,
                ident_generator: IdentGenerator::new(store.clone()),
                ipv6_generator: Ipv6Generator::new(store),
                virtual_clients: DashMap::new(),
                reconnect_queues: DashMap::new(),
                weak_self: weak.clone(),
            }
        })
    }

    pub fn server(&self, domain: &str) -> Option<Arc<IrcServer>> {
        self.servers.get(domain).cloned()
    }

    pub fn servers(&self) -> impl Iterator<Item = &Arc<IrcServer>> {
        self.servers.values()
    }

    pub fn broker(&self) -> &Arc<IrcEventBroker> {
        &self.broker
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// The cached live client for a user, or a freshly connected one.
    pub async fn get_or_create_bridged_client(
        self: &Arc<Self>,
        server: &Arc<IrcServer>,
        user_id: &str,
        display_name: Option<String>,
    ) -> Result<Arc<BridgedClient>, CreateClientError> {
        if let Some(client) = self.get_bridged_client_by_user_id(server, user_id) {
            return Ok(client);
        }
        if server.is_excluded_user(user_id) {
            return Err(CreateClientError::UserExcluded(user_id.to_string()));
        }

        let stored = self
            .store
            .get_irc_client_config(user_id, server.domain())
            .await?;
        let config_is_new = stored.is_none();
        let config = stored.unwrap_or_else(|| {
            IrcClientConfig::new(Some(user_id.to_string()), server.domain().to_string())
        });

        // the store read suspended us; someone may have won the race
        if let Some(client) = self.get_bridged_client_by_user_id(server, user_id) {
            return Ok(client);
        }

        if config_is_new {
            self.store.store_irc_client_config(&config).await?;
        }

        let client = self.create_irc_client(server, config, Some(user_id.to_string()), display_name, false);
        match client.connect().await {
            Ok(()) => Ok(client),
            Err(e) => {
                // remove the half-created session so the next call retries
                self.remove_bridged_client(&client);
                Err(e)
            }
        }
    }

    /// Construct and register a session (without connecting it).
    pub fn create_irc_client(
        self: &Arc<Self>,
        server: &Arc<IrcServer>,
        config: IrcClientConfig,
        user_id: Option<String>,
        display_name: Option<String>,
        is_bot: bool,
    ) -> Arc<BridgedClient> {
        let client = BridgedClient::new(
            server.clone(),
            config,
            user_id.clone(),
            display_name,
            is_bot,
            self.broker.clone(),
            self.ident_generator.clone(),
            self.ipv6_generator.clone(),
            self.weak_self.clone(),
        );

        {
            let mut entry = self
                .virtual_clients
                .entry(server.domain().to_string())
                .or_default();
            // register immediately, before the connect completes, else two
            // near-simultaneous calls could spawn two clients for one user
            entry.pending.insert(client.nick(), client.clone());
            if let Some(user_id) = &user_id {
                if entry.user_ids.insert(user_id.clone(), client.clone()).is_none() {
                    entry.count += 1;
                }
            }
            if is_bot {
                entry.bot = Some(client.clone());
            }
        }
        self.update_connection_metric(server);
        self.check_client_limit(server);
        client
    }

    /// Connect the bot session, retrying forever: the bot is structurally
    /// required for centralized relay and channel tracking.
    pub async fn login_to_server(self: &Arc<Self>, server: &Arc<IrcServer>) -> Arc<BridgedClient> {
        loop {
            let mut config = IrcClientConfig::new(None, server.domain().to_string());
            config.username = Some(server.bot_username().to_string());
            config.desired_nick = Some(server.bot_nick().to_string());
            config.password = server.bot_password().map(str::to_string);

            let client = self.create_irc_client(server, config, None, None, true);
            match client.connect().await {
                Ok(()) => return client,
                Err(e) => {
                    error!(domain = %server.domain(), error = %e, "Bot failed to connect; retrying");
                    self.remove_bridged_client(&client);
                    tokio::time::sleep(BOT_LOGIN_RETRY).await;
                }
            }
        }
    }

    /// Enforce the per-server concurrent-client cap by cycling out the
    /// least-recently-active non-bot session. The explicit disconnect
    /// reason stops the reconnect path from immediately undoing this.
    fn check_client_limit(&self, server: &Arc<IrcServer>) {
        let max_clients = server.max_clients();
        if max_clients == 0 {
            return;
        }
        let oldest = {
            let Some(entry) = self.virtual_clients.get(server.domain()) else {
                return;
            };
            if entry.count <= max_clients {
                debug!(
                    domain = %server.domain(),
                    connections = entry.count,
                    "Under the client limit"
                );
                return;
            }
            entry
                .nicks
                .values()
                .filter(|c| !c.is_bot) // don't ever kick the bot off
                .min_by_key(|c| c.last_action())
                .cloned()
        };
        let Some(oldest) = oldest else {
            return;
        };
        info!(
            domain = %server.domain(),
            nick = %oldest.nick(),
            limit = max_clients,
            "Client limit exceeded: disconnecting least-recently-active client"
        );
        self.remove_bridged_client(&oldest);
        oldest.disconnect(
            DisconnectReason::LimitReached,
            format!("Client limit exceeded: {max_clients}"),
            true,
        );
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn get_bridged_client_by_user_id(
        &self,
        server: &Arc<IrcServer>,
        user_id: &str,
    ) -> Option<Arc<BridgedClient>> {
        let entry = self.virtual_clients.get(server.domain())?;
        let client = entry.user_ids.get(user_id)?;
        (!client.is_dead()).then(|| client.clone())
    }

    pub fn get_bridged_client_by_nick(
        &self,
        server: &Arc<IrcServer>,
        nick: &str,
    ) -> Option<Arc<BridgedClient>> {
        let entry = self.virtual_clients.get(server.domain())?;
        if let Some(bot) = &entry.bot
            && bot.nick() == nick
            && !bot.is_dead()
        {
            return Some(bot.clone());
        }
        let client = entry.nicks.get(nick)?;
        (!client.is_dead()).then(|| client.clone())
    }

    pub fn get_bot(&self, server: &Arc<IrcServer>) -> Option<Arc<BridgedClient>> {
        self.virtual_clients.get(server.domain())?.bot.clone()
    }

    /// Whether a nick belongs to one of our own sessions, including ones
    /// still connecting (the network hasn't confirmed their nick yet).
    pub fn nick_is_virtual(&self, server: &Arc<IrcServer>, nick: &str) -> bool {
        if self.get_bridged_client_by_nick(server, nick).is_some() {
            return true;
        }
        self.virtual_clients
            .get(server.domain())
            .is_some_and(|entry| entry.pending.contains_key(nick))
    }

    pub fn get_bridged_clients_for_user_id(&self, user_id: &str) -> Vec<Arc<BridgedClient>> {
        self.virtual_clients
            .iter()
            .filter_map(|entry| entry.user_ids.get(user_id).cloned())
            .filter(|c| !c.is_dead())
            .collect()
    }

    /// Administrative inspection: all clients whose userId matches.
    pub fn get_bridged_clients_for_regex(
        &self,
        pattern: &str,
    ) -> Result<HashMap<String, Vec<Arc<BridgedClient>>>, regex::Error> {
        let regex = Regex::new(pattern)?;
        let mut result: HashMap<String, Vec<Arc<BridgedClient>>> = HashMap::new();
        for entry in self.virtual_clients.iter() {
            for (user_id, client) in &entry.user_ids {
                if regex.is_match(user_id) {
                    result.entry(user_id.clone()).or_default().push(client.clone());
                }
            }
        }
        Ok(result)
    }

    pub fn connection_count(&self, domain: &str) -> usize {
        self.virtual_clients.get(domain).map_or(0, |e| e.count)
    }

    pub fn total_connections(&self) -> usize {
        self.virtual_clients.iter().map(|e| e.count).sum()
    }

    pub fn total_reconnects_waiting(&self, domain: &str) -> usize {
        self.reconnect_queues
            .get(domain)
            .map_or(0, |q| q.waiting_items())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Kill every session on every server (shutdown path).
    pub fn kill_all_clients(&self) {
        let mut seen = std::collections::HashSet::new();
        let mut clients = Vec::new();
        for entry in self.virtual_clients.iter() {
            for client in entry
                .nicks
                .values()
                .chain(entry.user_ids.values())
                .chain(entry.bot.iter())
            {
                if seen.insert(client.id) {
                    clients.push(client.clone());
                }
            }
        }
        info!(count = clients.len(), "Killing all clients");
        for client in clients {
            client.kill(Some("Bridge shutting down".into()));
        }
    }

    /// Kill sessions idle for longer than `idle_for`. Returns how many
    /// were reaped. Debug surface; the bot is never reaped.
    pub fn reap_idle_clients(&self, domain: &str, idle_for: Duration) -> usize {
        let candidates: Vec<Arc<BridgedClient>> = match self.virtual_clients.get(domain) {
            Some(entry) => entry
                .user_ids
                .values()
                .filter(|c| !c.is_bot && c.last_action().elapsed() > idle_for)
                .cloned()
                .collect(),
            None => return 0,
        };
        for client in &candidates {
            info!(client = %client, "Reaping idle client");
            client.disconnect(DisconnectReason::Idle, "Reaped by administrator", true);
        }
        candidates.len()
    }

    fn remove_bridged_client(&self, client: &Arc<BridgedClient>) {
        let Some(mut entry) = self.virtual_clients.get_mut(client.server.domain()) else {
            return;
        };
        let nick = client.nick();
        // only remove entries that still point at this instance; a
        // replacement session may already occupy the same keys
        if entry.nicks.get(&nick).is_some_and(|c| c.id == client.id) {
            entry.nicks.remove(&nick);
        }
        if entry.pending.get(&nick).is_some_and(|c| c.id == client.id) {
            entry.pending.remove(&nick);
        }
        if let Some(user_id) = &client.user_id
            && entry
                .user_ids
                .get(user_id)
                .is_some_and(|c| c.id == client.id)
        {
            entry.user_ids.remove(user_id);
            entry.count = entry.count.saturating_sub(1);
        }
        if entry.bot.as_ref().is_some_and(|c| c.id == client.id) {
            entry.bot = None;
        }
    }

    // ========================================================================
    // Session observer callbacks
    // ========================================================================

    /// The session registered with the network; swap the pending nick for
    /// whatever the network actually assigned.
    pub(crate) fn on_client_connected(&self, client: &Arc<BridgedClient>, desired_nick: &str) {
        let actual = client.nick();
        {
            let mut entry = self
                .virtual_clients
                .entry(client.server.domain().to_string())
                .or_default();
            entry.pending.remove(desired_nick);
            entry.nicks.insert(actual.clone(), client.clone());
        }
        if desired_nick != actual {
            debug!(
                desired = %desired_nick,
                actual = %actual,
                "Connected with a different nick than desired"
            );
        }
        self.update_connection_metric(&client.server);
    }

    pub(crate) fn on_nick_change(&self, client: &Arc<BridgedClient>, old: &str, new: &str) {
        if let Some(mut entry) = self.virtual_clients.get_mut(client.server.domain()) {
            entry.nicks.remove(old);
            entry.nicks.insert(new.to_string(), client.clone());
        }
    }

    pub(crate) fn add_pending_nick(
        &self,
        server: &Arc<IrcServer>,
        nick: &str,
        client: &Arc<BridgedClient>,
    ) {
        self.virtual_clients
            .entry(server.domain().to_string())
            .or_default()
            .pending
            .insert(nick.to_string(), client.clone());
    }

    pub(crate) fn remove_pending_nick(&self, server: &Arc<IrcServer>, nick: &str) {
        if let Some(mut entry) = self.virtual_clients.get_mut(server.domain()) {
            entry.pending.remove(nick);
        }
    }

    pub(crate) async fn on_join_error(
        &self,
        client: &Arc<BridgedClient>,
        channel: &str,
        code: &str,
    ) {
        if !KICKABLE_JOIN_ERRORS.contains(&code) {
            return;
        }
        if client.user_id.is_none() || client.is_bot {
            return; // the bot itself can get these join errors
        }
        self.sink
            .on_join_error(client, channel.to_string(), code.to_string())
            .await;
    }

    /// The disconnect fan-in: registry cleanup, then the reconnect
    /// decision.
    pub(crate) async fn on_client_disconnected(self: &Arc<Self>, client: &Arc<BridgedClient>) {
        self.remove_bridged_client(client);
        self.update_connection_metric(&client.server);

        if client.disconnect_reason() == Some(DisconnectReason::Banned) {
            warn!(client = %client, "Client was banned from the network");
        }
        if client.explicit_disconnect() || client.status() == ClientStatus::Killed {
            // client cycling, idle timeouts, admin kills: stay down
            return;
        }

        if client.is_bot {
            // the bot must exist; log back in from scratch
            let pool = self.clone();
            let server = client.server.clone();
            tokio::spawn(async move {
                pool.login_to_server(&server).await;
            });
            return;
        }
        let Some(user_id) = client.user_id.clone() else {
            return;
        };

        // Reconnect this user. Re-read the config from the store so
        // concurrent nick/password changes win, but reconnect with the
        // *same* nick the network last knew.
        let mut config = match self
            .store
            .get_irc_client_config(&user_id, client.server.domain())
            .await
        {
            Ok(Some(config)) => config,
            Ok(None) => client.config_snapshot(),
            Err(e) => {
                warn!(client = %client, error = %e, "Could not re-read config; using cached");
                client.config_snapshot()
            }
        };
        config.desired_nick = Some(client.nick());

        let channels = client.chan_list();
        if channels.is_empty() {
            info!(client = %client, "Dropping client: not joined to any channels");
            return;
        }

        let replacement = self.create_irc_client(
            &client.server,
            config,
            Some(user_id),
            client.display_name.clone(),
            false,
        );
        let item = ReconnectionItem {
            client: replacement.clone(),
            channels,
        };

        match self.get_or_create_reconnect_queue(&client.server) {
            Some(queue) => {
                metrics::reconnect_queue_size(client.server.domain(), queue.waiting_items());
                let enqueued = queue.enqueue(replacement.id.to_string(), item, None);
                tokio::spawn(async move {
                    if let Err(e) = enqueued.await {
                        error!(error = %e, "Reconnect queue rejected client");
                    }
                });
            }
            None => {
                tokio::spawn(async move {
                    Self::reconnect_client(item).await;
                });
            }
        }
    }

    fn get_or_create_reconnect_queue(
        &self,
        server: &Arc<IrcServer>,
    ) -> Option<Arc<QueuePool<ReconnectionItem, ()>>> {
        let limit = server.concurrent_reconnect_limit();
        if limit == 0 {
            return None;
        }
        Some(
            self.reconnect_queues
                .entry(server.domain().to_string())
                .or_insert_with(|| {
                    Arc::new(QueuePool::new(limit, |item: ReconnectionItem| async move {
                        Self::reconnect_client(item).await;
                        Ok(())
                    }))
                })
                .clone(),
        )
    }

    async fn reconnect_client(item: ReconnectionItem) {
        if let Err(e) = item.client.reconnect(&item.channels).await {
            error!(client = %item.client, error = %e, "Failed to reconnect client");
        }
    }

    fn update_connection_metric(&self, server: &Arc<IrcServer>) {
        metrics::connected_clients(server.domain(), self.connection_count(server.domain()));
    }
}

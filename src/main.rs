//! mxircd - the Matrix-IRC bridge connection daemon.

use async_trait::async_trait;
use mxircd::config::Config;
use mxircd::db::{DataStore, SqliteStore};
use mxircd::irc::events::{IrcAction, IrcUser, JoinKind, PartKind};
use mxircd::irc::{BridgedClient, ClientPool, EventSink, IrcServer, ident_listener, scheduler};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Pause between channel joins at startup so a long tracked-channel list
/// doesn't read as a join flood.
const BATCH_JOIN_STAGGER: Duration = Duration::from_millis(500);

/// Stand-in for the Matrix-side handler: everything the broker relays is
/// logged. A deployment replaces this with the homeserver bindings.
struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn on_message(
        &self,
        server: &IrcServer,
        from: IrcUser,
        channel: String,
        action: IrcAction,
    ) {
        info!(
            domain = %server.domain(),
            from = %from.nick,
            channel = %channel,
            kind = ?action.kind,
            "IRC message: {}",
            action.text
        );
    }

    async fn on_private_message(
        &self,
        server: &IrcServer,
        from: IrcUser,
        to: IrcUser,
        action: IrcAction,
    ) {
        info!(
            domain = %server.domain(),
            from = %from.nick,
            to = %to.nick,
            "IRC private message: {}",
            action.text
        );
    }

    async fn on_join(&self, server: &IrcServer, user: IrcUser, channel: String, kind: JoinKind) {
        info!(
            domain = %server.domain(),
            nick = %user.nick,
            channel = %channel,
            kind = ?kind,
            "IRC join"
        );
    }

    async fn on_part(
        &self,
        server: &IrcServer,
        user: IrcUser,
        channel: String,
        kind: PartKind,
        reason: Option<String>,
    ) {
        info!(
            domain = %server.domain(),
            nick = %user.nick,
            channel = %channel,
            kind = ?kind,
            reason = reason.as_deref().unwrap_or(""),
            "IRC part"
        );
    }

    async fn on_metadata(&self, client: &BridgedClient, text: String, force: bool) {
        info!(client = %client, force, "{text}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    info!(
        homeserver = %config.bridge.homeserver_domain,
        networks = config.servers.len(),
        "Starting mxircd"
    );

    let store = Arc::new(SqliteStore::open(&config.database.path).await?);

    let servers = config
        .servers
        .iter()
        .map(|server_config| IrcServer::new(server_config.clone(), &config.bridge.homeserver_domain))
        .collect::<Result<Vec<_>, _>>()?;

    let pool = ClientPool::new(servers.clone(), store.clone(), Arc::new(LogSink));

    if config.ident.enabled {
        let address = config.ident.address.clone();
        tokio::spawn(async move {
            if let Err(e) = ident_listener::run(&address).await {
                error!(error = %e, "Ident responder failed");
            }
        });
    }

    if let Some(port) = config.bridge.http_port {
        let pool = pool.clone();
        tokio::spawn(mxircd::http::run_http_server(port, pool));
    }

    // Bring up the bot on each network and rejoin tracked channels.
    for server in &servers {
        if !server.is_bot_enabled() {
            info!(domain = %server.domain(), "Bot disabled; per-user clients will claim events");
            continue;
        }
        let bot = pool.login_to_server(server).await;
        let channels = store.get_tracked_channels(server.domain()).await?;
        info!(
            domain = %server.domain(),
            channels = channels.len(),
            "Joining tracked channels"
        );
        for channel in channels {
            // a failed join must not take its siblings down with it
            if let Err(e) = bot.join_channel(&channel, None).await {
                error!(domain = %server.domain(), channel = %channel, error = %e, "Failed to join");
            }
            tokio::time::sleep(BATCH_JOIN_STAGGER).await;
        }
    }

    info!("Bridge is up");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    scheduler::kill_all();
    pool.kill_all_clients();
    Ok(())
}

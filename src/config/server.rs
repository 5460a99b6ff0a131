//! Per-IRC-network configuration.

use serde::Deserialize;
use std::collections::HashMap;

/// One bridged IRC network.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Primary domain of the network (also the registry key).
    pub domain: String,
    /// Extra addresses to spread connections over (round-robin pick).
    #[serde(default)]
    pub additional_addresses: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    /// PEM bundle with an extra trust root, for networks with private CAs.
    #[serde(default)]
    pub tls_ca_file: Option<String>,
    /// Authenticate stored passwords over SASL PLAIN instead of PASS.
    #[serde(default)]
    pub sasl: bool,
    /// Network-wide connection password.
    #[serde(default)]
    pub password: Option<String>,
    /// Template for virtual user nicks. Substitutes `$LOCALPART`,
    /// `$USERID` and `$DISPLAY`.
    #[serde(default = "default_nick_template")]
    pub nick_template: String,
    /// Whether users may change nicks with the !nick command surface.
    #[serde(default = "default_true")]
    pub allow_nick_changes: bool,
    /// Maximum concurrent client connections. 0 = unlimited. When the
    /// limit is reached the least-recently-active client is cycled out.
    #[serde(default)]
    pub max_clients: usize,
    /// Disconnect clients idle for this long. 0 = never. Ignored for the
    /// bot and for networks that mirror membership.
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// When > 0, connection attempts to this network are spaced out at
    /// this interval instead of fired immediately.
    #[serde(default)]
    pub reconnect_interval_ms: u64,
    /// How many clients may reconnect concurrently after drops.
    /// 0 disables the queue and reconnects are immediate.
    #[serde(default)]
    pub concurrent_reconnect_limit: usize,
    /// Keep clients joined even when idle (membership mirroring).
    #[serde(default)]
    pub mirror_membership: bool,
    /// Send connection status notices to users via the event sink.
    #[serde(default = "default_true")]
    pub connection_notices: bool,
    /// User modes set after connecting, without the leading `+`.
    #[serde(default)]
    pub user_modes: String,
    /// Matrix user ids (regexes) that must never get a client.
    #[serde(default)]
    pub exclude_users: Vec<String>,
    /// Channels the bridge must not track or join.
    #[serde(default)]
    pub excluded_channels: Vec<String>,
    /// Keys for invite-only/keyed channels the bridge should join.
    #[serde(default)]
    pub channel_keys: HashMap<String, String>,
    /// Drop outbound messages older than this by the time the client is
    /// actually joined and ready to send. 0 = never drop.
    #[serde(default)]
    pub message_expiry_secs: u64,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub ident: IdentConfig,
    #[serde(default)]
    pub ipv6: Ipv6Config,
    #[serde(default)]
    pub quit_debounce: QuitDebounceConfig,
    #[serde(default)]
    pub ping: PingConfig,
}

/// The network-wide bot session.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// When the bot is enabled it is the single relay for channel traffic;
    /// when disabled, per-user clients claim events instead.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bot_nick")]
    pub nick: String,
    #[serde(default = "default_bot_username")]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            nick: default_bot_nick(),
            username: default_bot_username(),
            password: None,
        }
    }
}

/// How the USER realname field is derived from the Matrix user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RealnameFormat {
    Mxid,
    ReverseMxid,
}

/// Ident (USER username field) assignment policy.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentConfig {
    #[serde(default = "default_realname_format")]
    pub realname_format: RealnameFormat,
    /// Cap on generated usernames. The collision suffix search space
    /// shrinks with this, so very small values can exhaust.
    #[serde(default = "default_max_username_length")]
    pub max_username_length: usize,
}

impl Default for IdentConfig {
    fn default() -> Self {
        Self {
            realname_format: default_realname_format(),
            max_username_length: default_max_username_length(),
        }
    }
}

/// Per-user IPv6 source addresses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ipv6Config {
    /// Address block to allocate from, e.g. "2001:db8:42::". Clients get
    /// sequential addresses inside the block and bind to them when
    /// connecting.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Resolve and connect over IPv6 even without a prefix.
    #[serde(default)]
    pub only: bool,
}

/// Net-split QUIT suppression.
#[derive(Debug, Clone, Deserialize)]
pub struct QuitDebounceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// QUIT rate above which a net-split is assumed.
    #[serde(default = "default_quits_per_second")]
    pub quits_per_second: usize,
    /// Bounds for the random per-user delay before a debounced QUIT is
    /// relayed as a leave (cancelled if the user rejoins first).
    #[serde(default = "default_delay_min_ms")]
    pub delay_min_ms: u64,
    #[serde(default = "default_delay_max_ms")]
    pub delay_max_ms: u64,
}

impl Default for QuitDebounceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            quits_per_second: default_quits_per_second(),
            delay_min_ms: default_delay_min_ms(),
            delay_max_ms: default_delay_max_ms(),
        }
    }
}

/// Client-side ping keepalive.
#[derive(Debug, Clone, Deserialize)]
pub struct PingConfig {
    /// Send `PING LAG<ts>` after this much outbound silence.
    #[serde(default = "default_ping_rate_secs")]
    pub rate_secs: u64,
    /// Knife the connection when the server has been quiet this long.
    /// Servers ping infrequently (2-3 min), so leave room for a couple of
    /// lapses before giving up.
    #[serde(default = "default_ping_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            rate_secs: default_ping_rate_secs(),
            timeout_secs: default_ping_timeout_secs(),
        }
    }
}

fn default_port() -> u16 {
    6667
}

fn default_true() -> bool {
    true
}

fn default_nick_template() -> String {
    "$DISPLAY[m]".to_string()
}

fn default_bot_nick() -> String {
    "MatrixBridge".to_string()
}

fn default_bot_username() -> String {
    "matrixbridge".to_string()
}

fn default_realname_format() -> RealnameFormat {
    RealnameFormat::Mxid
}

fn default_max_username_length() -> usize {
    10
}

fn default_quits_per_second() -> usize {
    5
}

fn default_delay_min_ms() -> u64 {
    3_600_000
}

fn default_delay_max_ms() -> u64 {
    7_200_000
}

fn default_ping_rate_secs() -> u64 {
    60
}

fn default_ping_timeout_secs() -> u64 {
    600
}

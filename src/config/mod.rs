//! Configuration loading and management.
//!
//! Split into logical submodules:
//! - [`server`]: per-IRC-network configuration blocks (`[[servers]]`)
//!
//! The top-level [`Config`] covers bridge identity, persistence and the
//! optional ident responder.

mod server;

pub use server::{
    BotConfig, IdentConfig, Ipv6Config, PingConfig, QuitDebounceConfig, RealnameFormat,
    ServerConfig,
};

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid regex in config: {0}")]
    Regex(#[from] regex::Error),
}

/// Bridge configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bridge identity and shared knobs.
    pub bridge: BridgeConfig,
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// RFC 1413 ident responder.
    #[serde(default)]
    pub ident: IdentListenerConfig,
    /// IRC networks to bridge.
    #[serde(default, rename = "servers")]
    pub servers: Vec<ServerConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Bridge identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Domain of the homeserver whose users are bridged. Used for nick
    /// and ident derivation and the CTCP VERSION reply.
    pub homeserver_domain: String,
    /// Port for the metrics + debug HTTP surface. Disabled when absent.
    pub http_port: Option<u16>,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path, or ":memory:".
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "mxircd.db".to_string()
}

/// Ident (RFC 1413) responder configuration.
///
/// IRC networks commonly look up the ident of connecting clients; answering
/// with the generated per-user username lets them distinguish bridge users
/// sharing one host.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentListenerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Listen address, conventionally port 113.
    #[serde(default = "default_ident_address")]
    pub address: String,
}

impl Default for IdentListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_ident_address(),
        }
    }
}

fn default_ident_address() -> String {
    "0.0.0.0:113".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let config: Config = toml::from_str(
            r#"
            [bridge]
            homeserver_domain = "example.org"

            [[servers]]
            domain = "irc.example.net"
            "#,
        )
        .unwrap();
        assert_eq!(config.bridge.homeserver_domain, "example.org");
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].domain, "irc.example.net");
        assert_eq!(config.servers[0].port, 6667);
        assert!(!config.ident.enabled);
        assert_eq!(config.database.path, "mxircd.db");
    }

    #[test]
    fn parses_server_block() {
        let config: Config = toml::from_str(
            r#"
            [bridge]
            homeserver_domain = "example.org"
            http_port = 7001

            [[servers]]
            domain = "irc.example.net"
            port = 6697
            tls = true
            max_clients = 30
            idle_timeout_secs = 600
            concurrent_reconnect_limit = 8
            exclude_users = ["@bad-.*:example.org"]

            [servers.bot]
            nick = "GatewayBot"

            [servers.ipv6]
            prefix = "2001:db8:42::"

            [servers.quit_debounce]
            enabled = true
            quits_per_second = 3
            "#,
        )
        .unwrap();
        let server = &config.servers[0];
        assert!(server.tls);
        assert_eq!(server.max_clients, 30);
        assert_eq!(server.bot.nick, "GatewayBot");
        assert_eq!(server.ipv6.prefix.as_deref(), Some("2001:db8:42::"));
        assert!(server.quit_debounce.enabled);
        assert_eq!(server.quit_debounce.quits_per_second, 3);
    }
}

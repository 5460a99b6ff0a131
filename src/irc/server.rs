//! Per-network façade over [`ServerConfig`].
//!
//! One `IrcServer` exists per bridged network and is shared by every
//! session on it. It owns the derived bits the raw config can't express:
//! compiled exclusion regexes and nick template expansion.

use crate::config::{ConfigError, RealnameFormat, ServerConfig};
use rand::Rng;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

pub struct IrcServer {
    config: ServerConfig,
    homeserver_domain: String,
    exclude_users: Vec<Regex>,
}

impl std::fmt::Debug for IrcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrcServer")
            .field("domain", &self.config.domain)
            .finish_non_exhaustive()
    }
}

impl IrcServer {
    pub fn new(config: ServerConfig, homeserver_domain: &str) -> Result<Arc<Self>, ConfigError> {
        let exclude_users = config
            .exclude_users
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(Self {
            config,
            homeserver_domain: homeserver_domain.to_string(),
            exclude_users,
        }))
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    pub fn homeserver_domain(&self) -> &str {
        &self.homeserver_domain
    }

    /// Pick an address to connect to, spreading load over the configured
    /// alternatives.
    pub fn random_address(&self) -> (String, u16) {
        let mut pool = Vec::with_capacity(1 + self.config.additional_addresses.len());
        pool.push(self.config.domain.clone());
        pool.extend(self.config.additional_addresses.iter().cloned());
        let pick = rand::thread_rng().gen_range(0..pool.len());
        (pool.swap_remove(pick), self.config.port)
    }

    pub fn use_tls(&self) -> bool {
        self.config.tls
    }

    pub fn tls_ca_file(&self) -> Option<&str> {
        self.config.tls_ca_file.as_deref()
    }

    pub fn use_sasl(&self) -> bool {
        self.config.sasl
    }

    pub fn password(&self) -> Option<&str> {
        self.config.password.as_deref()
    }

    pub fn allows_nick_changes(&self) -> bool {
        self.config.allow_nick_changes
    }

    /// Maximum concurrent clients, 0 = unlimited.
    pub fn max_clients(&self) -> usize {
        self.config.max_clients
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.config.idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.config.idle_timeout_secs))
    }

    pub fn reconnect_interval(&self) -> Option<Duration> {
        (self.config.reconnect_interval_ms > 0)
            .then(|| Duration::from_millis(self.config.reconnect_interval_ms))
    }

    pub fn concurrent_reconnect_limit(&self) -> usize {
        self.config.concurrent_reconnect_limit
    }

    pub fn mirrors_membership(&self) -> bool {
        self.config.mirror_membership
    }

    pub fn sends_connection_notices(&self) -> bool {
        self.config.connection_notices
    }

    pub fn user_modes(&self) -> &str {
        &self.config.user_modes
    }

    pub fn message_expiry(&self) -> Option<Duration> {
        (self.config.message_expiry_secs > 0)
            .then(|| Duration::from_secs(self.config.message_expiry_secs))
    }

    pub fn is_bot_enabled(&self) -> bool {
        self.config.bot.enabled
    }

    pub fn bot_nick(&self) -> &str {
        &self.config.bot.nick
    }

    pub fn bot_username(&self) -> &str {
        &self.config.bot.username
    }

    pub fn bot_password(&self) -> Option<&str> {
        self.config.bot.password.as_deref()
    }

    pub fn ipv6_prefix(&self) -> Option<&str> {
        self.config.ipv6.prefix.as_deref()
    }

    pub fn ipv6_only(&self) -> bool {
        self.config.ipv6.only
    }

    pub fn realname_format(&self) -> RealnameFormat {
        self.config.ident.realname_format
    }

    pub fn max_username_length(&self) -> usize {
        self.config.ident.max_username_length
    }

    pub fn should_debounce_quits(&self) -> bool {
        self.config.quit_debounce.enabled
    }

    pub fn debounce_quits_per_second(&self) -> usize {
        self.config.quit_debounce.quits_per_second
    }

    pub fn debounce_delay_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.config.quit_debounce.delay_min_ms),
            Duration::from_millis(self.config.quit_debounce.delay_max_ms),
        )
    }

    pub fn ping_rate(&self) -> Duration {
        Duration::from_secs(self.config.ping.rate_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.config.ping.timeout_secs)
    }

    pub fn is_excluded_channel(&self, channel: &str) -> bool {
        self.config
            .excluded_channels
            .iter()
            .any(|c| c.eq_ignore_ascii_case(channel))
    }

    pub fn is_excluded_user(&self, user_id: &str) -> bool {
        self.exclude_users.iter().any(|r| r.is_match(user_id))
    }

    pub fn channel_key(&self, channel: &str) -> Option<&str> {
        self.config.channel_keys.get(channel).map(String::as_str)
    }

    /// Derive the starting nick for a Matrix user from the nick template.
    /// The result still goes through lenient nick coercion.
    pub fn nick_for_user(&self, user_id: &str, display_name: Option<&str>) -> String {
        let trimmed = user_id.strip_prefix('@').unwrap_or(user_id);
        let localpart = trimmed.split(':').next().unwrap_or(trimmed);
        let display = display_name.filter(|d| !d.is_empty()).unwrap_or(localpart);
        self.config
            .nick_template
            .replace("$USERID", trimmed)
            .replace("$LOCALPART", localpart)
            .replace("$DISPLAY", display)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_server(mutate: impl FnOnce(&mut ServerConfig)) -> Arc<IrcServer> {
        let mut config: ServerConfig = toml::from_str(r#"domain = "irc.example.net""#).unwrap();
        mutate(&mut config);
        IrcServer::new(config, "example.org").unwrap()
    }

    #[test]
    fn nick_template_expansion() {
        let server = make_server(|c| c.nick_template = "$DISPLAY[m]".into());
        assert_eq!(
            server.nick_for_user("@alice:example.org", Some("Alice")),
            "Alice[m]"
        );
        // display name falls back to the localpart
        assert_eq!(server.nick_for_user("@alice:example.org", None), "alice[m]");

        let server = make_server(|c| c.nick_template = "M-$LOCALPART".into());
        assert_eq!(server.nick_for_user("@bob:example.org", None), "M-bob");
    }

    #[test]
    fn excluded_users_match_by_regex() {
        let server = make_server(|c| c.exclude_users = vec!["@deactivated-.*:example\\.org".into()]);
        assert!(server.is_excluded_user("@deactivated-12:example.org"));
        assert!(!server.is_excluded_user("@alice:example.org"));
    }

    #[test]
    fn excluded_channels_are_case_insensitive() {
        let server = make_server(|c| c.excluded_channels = vec!["#secret".into()]);
        assert!(server.is_excluded_channel("#Secret"));
        assert!(!server.is_excluded_channel("#public"));
    }

    #[test]
    fn zero_knobs_read_as_disabled() {
        let server = make_server(|_| {});
        assert_eq!(server.idle_timeout(), None);
        assert_eq!(server.reconnect_interval(), None);
        assert_eq!(server.message_expiry(), None);
        assert_eq!(server.max_clients(), 0);
    }
}

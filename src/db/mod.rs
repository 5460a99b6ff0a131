//! Persistent storage for per-user IRC client state.
//!
//! The rest of the bridge consumes storage through the [`DataStore`] trait;
//! [`SqliteStore`] is the shipped implementation (async SQLite via SQLx).
//! Stored state is deliberately small: one [`IrcClientConfig`] row per
//! (Matrix user, network), the per-network IPv6 allocation counters, and
//! the channels the bridge tracks on each network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

static MEMDB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Per (Matrix user, IRC network) client settings.
///
/// Created lazily on first connection, mutated by nick/username/password
/// commands, and re-read on every reconnect so concurrent changes win.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrcClientConfig {
    /// Owning Matrix user. `None` for the network bot.
    pub user_id: Option<String>,
    /// IRC network domain this config applies to.
    pub domain: String,
    /// Assigned ident username, once generated.
    pub username: Option<String>,
    /// NickServ/SASL password, if the user stored one.
    pub password: Option<String>,
    /// The nick the user wants; the network-assigned nick may differ.
    pub desired_nick: Option<String>,
    /// Assigned source address, when the network allocates IPv6 blocks.
    pub ipv6_address: Option<String>,
}

impl IrcClientConfig {
    pub fn new(user_id: Option<String>, domain: String) -> Self {
        Self {
            user_id,
            domain,
            username: None,
            password: None,
            desired_nick: None,
            ipv6_address: None,
        }
    }
}

/// The persistence interface the connection core depends on.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get_irc_client_config(
        &self,
        user_id: &str,
        domain: &str,
    ) -> Result<Option<IrcClientConfig>, StoreError>;

    async fn store_irc_client_config(&self, config: &IrcClientConfig) -> Result<(), StoreError>;

    /// Reverse lookup for ident collision checking: who owns `username`
    /// on `domain`, if anyone.
    async fn get_matrix_user_by_username(
        &self,
        domain: &str,
        username: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn get_ipv6_counter(&self, domain: &str) -> Result<u64, StoreError>;

    async fn set_ipv6_counter(&self, domain: &str, value: u64) -> Result<(), StoreError>;

    /// Channels the bridge should (re)join on this network at startup.
    async fn get_tracked_channels(&self, domain: &str) -> Result<Vec<String>, StoreError>;
}

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connection acquire timeout - prevents connection storms from blocking indefinitely.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Open (and create if missing) the database at `path`, or a private
    /// in-memory database for ":memory:".
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let pool = if path == ":memory:" {
            // Use a uniquely named shared-cache memory database per call.
            // `file::memory:` is global-ish and will collide across
            // parallel tests.
            let id = MEMDB_COUNTER.fetch_add(1, Ordering::Relaxed);
            let memdb_uri = format!(
                "file:mxircd-memdb-{}-{}?mode=memory&cache=shared",
                std::process::id(),
                id
            );
            let options = SqliteConnectOptions::new()
                .filename(&memdb_uri)
                .shared_cache(true)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = Path::new(path).parent()
                && !parent.as_os_str().is_empty()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                tracing::warn!(path = %parent.display(), error = %e, "Failed to create database directory");
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .connect_with(options)
                .await?
        };

        info!(path = %path, "Database connected");

        // WAL mode allows reads to happen while writes are in progress
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;

        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS client_configs (
                user_id      TEXT NOT NULL,
                domain       TEXT NOT NULL,
                username     TEXT,
                password     TEXT,
                desired_nick TEXT,
                ipv6_address TEXT,
                PRIMARY KEY (user_id, domain)
            )",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_client_configs_username
             ON client_configs (domain, username)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ipv6_counters (
                domain  TEXT PRIMARY KEY,
                counter INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tracked_channels (
                domain  TEXT NOT NULL,
                channel TEXT NOT NULL,
                PRIMARY KEY (domain, channel)
            )",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Record a channel as tracked on a network.
    pub async fn track_channel(&self, domain: &str, channel: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tracked_channels (domain, channel) VALUES (?1, ?2)
             ON CONFLICT (domain, channel) DO NOTHING",
        )
        .bind(domain)
        .bind(channel)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn get_irc_client_config(
        &self,
        user_id: &str,
        domain: &str,
    ) -> Result<Option<IrcClientConfig>, StoreError> {
        let row: Option<(String, String, Option<String>, Option<String>, Option<String>, Option<String>)> =
            sqlx::query_as(
                "SELECT user_id, domain, username, password, desired_nick, ipv6_address
                 FROM client_configs WHERE user_id = ?1 AND domain = ?2",
            )
            .bind(user_id)
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(
            |(user_id, domain, username, password, desired_nick, ipv6_address)| IrcClientConfig {
                user_id: Some(user_id),
                domain,
                username,
                password,
                desired_nick,
                ipv6_address,
            },
        ))
    }

    async fn store_irc_client_config(&self, config: &IrcClientConfig) -> Result<(), StoreError> {
        let user_id = config
            .user_id
            .as_deref()
            .ok_or_else(|| StoreError::Internal("refusing to persist a bot client config".into()))?;
        sqlx::query(
            "INSERT INTO client_configs
                (user_id, domain, username, password, desired_nick, ipv6_address)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (user_id, domain) DO UPDATE SET
                username = excluded.username,
                password = excluded.password,
                desired_nick = excluded.desired_nick,
                ipv6_address = excluded.ipv6_address",
        )
        .bind(user_id)
        .bind(&config.domain)
        .bind(&config.username)
        .bind(&config.password)
        .bind(&config.desired_nick)
        .bind(&config.ipv6_address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_matrix_user_by_username(
        &self,
        domain: &str,
        username: &str,
    ) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT user_id FROM client_configs WHERE domain = ?1 AND username = ?2",
        )
        .bind(domain)
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(user_id,)| user_id))
    }

    async fn get_ipv6_counter(&self, domain: &str) -> Result<u64, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT counter FROM ipv6_counters WHERE domain = ?1")
                .bind(domain)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(counter,)| counter as u64).unwrap_or(0))
    }

    async fn set_ipv6_counter(&self, domain: &str, value: u64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ipv6_counters (domain, counter) VALUES (?1, ?2)
             ON CONFLICT (domain) DO UPDATE SET counter = excluded.counter",
        )
        .bind(domain)
        .bind(value as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_tracked_channels(&self, domain: &str) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT channel FROM tracked_channels WHERE domain = ?1")
                .bind(domain)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(channel,)| channel).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_config_round_trip() {
        let store = SqliteStore::open(":memory:").await.unwrap();

        let mut config = IrcClientConfig::new(Some("@alice:example.org".into()), "irc.example.net".into());
        config.username = Some("alice".into());
        config.desired_nick = Some("alice[m]".into());
        store.store_irc_client_config(&config).await.unwrap();

        let loaded = store
            .get_irc_client_config("@alice:example.org", "irc.example.net")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, config);

        // updates overwrite
        config.ipv6_address = Some("2001:db8:42::1".into());
        store.store_irc_client_config(&config).await.unwrap();
        let loaded = store
            .get_irc_client_config("@alice:example.org", "irc.example.net")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.ipv6_address.as_deref(), Some("2001:db8:42::1"));
    }

    #[tokio::test]
    async fn username_reverse_lookup() {
        let store = SqliteStore::open(":memory:").await.unwrap();
        let mut config = IrcClientConfig::new(Some("@bob:example.org".into()), "irc.example.net".into());
        config.username = Some("bob".into());
        store.store_irc_client_config(&config).await.unwrap();

        assert_eq!(
            store
                .get_matrix_user_by_username("irc.example.net", "bob")
                .await
                .unwrap()
                .as_deref(),
            Some("@bob:example.org")
        );
        assert!(
            store
                .get_matrix_user_by_username("irc.example.net", "nobody")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn ipv6_counter_defaults_to_zero() {
        let store = SqliteStore::open(":memory:").await.unwrap();
        assert_eq!(store.get_ipv6_counter("irc.example.net").await.unwrap(), 0);
        store.set_ipv6_counter("irc.example.net", 41).await.unwrap();
        assert_eq!(store.get_ipv6_counter("irc.example.net").await.unwrap(), 41);
    }

    #[tokio::test]
    async fn tracked_channels_dedupe() {
        let store = SqliteStore::open(":memory:").await.unwrap();
        store.track_channel("irc.example.net", "#a").await.unwrap();
        store.track_channel("irc.example.net", "#a").await.unwrap();
        store.track_channel("irc.example.net", "#b").await.unwrap();
        let mut channels = store.get_tracked_channels("irc.example.net").await.unwrap();
        channels.sort();
        assert_eq!(channels, vec!["#a", "#b"]);
    }
}

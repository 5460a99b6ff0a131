//! Ident username assignment.
//!
//! Usernames are scarce: they are capped to a handful of characters and
//! must be unique per network so ident lookups and bans land on the right
//! Matrix user. Generation requests are pushed through a keyed queue -
//! without it, two near-simultaneous connections for clashing user ids
//! could both pass the store check and be handed the same username.

use crate::db::{DataStore, IrcClientConfig};
use crate::error::IdentError;
use crate::irc::nick::{sanitise_realname, sanitise_username};
use crate::irc::server::IrcServer;
use crate::util::{Queue, QueueError};
use crate::config::RealnameFormat;
use std::sync::Arc;
use tracing::{debug, info};

/// The max length of <realname> in USER commands.
pub const MAX_REAL_NAME_LENGTH: usize = 48;

/// What a connection sends in its USER command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcNames {
    pub username: String,
    pub realname: String,
}

struct GenerationRequest {
    user_id: String,
    domain: String,
    max_username_length: usize,
}

pub struct IdentGenerator {
    store: Arc<dyn DataStore>,
    queue: Queue<GenerationRequest, String>,
}

impl IdentGenerator {
    pub fn new(store: Arc<dyn DataStore>) -> Arc<Self> {
        let queue_store = store.clone();
        let queue = Queue::new(move |request: GenerationRequest| {
            let store = queue_store.clone();
            async move { process(store, request).await }
        });
        Arc::new(Self { store, queue })
    }

    /// Number of generation requests pending or in flight.
    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    /// Resolve the username and realname for a connection. Cached
    /// usernames are returned without touching the queue; missing ones are
    /// generated, persisted, and written into `config`.
    pub async fn get_irc_names(
        &self,
        config: &mut IrcClientConfig,
        server: &IrcServer,
        user_id: Option<&str>,
    ) -> Result<IrcNames, IdentError> {
        let max_len = server.max_username_length();
        let realname_source = match user_id {
            Some(user_id) => format_realname(user_id, server.realname_format()),
            None => config.username.clone().unwrap_or_default(),
        };
        let mut realname = sanitise_realname(&realname_source);
        realname.truncate(MAX_REAL_NAME_LENGTH);

        let cached = config.username.clone();
        let username = match (user_id, cached) {
            (Some(user_id), Some(username)) => {
                debug!(username, user_id, domain = %config.domain, "Using cached ident username");
                let mut sanitised = sanitise_username(&username);
                sanitised.truncate(max_len);
                sanitised
            }
            (Some(user_id), None) => {
                debug!(user_id, domain = %config.domain, "Queueing username generation");
                let generated = self
                    .queue
                    .enqueue(
                        user_id.to_string(),
                        GenerationRequest {
                            user_id: user_id.to_string(),
                            domain: config.domain.clone(),
                            max_username_length: max_len,
                        },
                    )
                    .await
                    .map_err(unwrap_queue_error)?;
                config.username = Some(generated.clone());
                generated
            }
            // the bot has no Matrix user; its username comes from config
            (None, Some(username)) => sanitise_username(&username),
            (None, None) => sanitise_username(server.bot_username()),
        };

        Ok(IrcNames { username, realname })
    }
}

/// Pull a typed [`IdentError`] back out of the queue's error wrapper.
fn unwrap_queue_error(err: QueueError) -> IdentError {
    match err.task_error() {
        Some(task_err) => match task_err.downcast_ref::<IdentError>() {
            Some(IdentError::Exhausted(name)) => IdentError::Exhausted(name.clone()),
            _ => IdentError::Queue(task_err.to_string()),
        },
        None => IdentError::Queue(err.to_string()),
    }
}

/// The critical section: generate, persist, release.
async fn process(
    store: Arc<dyn DataStore>,
    request: GenerationRequest,
) -> anyhow::Result<String> {
    let username = generate_username(&store, &request).await?;
    let mut config = store
        .get_irc_client_config(&request.user_id, &request.domain)
        .await
        .map_err(IdentError::Store)?
        .unwrap_or_else(|| {
            IrcClientConfig::new(Some(request.user_id.clone()), request.domain.clone())
        });
    config.username = Some(username.clone());
    // persist before releasing the queue slot, so the next request's
    // collision check sees this allocation
    store
        .store_irc_client_config(&config)
        .await
        .map_err(IdentError::Store)?;
    Ok(username)
}

async fn generate_username(
    store: &Arc<dyn DataStore>,
    request: &GenerationRequest,
) -> Result<String, IdentError> {
    // @foobar££stuff:domain.com => foobarstuffdomaincom
    let stripped = request.user_id.strip_prefix('@').unwrap_or(&request.user_id);
    let mut username = sanitise_username(stripped);
    if username.len() < request.max_username_length {
        return Ok(username);
    }
    username.truncate(request.max_username_length);

    /* LONGNAM~1 ing algorithm:
     * foobar => foob_1 => foob_2 => ... => foob_9 => foo_10 => foo_11 =>
     * ... => f_9999 => FAIL.
     */
    loop {
        let owner = store
            .get_matrix_user_by_username(&request.domain, &username)
            .await?;
        match owner {
            Some(owner) if owner != request.user_id => {
                if !next_candidate(&mut username) {
                    return Err(IdentError::Exhausted(username));
                }
            }
            Some(_) => {
                info!(
                    username,
                    user_id = %request.user_id,
                    domain = %request.domain,
                    "Returning stored ident username"
                );
                return Ok(username);
            }
            None => {
                info!(
                    username,
                    user_id = %request.user_id,
                    domain = %request.domain,
                    "Generated ident username"
                );
                return Ok(username);
            }
        }
    }
}

/// Advance to the next collision-avoidance candidate, keeping total length
/// constant by shrinking the prefix as the suffix gains digits. Returns
/// false when the prefix is gone and the search space is spent.
fn next_candidate(username: &mut String) -> bool {
    const DELIM: char = '_';
    match username.split_once(DELIM) {
        None => {
            let keep = username.len().saturating_sub(2);
            username.truncate(keep);
            username.push(DELIM);
            username.push('1');
            !username.starts_with(DELIM)
        }
        Some((head, digits)) => {
            let old_len = digits.len();
            let next: u64 = match digits.parse::<u64>() {
                Ok(n) => n + 1,
                Err(_) => return false,
            };
            let next_str = next.to_string();
            let head = if next_str.len() > old_len {
                &head[..head.len().saturating_sub(1)]
            } else {
                head
            };
            *username = format!("{head}{DELIM}{next_str}");
            !username.starts_with(DELIM)
        }
    }
}

fn format_realname(user_id: &str, format: RealnameFormat) -> String {
    match format {
        RealnameFormat::Mxid => user_id.to_string(),
        RealnameFormat::ReverseMxid => {
            let stripped = user_id.strip_prefix('@').unwrap_or(user_id);
            match stripped.split_once(':') {
                Some((localpart, domain)) => {
                    let reversed: Vec<&str> = domain.split('.').rev().collect();
                    format!("{}:{localpart}", reversed.join("."))
                }
                None => stripped.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::SqliteStore;

    fn test_server(max_username_length: usize) -> Arc<IrcServer> {
        let mut config: ServerConfig = toml::from_str(r#"domain = "localhost""#).unwrap();
        config.ident.max_username_length = max_username_length;
        IrcServer::new(config, "localhost").unwrap()
    }

    async fn occupy(store: &SqliteStore, domain: &str, username: &str, user_id: &str) {
        let mut config = IrcClientConfig::new(Some(user_id.to_string()), domain.to_string());
        config.username = Some(username.to_string());
        store.store_irc_client_config(&config).await.unwrap();
    }

    #[tokio::test]
    async fn short_user_ids_become_usernames_directly() {
        let store = Arc::new(SqliteStore::open(":memory:").await.unwrap());
        let generator = IdentGenerator::new(store.clone());
        let server = test_server(10);

        let mut config = IrcClientConfig::new(Some("@bob:x".into()), "localhost".into());
        let names = generator
            .get_irc_names(&mut config, &server, Some("@bob:x"))
            .await
            .unwrap();
        assert_eq!(names.username, "bobx");
        assert_eq!(names.realname, "@bob:x");
    }

    #[tokio::test]
    async fn truncates_to_the_configured_length() {
        let store = Arc::new(SqliteStore::open(":memory:").await.unwrap());
        let generator = IdentGenerator::new(store.clone());
        let server = test_server(8);
        let user_id = "@myreallylonguseridhere:localhost";

        let mut config = IrcClientConfig::new(Some(user_id.into()), "localhost".into());
        let names = generator
            .get_irc_names(&mut config, &server, Some(user_id))
            .await
            .unwrap();
        assert_eq!(names.username, "myreally");
        // persisted before the queue slot was released
        assert_eq!(
            store
                .get_matrix_user_by_username("localhost", "myreally")
                .await
                .unwrap()
                .as_deref(),
            Some(user_id)
        );
    }

    #[tokio::test]
    async fn suffixes_on_collision_and_shrinks_the_prefix() {
        let store = Arc::new(SqliteStore::open(":memory:").await.unwrap());
        let generator = IdentGenerator::new(store.clone());
        let server = test_server(8);
        let user_id = "@myreallylonguseridhere:localhost";

        // first claimant holds the plain truncation
        occupy(&store, "localhost", "myreally", "@other0:localhost").await;
        let mut config = IrcClientConfig::new(Some(user_id.into()), "localhost".into());
        let names = generator
            .get_irc_names(&mut config, &server, Some(user_id))
            .await
            .unwrap();
        assert_eq!(names.username, "myreal_1");

        // occupy _1.._9; the 10th allocation shrinks the prefix
        let store2 = Arc::new(SqliteStore::open(":memory:").await.unwrap());
        let generator2 = IdentGenerator::new(store2.clone());
        occupy(&store2, "localhost", "myreally", "@other0:localhost").await;
        for i in 1..=9 {
            occupy(
                &store2,
                "localhost",
                &format!("myreal_{i}"),
                &format!("@other{i}:localhost"),
            )
            .await;
        }
        let mut config = IrcClientConfig::new(Some(user_id.into()), "localhost".into());
        let names = generator2
            .get_irc_names(&mut config, &server, Some(user_id))
            .await
            .unwrap();
        assert_eq!(names.username, "myrea_10");
    }

    #[tokio::test]
    async fn exhausting_the_suffix_space_is_terminal() {
        let store = Arc::new(SqliteStore::open(":memory:").await.unwrap());
        let generator = IdentGenerator::new(store.clone());
        let server = test_server(3);
        let user_id = "@abcdef:localhost";

        occupy(&store, "localhost", "abc", "@other0:localhost").await;
        for i in 1..=9 {
            occupy(
                &store,
                "localhost",
                &format!("a_{i}"),
                &format!("@other{i}:localhost"),
            )
            .await;
        }

        let mut config = IrcClientConfig::new(Some(user_id.into()), "localhost".into());
        let err = generator
            .get_irc_names(&mut config, &server, Some(user_id))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentError::Exhausted(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_user_run_once() {
        let store = Arc::new(SqliteStore::open(":memory:").await.unwrap());
        let generator = IdentGenerator::new(store.clone());
        let server = test_server(8);
        let user_id = "@myreallylonguseridhere:localhost";

        let mut config_a = IrcClientConfig::new(Some(user_id.into()), "localhost".into());
        let mut config_b = IrcClientConfig::new(Some(user_id.into()), "localhost".into());
        let (a, b) = tokio::join!(
            generator.get_irc_names(&mut config_a, &server, Some(user_id)),
            generator.get_irc_names(&mut config_b, &server, Some(user_id)),
        );
        assert_eq!(a.unwrap().username, b.unwrap().username);
    }

    #[tokio::test]
    async fn bot_names_come_from_config() {
        let store = Arc::new(SqliteStore::open(":memory:").await.unwrap());
        let generator = IdentGenerator::new(store.clone());
        let server = test_server(10);

        let mut config = IrcClientConfig::new(None, "localhost".into());
        config.username = Some("BridgeBot".into());
        let names = generator.get_irc_names(&mut config, &server, None).await.unwrap();
        assert_eq!(names.username, "bridgebot");
    }

    #[test]
    fn reverse_mxid_realname() {
        assert_eq!(
            format_realname("@alice:chat.example.org", RealnameFormat::ReverseMxid),
            "org.example.chat:alice"
        );
        assert_eq!(
            format_realname("@alice:chat.example.org", RealnameFormat::Mxid),
            "@alice:chat.example.org"
        );
    }
}

//! Per-user IPv6 source address assignment.
//!
//! Networks that delegate an IPv6 block to the bridge get one address per
//! user, allocated from a persisted per-network counter. Allocation runs
//! through a keyed queue for the same reason ident generation does: the
//! counter is shared state, and two unqueued requests could mint the same
//! address before either is persisted.

use crate::db::{DataStore, IrcClientConfig};
use crate::util::{Queue, QueueError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// IPv6 allocation failures.
#[derive(Debug, Error)]
pub enum Ipv6Error {
    #[error("store error: {0}")]
    Store(#[from] crate::db::StoreError),

    /// The configured prefix plus the counter does not parse as an
    /// address; the block is misconfigured.
    #[error("generated address '{0}' is not a valid IPv6 address")]
    InvalidAddress(String),

    #[error("ipv6 queue error: {0}")]
    Queue(String),
}

struct AllocationRequest {
    prefix: String,
    config: IrcClientConfig,
}

pub struct Ipv6Generator {
    queue: Queue<AllocationRequest, String>,
}

impl Ipv6Generator {
    pub fn new(store: Arc<dyn DataStore>) -> Arc<Self> {
        // counters are loaded lazily, once, then owned by the queue task
        let counters: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));
        let queue = Queue::new(move |request: AllocationRequest| {
            let store = store.clone();
            let counters = counters.clone();
            async move { process(store, counters, request).await }
        });
        Arc::new(Self { queue })
    }

    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    /// Assign (or return the existing) IPv6 address for `config`,
    /// persisting both the address and the advanced counter before the
    /// queue slot is released. Returns `None` for configs with no usable
    /// identity to key the allocation on.
    pub async fn generate(
        &self,
        prefix: &str,
        config: &mut IrcClientConfig,
    ) -> Result<Option<String>, Ipv6Error> {
        if let Some(address) = &config.ipv6_address {
            info!(
                address,
                user_id = config.user_id.as_deref().unwrap_or("<bot>"),
                "Using existing IPv6 address"
            );
            return Ok(Some(address.clone()));
        }

        let Some(id) = config.user_id.clone().or_else(|| config.username.clone()) else {
            return Ok(None);
        };
        debug!(id, domain = %config.domain, "Enqueueing IPv6 generation request");
        let address = self
            .queue
            .enqueue(
                id,
                AllocationRequest {
                    prefix: prefix.to_string(),
                    config: config.clone(),
                },
            )
            .await
            .map_err(unwrap_queue_error)?;
        config.ipv6_address = Some(address.clone());
        Ok(Some(address))
    }
}

fn unwrap_queue_error(err: QueueError) -> Ipv6Error {
    match err.task_error() {
        Some(task_err) => match task_err.downcast_ref::<Ipv6Error>() {
            Some(Ipv6Error::InvalidAddress(a)) => Ipv6Error::InvalidAddress(a.clone()),
            _ => Ipv6Error::Queue(task_err.to_string()),
        },
        None => Ipv6Error::Queue(err.to_string()),
    }
}

async fn process(
    store: Arc<dyn DataStore>,
    counters: Arc<Mutex<HashMap<String, u64>>>,
    request: AllocationRequest,
) -> anyhow::Result<String> {
    let domain = request.config.domain.clone();

    let loaded = counters.lock().get(&domain).copied();
    let current = match loaded {
        Some(counter) => counter,
        None => {
            info!(domain = %domain, "Retrieving IPv6 counter");
            store.get_ipv6_counter(&domain).await.map_err(Ipv6Error::Store)?
        }
    };
    let next = current + 1;

    let address = compose_address(&request.prefix, next);
    if Ipv6Addr::from_str(&address).is_err() {
        return Err(Ipv6Error::InvalidAddress(address).into());
    }

    // only real Matrix users get their address persisted; the bot keeps
    // its allocation in memory
    if let Some(user_id) = &request.config.user_id {
        let mut config = store
            .get_irc_client_config(user_id, &domain)
            .await
            .map_err(Ipv6Error::Store)?
            .unwrap_or_else(|| request.config.clone());
        config.ipv6_address = Some(address.clone());
        info!(address, user_id, "Generated new IPv6 address");
        store
            .store_irc_client_config(&config)
            .await
            .map_err(Ipv6Error::Store)?;
    }

    store
        .set_ipv6_counter(&domain, next)
        .await
        .map_err(Ipv6Error::Store)?;
    counters.lock().insert(domain, next);
    Ok(address)
}

/// prefix + the counter in hex, with `:` inserted every 4 digits from the
/// end: 0x1a2b3c4d5e6 => "1a2:b3c4:d5e6".
fn compose_address(prefix: &str, counter: u64) -> String {
    let hex = format!("{counter:x}");
    let mut grouped = String::with_capacity(hex.len() + hex.len() / 4);
    for (i, c) in hex.chars().enumerate() {
        if i > 0 && (hex.len() - i) % 4 == 0 {
            grouped.push(':');
        }
        grouped.push(c);
    }
    format!("{prefix}{grouped}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;

    #[test]
    fn groups_hex_digits_from_the_right() {
        assert_eq!(compose_address("2001:db8:42::", 1), "2001:db8:42::1");
        assert_eq!(compose_address("2001:db8:42::", 0xabcd), "2001:db8:42::abcd");
        assert_eq!(
            compose_address("2001:db8::", 0x1a2b3c4d5e6),
            "2001:db8::1a2:b3c4:d5e6"
        );
    }

    #[tokio::test]
    async fn allocates_sequential_addresses() {
        let store = Arc::new(SqliteStore::open(":memory:").await.unwrap());
        let generator = Ipv6Generator::new(store.clone());

        let mut alice = IrcClientConfig::new(Some("@alice:x".into()), "irc.example.net".into());
        let mut bob = IrcClientConfig::new(Some("@bob:x".into()), "irc.example.net".into());

        let a = generator.generate("2001:db8:42::", &mut alice).await.unwrap();
        let b = generator.generate("2001:db8:42::", &mut bob).await.unwrap();
        assert_eq!(a.as_deref(), Some("2001:db8:42::1"));
        assert_eq!(b.as_deref(), Some("2001:db8:42::2"));

        // the counter survives a generator restart
        let generator = Ipv6Generator::new(store.clone());
        let mut carol = IrcClientConfig::new(Some("@carol:x".into()), "irc.example.net".into());
        let c = generator.generate("2001:db8:42::", &mut carol).await.unwrap();
        assert_eq!(c.as_deref(), Some("2001:db8:42::3"));
    }

    #[tokio::test]
    async fn existing_addresses_are_reused() {
        let store = Arc::new(SqliteStore::open(":memory:").await.unwrap());
        let generator = Ipv6Generator::new(store.clone());

        let mut config = IrcClientConfig::new(Some("@alice:x".into()), "irc.example.net".into());
        config.ipv6_address = Some("2001:db8:42::9".into());
        let address = generator.generate("2001:db8:42::", &mut config).await.unwrap();
        assert_eq!(address.as_deref(), Some("2001:db8:42::9"));
        // nothing was allocated
        assert_eq!(store.get_ipv6_counter("irc.example.net").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn address_is_persisted_for_matrix_users() {
        let store = Arc::new(SqliteStore::open(":memory:").await.unwrap());
        let generator = Ipv6Generator::new(store.clone());

        let mut config = IrcClientConfig::new(Some("@alice:x".into()), "irc.example.net".into());
        generator.generate("2001:db8:42::", &mut config).await.unwrap();

        let stored = store
            .get_irc_client_config("@alice:x", "irc.example.net")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.ipv6_address.as_deref(), Some("2001:db8:42::1"));
    }

    #[tokio::test]
    async fn bad_prefixes_are_rejected() {
        let store = Arc::new(SqliteStore::open(":memory:").await.unwrap());
        let generator = Ipv6Generator::new(store.clone());
        let mut config = IrcClientConfig::new(Some("@alice:x".into()), "irc.example.net".into());
        let err = generator.generate("not-a-prefix", &mut config).await.unwrap_err();
        assert!(matches!(err, Ipv6Error::InvalidAddress(_)));
    }
}

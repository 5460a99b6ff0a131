//! Integration test common infrastructure.
//!
//! Provides a scripted in-process mock IRC server, a recording event
//! sink, and helpers that wire a `ClientPool` against them.

// each test binary uses its own subset of the harness
#![allow(dead_code)]

pub mod ircd;
pub mod sink;

use mxircd::config::ServerConfig;
use mxircd::db::SqliteStore;
use mxircd::irc::{ClientPool, IrcServer};
use std::sync::Arc;

pub use ircd::{Behavior, MockConn, MockIrcd};
pub use sink::{RecordingSink, SinkEvent};

pub struct TestBridge {
    pub ircd: MockIrcd,
    pub pool: Arc<ClientPool>,
    pub server: Arc<IrcServer>,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<SqliteStore>,
}

/// Spin up a mock IRCd and a pool pointed at it.
pub async fn bridge_with(
    behavior: Behavior,
    mutate: impl FnOnce(&mut ServerConfig),
) -> TestBridge {
    let ircd = MockIrcd::start(behavior).await;

    let mut config: ServerConfig = toml::from_str(r#"domain = "127.0.0.1""#).unwrap();
    config.port = ircd.port();
    mutate(&mut config);

    let server = IrcServer::new(config, "example.org").unwrap();
    let store = Arc::new(SqliteStore::open(":memory:").await.unwrap());
    let sink = Arc::new(RecordingSink::default());
    let pool = ClientPool::new(vec![server.clone()], store.clone(), sink.clone());

    TestBridge {
        ircd,
        pool,
        server,
        sink,
        store,
    }
}

/// Poll until `pred` holds or the timeout elapses. Returns whether the
/// predicate was eventually satisfied.
pub async fn eventually(
    timeout: std::time::Duration,
    mut pred: impl FnMut() -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
}

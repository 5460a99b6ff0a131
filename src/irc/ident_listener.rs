//! RFC 1413 ident responder.
//!
//! IRC servers look up the ident of a connecting client by asking the
//! client host's ident service which user owns the originating port. All
//! bridge clients share one host, so this responder answers with the
//! generated per-user username for the port each connection was dialled
//! from.
//!
//! Ident queries race the connections themselves: the server may ask
//! before the dialling task has recorded its port. Queries therefore wait
//! (bounded) until no connection is mid-establishment before answering.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

static MAPPINGS: OnceLock<Mutex<HashMap<u16, String>>> = OnceLock::new();
static PENDING_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// How long a query will wait for in-flight connections to settle.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE_POLL: Duration = Duration::from_millis(100);

fn mappings() -> &'static Mutex<HashMap<u16, String>> {
    MAPPINGS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Guard marking a connection as mid-establishment. Queries stall until
/// every guard is dropped.
pub struct ConnectGuard(());

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        PENDING_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn connect_begin() -> ConnectGuard {
    PENDING_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
    ConnectGuard(())
}

/// Record which username owns a local port.
pub fn set_mapping(username: &str, port: u16) {
    debug!(username, port, "Set ident mapping");
    mappings().lock().insert(port, username.to_string());
}

pub fn remove_mapping(port: u16) {
    mappings().lock().remove(&port);
}

/// Serve ident queries forever. Spawned as a background task when the
/// responder is enabled.
pub async fn run(address: &str) -> std::io::Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!(address, "Ident responder listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(peer = %peer, "Ident query");
        tokio::spawn(async move {
            if let Err(e) = answer_query(stream).await {
                warn!(peer = %peer, error = %e, "Failed to answer ident query");
            }
        });
    }
}

async fn answer_query(stream: TcpStream) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    // "<port-on-server>, <port-on-client>"
    let mut ports = line.split(',').map(|p| p.trim().parse::<u16>());
    let (local, remote) = match (ports.next(), ports.next()) {
        (Some(Ok(local)), Some(Ok(remote))) => (local, remote),
        _ => return Ok(()), // malformed query, drop it
    };

    // wait for in-flight connections to record their ports
    let settle = async {
        while PENDING_CONNECTIONS.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(SETTLE_POLL).await;
        }
    };
    let _ = tokio::time::timeout(SETTLE_TIMEOUT, settle).await;

    let username = mappings().lock().get(&local).cloned();
    let response = match username {
        Some(username) => format!("{local}, {remote} : USERID : UNIX : {username}\r\n"),
        None => format!("{local}, {remote} : ERROR : NO-USER\r\n"),
    };
    let stream = reader.get_mut();
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn answers_known_and_unknown_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(answer_query(stream));
            }
        });

        set_mapping("alice", 40123);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"40123, 6667\r\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert_eq!(response.trim(), "40123, 6667 : USERID : UNIX : alice");

        remove_mapping(40123);
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"40123, 6667\r\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert_eq!(response.trim(), "40123, 6667 : ERROR : NO-USER");
    }
}

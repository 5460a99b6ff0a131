//! A scripted mock IRC server.
//!
//! Speaks just enough of the protocol to register bridge clients and
//! exercise join/part/nick/whois/names flows, with per-test behaviour
//! knobs for rejections and silence. Every received line is recorded for
//! assertions, and tests can inject arbitrary server lines into any
//! connection to simulate shared channel traffic.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};

/// Per-test server behaviour.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// channel -> error numeric sent instead of a JOIN ack.
    pub refuse_join: HashMap<String, u16>,
    /// Channels whose JOINs are silently ignored (no ack, no error).
    pub ignore_join: HashSet<String>,
    /// Nicks that 433 on post-registration NICK changes.
    pub nick_in_use: HashSet<String>,
    /// Nicks WHOIS knows about; everything else is 401.
    pub known_users: HashSet<String>,
    /// channel -> NAMES entries (with status prefixes, e.g. "@fred").
    pub names: HashMap<String, Vec<String>>,
}

pub struct MockConn {
    nick: Mutex<String>,
    registered: Mutex<bool>,
    tx: mpsc::UnboundedSender<String>,
    received: Mutex<Vec<String>>,
    shutdown: Arc<Notify>,
}

impl MockConn {
    pub fn nick(&self) -> String {
        self.nick.lock().clone()
    }

    /// Inject a raw server line into this connection.
    pub fn send(&self, line: &str) {
        let _ = self.tx.send(line.to_string());
    }

    /// Close the socket from the server side.
    pub fn close(&self) {
        self.shutdown.notify_waiters();
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    pub fn received_count(&self, prefix: &str) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|l| l.starts_with(prefix))
            .count()
    }

    pub async fn wait_for_line(&self, prefix: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.received_count(prefix) > 0 {
                return true;
            }
            if tokio::time::Instant::now() > deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

struct MockState {
    behavior: Behavior,
    conns: Mutex<Vec<Arc<MockConn>>>,
}

pub struct MockIrcd {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockIrcd {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState {
            behavior,
            conns: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    handle_connection(stream, state).await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connection_count(&self) -> usize {
        self.state.conns.lock().len()
    }

    pub fn connections(&self) -> Vec<Arc<MockConn>> {
        self.state.conns.lock().clone()
    }

    pub fn conn_of(&self, nick: &str) -> Option<Arc<MockConn>> {
        self.state
            .conns
            .lock()
            .iter()
            .find(|c| c.nick() == nick)
            .cloned()
    }

    pub async fn wait_for_connections(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.connection_count() >= n {
                return true;
            }
            if tokio::time::Instant::now() > deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn send_to_all(&self, line: &str) {
        for conn in self.state.conns.lock().iter() {
            conn.send(line);
        }
    }
}

async fn write_lines(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        let framed = format!("{line}\r\n");
        if writer.write_all(framed.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<MockState>) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(Notify::new());
    let conn = Arc::new(MockConn {
        nick: Mutex::new(String::new()),
        registered: Mutex::new(false),
        tx,
        received: Mutex::new(Vec::new()),
        shutdown: shutdown.clone(),
    });
    state.conns.lock().push(conn.clone());

    let writer_task = tokio::spawn(write_lines(write_half, rx));

    let mut reader = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            line = reader.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
            _ = shutdown.notified() => break,
        };
        // lines() strips the \n but leaves the \r behind
        let line = line.trim_end_matches('\r').to_string();
        conn.received.lock().push(line.clone());
        handle_line(&conn, &state.behavior, &line);
    }
    writer_task.abort();
}

fn handle_line(conn: &Arc<MockConn>, behavior: &Behavior, line: &str) {
    let mut parts = line.splitn(2, ' ');
    let command = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("");
    let nick = conn.nick();

    match command {
        "NICK" => {
            let wanted = rest.trim_start_matches(':').to_string();
            if !*conn.registered.lock() {
                *conn.nick.lock() = wanted;
            } else if behavior.nick_in_use.contains(&wanted) {
                conn.send(&format!(
                    ":mock.server 433 {nick} {wanted} :Nickname is already in use"
                ));
            } else {
                conn.send(&format!(":{nick}!u@mock NICK :{wanted}"));
                *conn.nick.lock() = wanted;
            }
        }
        "USER" => {
            *conn.registered.lock() = true;
            let nick = conn.nick();
            conn.send(&format!(
                ":mock.server 001 {nick} :Welcome to the Mock IRC Network {nick}"
            ));
            conn.send(&format!(
                ":mock.server 005 {nick} PREFIX=(qaohv)~&@%+ NICKLEN=30 CASEMAPPING=rfc1459 :are supported by this server"
            ));
        }
        "PING" => {
            conn.send(&format!(":mock.server PONG mock.server {rest}"));
        }
        "JOIN" => {
            let channel = rest.split(' ').next().unwrap_or("").to_string();
            if let Some(numeric) = behavior.refuse_join.get(&channel) {
                conn.send(&format!(
                    ":mock.server {numeric} {nick} {channel} :Cannot join channel"
                ));
            } else if !behavior.ignore_join.contains(&channel) {
                conn.send(&format!(":{nick}!u@mock JOIN :{channel}"));
            }
        }
        "PART" => {
            let channel = rest.split(' ').next().unwrap_or("").to_string();
            conn.send(&format!(":{nick}!u@mock PART {channel} :leaving"));
        }
        "NAMES" => {
            let channel = rest.split(' ').next().unwrap_or("").to_string();
            let entries = behavior
                .names
                .get(&channel)
                .map(|names| names.join(" "))
                .unwrap_or_default();
            conn.send(&format!(":mock.server 353 {nick} = {channel} :{entries}"));
            conn.send(&format!(
                ":mock.server 366 {nick} {channel} :End of /NAMES list"
            ));
        }
        "WHOIS" => {
            let target = rest.split(' ').next_back().unwrap_or("").to_string();
            if behavior.known_users.contains(&target) {
                conn.send(&format!(
                    ":mock.server 311 {nick} {target} {target} host.example * :A real user"
                ));
                conn.send(&format!(
                    ":mock.server 318 {nick} {target} :End of /WHOIS list"
                ));
            } else {
                conn.send(&format!(
                    ":mock.server 401 {nick} {target} :No such nick/channel"
                ));
            }
        }
        "QUIT" => {
            conn.shutdown.notify_waiters();
        }
        _ => {}
    }
}

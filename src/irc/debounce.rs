//! Net-split QUIT suppression.
//!
//! A netsplit shows up as a burst of QUITs on every channel at once.
//! Relaying each one as a Matrix leave (and the rejoin moments later)
//! floods rooms with churn, so when the QUIT rate crosses the configured
//! threshold, leaves are held back for a random delay and cancelled
//! entirely if the user rejoins first.

use crate::irc::server::IrcServer;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

/// Window over which the QUIT rate is measured.
const QUIT_WINDOW: Duration = Duration::from_secs(1);
/// Grace period so sibling splitters get counted before we judge the rate.
const QUIT_WAIT_DELAY: Duration = Duration::from_millis(100);

#[derive(Default)]
struct ServerDebouncer {
    quit_times: Mutex<VecDeque<Instant>>,
    rejoins: Mutex<HashMap<String, Arc<Notify>>>,
}

#[derive(Default)]
pub struct QuitDebouncer {
    servers: DashMap<String, Arc<ServerDebouncer>>,
}

impl QuitDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    fn server(&self, domain: &str) -> Arc<ServerDebouncer> {
        self.servers.entry(domain.to_string()).or_default().clone()
    }

    /// A JOIN for `nick` arrived; cancel any held-back leave.
    pub fn on_join(&self, domain: &str, nick: &str) {
        let debouncer = self.server(domain);
        let rejoined = debouncer.rejoins.lock().remove(nick);
        if let Some(notify) = rejoined {
            notify.notify_waiters();
        }
    }

    /// Decide whether a QUIT should be relayed as a leave. Returns `false`
    /// when the quit was debounced away (the user rejoined during the
    /// delay window).
    pub async fn debounce_quit(&self, server: &IrcServer, nick: &str) -> bool {
        if !server.should_debounce_quits() {
            return true;
        }
        let debouncer = self.server(server.domain());

        let now = Instant::now();
        {
            let mut times = debouncer.quit_times.lock();
            times.push_back(now);
            while times.front().is_some_and(|&t| t + QUIT_WINDOW < now) {
                times.pop_front();
            }
        }

        // wait for other potential splitters to send their QUITs
        tokio::time::sleep(QUIT_WAIT_DELAY).await;
        let rate = debouncer.quit_times.lock().len();
        if rate <= server.debounce_quits_per_second() {
            // legitimate quit (ping timeout, client closed); relay it
            return true;
        }

        let (min, max) = server.debounce_delay_range();
        let delay = if max > min {
            min + (max - min).mul_f64(rand::thread_rng().r#gen::<f64>())
        } else {
            min
        };
        if delay.is_zero() {
            return true;
        }
        debug!(domain = %server.domain(), nick, delay_ms = delay.as_millis() as u64, "Debouncing quit");

        let notify = Arc::new(Notify::new());
        debouncer
            .rejoins
            .lock()
            .insert(nick.to_string(), notify.clone());

        let rejoined = tokio::time::timeout(delay, notify.notified()).await.is_ok();
        debouncer.rejoins.lock().remove(nick);
        if rejoined {
            debug!(domain = %server.domain(), nick, "User rejoined, suppressing leave");
        }
        !rejoined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn debouncing_server(min_ms: u64, max_ms: u64, threshold: usize) -> Arc<IrcServer> {
        let mut config: ServerConfig = toml::from_str(r#"domain = "irc.example.net""#).unwrap();
        config.quit_debounce.enabled = true;
        config.quit_debounce.quits_per_second = threshold;
        config.quit_debounce.delay_min_ms = min_ms;
        config.quit_debounce.delay_max_ms = max_ms;
        IrcServer::new(config, "example.org").unwrap()
    }

    #[tokio::test]
    async fn relays_quits_below_the_split_threshold() {
        let server = debouncing_server(50, 50, 5);
        let debouncer = QuitDebouncer::new();
        assert!(debouncer.debounce_quit(&server, "alice").await);
    }

    #[tokio::test]
    async fn disabled_debounce_always_relays() {
        let mut config: ServerConfig = toml::from_str(r#"domain = "irc.example.net""#).unwrap();
        config.quit_debounce.enabled = false;
        let server = IrcServer::new(config, "example.org").unwrap();
        let debouncer = QuitDebouncer::new();
        assert!(debouncer.debounce_quit(&server, "alice").await);
    }

    #[tokio::test]
    async fn burst_of_quits_is_delayed_and_rejoin_cancels() {
        let server = debouncing_server(300, 300, 2);
        let debouncer = Arc::new(QuitDebouncer::new());

        // three quick quits push the rate over the threshold of 2
        let mut tasks = Vec::new();
        for nick in ["a", "b", "c"] {
            let debouncer = debouncer.clone();
            let server = server.clone();
            tasks.push(tokio::spawn(async move {
                (nick, debouncer.debounce_quit(&server, nick).await)
            }));
        }

        // let the quits register, then rejoin "a" inside the delay window
        tokio::time::sleep(Duration::from_millis(200)).await;
        debouncer.on_join(server.domain(), "a");

        for task in tasks {
            let (nick, relayed) = task.await.unwrap();
            if nick == "a" {
                assert!(!relayed, "rejoined user must be suppressed");
            } else {
                assert!(relayed, "split user without rejoin eventually leaves");
            }
        }
    }
}

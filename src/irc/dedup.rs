//! The dedup claim table.
//!
//! Every session on a server hears the same lines; per (domain, line-hash)
//! the table records which nick took responsibility for relaying it.
//! Claims expire after a cleanup window to bound memory - except NAMES
//! claims, which are permanent: letting those expire would re-sync whole
//! channel directories every time a client joins.

use dashmap::DashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Claims older than this are culled. Needs to be comfortably above the
/// TCP maximum segment lifetime so a lagging duplicate can't resurrect a
/// culled line; 2 minutes MSL makes 10 minutes long enough.
pub const CLEANUP_WINDOW: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
struct Claim {
    nick: String,
    /// `None` never expires (NAMES).
    claimed_at: Option<Instant>,
}

/// Hash a server line into a claim key.
pub fn hash_line(line: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    line.hash(&mut hasher);
    hasher.finish()
}

#[derive(Default)]
pub struct ProcessedDict {
    processed: DashMap<String, DashMap<u64, Claim>>,
}

impl ProcessedDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// The nick currently holding `hash` on `domain`, if any.
    pub fn get_claimer(&self, domain: &str, hash: u64) -> Option<String> {
        self.processed
            .get(domain)?
            .get(&hash)
            .map(|claim| claim.nick.clone())
    }

    /// Record `nick` as the owner of `hash`.
    pub fn claim(&self, domain: &str, hash: u64, nick: &str, permanent: bool) {
        self.processed.entry(domain.to_string()).or_default().insert(
            hash,
            Claim {
                nick: nick.to_string(),
                claimed_at: (!permanent).then(Instant::now),
            },
        );
    }

    /// Spawn the periodic cleaner.
    pub fn start_cleaner(self: &Arc<Self>) {
        let dict = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CLEANUP_WINDOW).await;
                dict.sweep(Instant::now());
            }
        });
    }

    fn sweep(&self, now: Instant) {
        for entry in self.processed.iter() {
            let before = entry.value().len();
            entry
                .value()
                .retain(|_, claim| claim.claimed_at.is_none_or(|at| now < at + CLEANUP_WINDOW));
            let culled = before - entry.value().len();
            if culled > 0 {
                debug!(domain = %entry.key(), culled, "Cleaned up claim entries");
            }
        }
    }

    #[cfg(test)]
    fn len(&self, domain: &str) -> usize {
        self.processed.get(domain).map_or(0, |d| d.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_are_recorded_and_looked_up() {
        let dict = ProcessedDict::new();
        let hash = hash_line(":a!u@h PRIVMSG #x :hi");
        assert_eq!(dict.get_claimer("irc.example.net", hash), None);
        dict.claim("irc.example.net", hash, "alice", false);
        assert_eq!(
            dict.get_claimer("irc.example.net", hash).as_deref(),
            Some("alice")
        );
        // a different domain is a different claim space
        assert_eq!(dict.get_claimer("irc.other.net", hash), None);
    }

    #[test]
    fn sweep_culls_only_expired_claims() {
        let dict = ProcessedDict::new();
        dict.claim("d", 1, "alice", false);
        dict.claim("d", 2, "bob", true); // NAMES-style, permanent

        // nothing is old enough yet
        dict.sweep(Instant::now());
        assert_eq!(dict.len("d"), 2);

        // pretend the window has passed
        dict.sweep(Instant::now() + CLEANUP_WINDOW + Duration::from_secs(1));
        assert_eq!(dict.len("d"), 1);
        assert_eq!(dict.get_claimer("d", 2).as_deref(), Some("bob"));
    }

    #[test]
    fn identical_lines_share_a_hash() {
        assert_eq!(
            hash_line(":a!u@h PRIVMSG #x :hi"),
            hash_line(":a!u@h PRIVMSG #x :hi")
        );
        assert_ne!(
            hash_line(":a!u@h PRIVMSG #x :hi"),
            hash_line(":a!u@h PRIVMSG #x :hi!")
        );
    }
}

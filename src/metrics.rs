//! Prometheus metrics for the bridge's IRC side.
//!
//! Tracks connection population, reconnect backlog and the behaviour of
//! the dedup claim table, exposed on the HTTP surface for scraping.

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Gauges (can increase/decrease)
// ========================================================================

/// Currently connected virtual IRC clients, per server.
static CONNECTED_CLIENTS: OnceLock<IntGaugeVec> = OnceLock::new();

/// Clients waiting for a reconnect slot, per server.
static RECONNECT_QUEUE: OnceLock<IntGaugeVec> = OnceLock::new();

// ========================================================================
// Counters (monotonic increasing)
// ========================================================================

/// Claim-table steals from dead sessions, per server.
static DEDUP_STEALS: OnceLock<IntCounterVec> = OnceLock::new();

/// Events dropped as duplicates of an already-claimed line, per server.
static DEDUP_DROPPED: OnceLock<IntCounterVec> = OnceLock::new();

/// Connection attempts that failed, per server and error code.
static CONNECTION_FAILURES: OnceLock<IntCounterVec> = OnceLock::new();

fn connected_clients_gauge() -> &'static IntGaugeVec {
    CONNECTED_CLIENTS.get_or_init(|| {
        let gauge = IntGaugeVec::new(
            Opts::new("irc_connected_clients", "Connected virtual IRC clients"),
            &["server"],
        )
        .unwrap();
        let _ = registry().register(Box::new(gauge.clone()));
        gauge
    })
}

fn reconnect_queue_gauge() -> &'static IntGaugeVec {
    RECONNECT_QUEUE.get_or_init(|| {
        let gauge = IntGaugeVec::new(
            Opts::new("irc_reconnect_queue", "Clients waiting to reconnect"),
            &["server"],
        )
        .unwrap();
        let _ = registry().register(Box::new(gauge.clone()));
        gauge
    })
}

fn dedup_steals_counter() -> &'static IntCounterVec {
    DEDUP_STEALS.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("irc_dedup_steals_total", "Claims stolen from dead sessions"),
            &["server"],
        )
        .unwrap();
        let _ = registry().register(Box::new(counter.clone()));
        counter
    })
}

fn dedup_dropped_counter() -> &'static IntCounterVec {
    DEDUP_DROPPED.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("irc_dedup_dropped_total", "Events dropped as duplicates"),
            &["server"],
        )
        .unwrap();
        let _ = registry().register(Box::new(counter.clone()));
        counter
    })
}

fn connection_failures_counter() -> &'static IntCounterVec {
    CONNECTION_FAILURES.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("irc_connection_failures_total", "Failed connection attempts"),
            &["server", "reason"],
        )
        .unwrap();
        let _ = registry().register(Box::new(counter.clone()));
        counter
    })
}

pub fn connected_clients(server: &str, count: usize) {
    connected_clients_gauge()
        .with_label_values(&[server])
        .set(count as i64);
}

pub fn reconnect_queue_size(server: &str, count: usize) {
    reconnect_queue_gauge()
        .with_label_values(&[server])
        .set(count as i64);
}

pub fn dedup_steal(server: &str) {
    dedup_steals_counter().with_label_values(&[server]).inc();
}

pub fn dedup_dropped(server: &str) {
    dedup_dropped_counter().with_label_values(&[server]).inc();
}

pub fn connection_failure(server: &str, reason: &str) {
    connection_failures_counter()
        .with_label_values(&[server, reason])
        .inc();
}

/// Render all metrics in the Prometheus text format.
pub fn gather_metrics() -> String {
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_in_text_format() {
        connected_clients("irc.example.net", 3);
        dedup_steal("irc.example.net");
        dedup_dropped("irc.example.net");
        connection_failure("irc.example.net", "timeout");
        let text = gather_metrics();
        assert!(text.contains("irc_connected_clients"));
        assert!(text.contains("irc_dedup_steals_total"));
    }
}

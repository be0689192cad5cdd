//! Session counters for the bridge.
//!
//! One [`BridgeStats`] is created per server and shared by `Arc` with the
//! components that count things. Counters are relaxed atomics; a
//! [`StatsSnapshot`] is only ever used for logging and tests.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct BridgeStats {
    started_at: Instant,
    messages_received: AtomicU64,
    commands_matched: AtomicU64,
    replies_sent: AtomicU64,
    send_failures: AtomicU64,
    query_errors: AtomicU64,
    reconnect_cycles: AtomicU64,
    probe_failures: AtomicU64,
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            messages_received: AtomicU64::new(0),
            commands_matched: AtomicU64::new(0),
            replies_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            query_errors: AtomicU64::new(0),
            reconnect_cycles: AtomicU64::new(0),
            probe_failures: AtomicU64::new(0),
        }
    }

    pub fn inc_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_matched(&self) {
        self.commands_matched.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_replies_sent(&self) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_send_failures(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_query_errors(&self) {
        self.query_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_reconnect_cycles(&self) {
        self.reconnect_cycles.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_probe_failures(&self) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.uptime(),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            commands_matched: self.commands_matched.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            query_errors: self.query_errors.load(Ordering::Relaxed),
            reconnect_cycles: self.reconnect_cycles.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub messages_received: u64,
    pub commands_matched: u64,
    pub replies_sent: u64,
    pub send_failures: u64,
    pub query_errors: u64,
    pub reconnect_cycles: u64,
    pub probe_failures: u64,
}

impl StatsSnapshot {
    /// Uptime rendered as `HH:MM:SS`.
    pub fn uptime_hms(&self) -> String {
        let secs = self.uptime.as_secs();
        format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    }

    /// One-line summary for periodic logging.
    pub fn summary(&self) -> String {
        format!(
            "uptime={} rx={} matched={} sent={} send_failed={} query_errors={} reconnects={} probe_failures={}",
            self.uptime_hms(),
            self.messages_received,
            self.commands_matched,
            self.replies_sent,
            self.send_failures,
            self.query_errors,
            self.reconnect_cycles,
            self.probe_failures
        )
    }
}

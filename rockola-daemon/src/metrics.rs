use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rockola_common::SessionStats;

/// Counters for the current session, shared between the event loop and the
/// connection task.
pub struct SessionMetrics {
    items_played: AtomicU64,
    load_failures: AtomicU64,
    stale_events_discarded: AtomicU64,
    reconnects: AtomicU64,
    offline_transitions: AtomicU64,

    // Last 50 errors: (timestamp, description)
    error_samples: parking_lot::Mutex<VecDeque<(Instant, String)>>,

    start_time: Instant,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            items_played: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            stale_events_discarded: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            offline_transitions: AtomicU64::new(0),
            error_samples: parking_lot::Mutex::new(VecDeque::with_capacity(50)),
            start_time: Instant::now(),
        }
    }

    pub fn record_played(&self) {
        self.items_played.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self, reason: &str) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error(reason);
    }

    pub fn record_stale_event(&self) {
        self.stale_events_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_offline(&self) {
        self.offline_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, error: &str) {
        let mut samples = self.error_samples.lock();
        samples.push_back((Instant::now(), error.to_string()));
        if samples.len() > 50 {
            samples.pop_front();
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.error_samples.lock().back().map(|(_, e)| e.clone())
    }

    /// Errors recorded within the last `window`, counted from the ring.
    pub fn recent_errors(&self, window: Duration) -> usize {
        self.error_samples
            .lock()
            .iter()
            .filter(|(at, _)| at.elapsed() < window)
            .count()
    }

    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            items_played: self.items_played.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            stale_events_discarded: self.stale_events_discarded.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            offline_transitions: self.offline_transitions.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let uptime_secs = self.start_time.elapsed().as_secs();
        let uptime_str = if uptime_secs < 60 {
            format!("{}s", uptime_secs)
        } else if uptime_secs < 3600 {
            format!("{}m{}s", uptime_secs / 60, uptime_secs % 60)
        } else {
            format!("{}h{}m{}s", uptime_secs / 3600, (uptime_secs % 3600) / 60, uptime_secs % 60)
        };

        let stats = self.snapshot();
        let last_error = self
            .error_samples
            .lock()
            .back()
            .map(|(at, e)| format!(" | Last error ({}s ago): {}", at.elapsed().as_secs(), e))
            .unwrap_or_default();
        let recent = self.recent_errors(Duration::from_secs(300));

        tracing::info!(
            "[METRICS] Uptime: {} | Played: {} | Load failures: {} | Stale events: {} | Reconnects: {} | Offline transitions: {} | Errors (5m): {}{}",
            uptime_str,
            stats.items_played,
            stats.load_failures,
            stats.stale_events_discarded,
            stats.reconnects,
            stats.offline_transitions,
            recent,
            last_error
        );
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

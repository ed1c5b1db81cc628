//! Metrics collection for the distribution subsystem.
//!
//! Counters fall in two classes. Window-scoped activity (events, errors,
//! latency samples) is cleared on every rolling-window boundary. Live state
//! (active connections, peak, per-user active counts) describes the present
//! and survives resets.

use crate::error::ErrorKind;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Number of raw latency samples retained for the moving average.
const LATENCY_SAMPLE_CAP: usize = 1024;

pub struct MetricsCollector {
    // Live state: survives window resets.
    active_connections: AtomicUsize,
    peak_connections: AtomicUsize,
    per_user_active: DashMap<String, usize>,

    // Window-scoped activity.
    connections_opened: AtomicU64,
    events_total: AtomicU64,
    events_by_type: DashMap<String, u64>,
    events_by_user: DashMap<String, u64>,
    errors_by_kind: DashMap<&'static str, u64>,
    latency_samples: Mutex<Vec<Duration>>,

    reset_window: Duration,
    window_started: Mutex<Instant>,
}

impl MetricsCollector {
    pub fn new(reset_window: Duration) -> Self {
        Self {
            active_connections: AtomicUsize::new(0),
            peak_connections: AtomicUsize::new(0),
            per_user_active: DashMap::new(),
            connections_opened: AtomicU64::new(0),
            events_total: AtomicU64::new(0),
            events_by_type: DashMap::new(),
            events_by_user: DashMap::new(),
            errors_by_kind: DashMap::new(),
            latency_samples: Mutex::new(Vec::new()),
            reset_window,
            window_started: Mutex::new(Instant::now()),
        }
    }

    pub fn record_connection_opened(&self, user_id: &str) {
        self.maybe_roll_window();
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        let active = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_connections.fetch_max(active, Ordering::Relaxed);
        *self.per_user_active.entry(user_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_connection_closed(&self, user_id: &str) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
        if let Some(mut count) = self.per_user_active.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                drop(count);
                self.per_user_active.remove_if(user_id, |_, v| *v == 0);
            }
        }
    }

    pub fn record_event(&self, event_type: &str, user_id: Option<&str>) {
        self.maybe_roll_window();
        self.events_total.fetch_add(1, Ordering::Relaxed);
        *self
            .events_by_type
            .entry(event_type.to_string())
            .or_insert(0) += 1;
        if let Some(user_id) = user_id {
            *self
                .events_by_user
                .entry(user_id.to_string())
                .or_insert(0) += 1;
        }
    }

    pub fn record_error(&self, kind: &ErrorKind) {
        self.maybe_roll_window();
        *self.errors_by_kind.entry(kind.metric_label()).or_insert(0) += 1;
    }

    /// Records one dispatch call's wall-clock processing duration.
    pub fn record_latency(&self, elapsed: Duration) {
        let mut samples = self.latency_samples.lock().unwrap();
        if samples.len() >= LATENCY_SAMPLE_CAP {
            samples.remove(0);
        }
        samples.push(elapsed);
    }

    /// Clears window-scoped counters once the reset window has elapsed.
    /// Called opportunistically from the record paths; cheap when the window
    /// is still open.
    fn maybe_roll_window(&self) {
        let mut started = self.window_started.lock().unwrap();
        if started.elapsed() < self.reset_window {
            return;
        }
        *started = Instant::now();
        drop(started);

        self.connections_opened.store(0, Ordering::Relaxed);
        self.events_total.store(0, Ordering::Relaxed);
        self.events_by_type.clear();
        self.events_by_user.clear();
        self.errors_by_kind.clear();
        self.latency_samples.lock().unwrap().clear();
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn average_latency_ms(&self) -> f64 {
        let samples = self.latency_samples.lock().unwrap();
        if samples.is_empty() {
            return 0.0;
        }
        let total: Duration = samples.iter().sum();
        total.as_secs_f64() * 1000.0 / samples.len() as f64
    }

    /// Window-relative error rate: errors per recorded event. Used by the
    /// enhanced backend's performance status.
    pub fn error_rate(&self) -> f64 {
        let events = self.events_total.load(Ordering::Relaxed);
        if events == 0 {
            return 0.0;
        }
        let errors: u64 = self.errors_by_kind.iter().map(|e| *e.value()).sum();
        errors as f64 / events as f64
    }

    /// Events per second over the current window.
    pub fn throughput(&self) -> f64 {
        let elapsed = self.window_started.lock().unwrap().elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.events_total.load(Ordering::Relaxed) as f64 / elapsed
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            peak_connections: self.peak_connections.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            per_user_active: self
                .per_user_active
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            events_total: self.events_total.load(Ordering::Relaxed),
            events_by_type: self
                .events_by_type
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            events_by_user: self
                .events_by_user
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            errors_by_kind: self
                .errors_by_kind
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
            avg_latency_ms: self.average_latency_ms(),
            window_age_secs: self.window_started.lock().unwrap().elapsed().as_secs(),
        }
    }
}

/// Point-in-time aggregate exposed through `getStats()`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub active_connections: usize,
    pub peak_connections: usize,
    pub connections_opened: u64,
    pub per_user_active: std::collections::HashMap<String, usize>,
    pub events_total: u64,
    pub events_by_type: std::collections::HashMap<String, u64>,
    pub events_by_user: std::collections::HashMap<String, u64>,
    pub errors_by_kind: std::collections::HashMap<String, u64>,
    pub avg_latency_ms: f64,
    pub window_age_secs: u64,
}

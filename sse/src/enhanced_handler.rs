//! Enhanced shared-store backend.
//!
//! Composes the shared-store backend with three additions: a recent-history
//! cache that primes new connections with last-known state, a circuit
//! breaker that stops fan-out publishing while the shared store is
//! misbehaving, and on-demand performance figures in its status report.

use crate::connection::{ConnectionId, ConnectionMetadata, ExportedConnection, FrameSender};
use crate::error::Result;
use crate::handler::{EventHandler, HandlerKind, HandlerStatus, SweepThresholds};
use crate::history::EventHistory;
use crate::metrics::MetricsSnapshot;
use crate::offline::OfflineQueueSettings;
use crate::redis_handler::SharedStoreHandler;
use crate::reliability::{CircuitBreaker, CircuitState};
use crate::wire;
use async_trait::async_trait;
use events::{Event, SendOptions, UserId};
use log::*;
use std::sync::{Arc, Mutex};

/// History sizing for connection priming.
#[derive(Debug, Clone, Copy)]
pub struct HistorySettings {
    pub max_per_type: usize,
    pub expiry: chrono::Duration,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            max_per_type: 10,
            expiry: chrono::Duration::minutes(30),
        }
    }
}

pub struct EnhancedSharedStoreHandler {
    inner: SharedStoreHandler,
    history: EventHistory,
    breaker: Mutex<CircuitBreaker>,
}

impl EnhancedSharedStoreHandler {
    pub async fn connect(
        redis_url: &str,
        metrics: Arc<crate::metrics::MetricsCollector>,
        offline_settings: OfflineQueueSettings,
        history_settings: HistorySettings,
    ) -> Result<Self> {
        let inner = SharedStoreHandler::connect(redis_url, metrics, offline_settings).await?;
        Ok(Self {
            inner,
            history: EventHistory::new(history_settings.max_per_type, history_settings.expiry),
            breaker: Mutex::new(CircuitBreaker::default()),
        })
    }

    /// Downgrades to local-only dispatch while the breaker is open so a sick
    /// store is not hammered with publishes.
    fn effective_options(&self, options: SendOptions) -> SendOptions {
        let mut breaker = self.breaker.lock().unwrap();
        if breaker.can_execute() {
            options
        } else {
            debug!("Circuit open; suppressing fan-out for this dispatch");
            SendOptions::local_only()
        }
    }

    fn observe(&self, result: &Result<usize>) {
        let mut breaker = self.breaker.lock().unwrap();
        match result {
            Ok(_) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
        }
    }

}

/// Sends the newest cached event of every type the user may see (broadcasts
/// and that user's own targeted events) straight down one connection, before
/// it is registered for live dispatch.
fn prime_connection(history: &EventHistory, user_id: &UserId, sender: &FrameSender) {
    for event in history.latest_per_type(user_id) {
        match wire::frame_event(&event) {
            Ok(frame) => {
                if sender.send(frame).is_err() {
                    debug!("Priming write failed for user {user_id}; stream already gone");
                    return;
                }
            }
            Err(e) => warn!("Cached event {} failed framing: {e}", event.id),
        }
    }
}

#[async_trait]
impl EventHandler for EnhancedSharedStoreHandler {
    async fn add_client(
        &self,
        id: ConnectionId,
        user_id: UserId,
        sender: FrameSender,
        metadata: ConnectionMetadata,
    ) -> Result<()> {
        // Priming first, then registration (which replays the offline
        // queue): cached state, queued messages, live events, in that order.
        prime_connection(&self.history, &user_id, &sender);
        self.inner.add_client(id, user_id, sender, metadata).await
    }

    async fn remove_client(&self, id: &ConnectionId) {
        self.inner.remove_client(id).await;
    }

    async fn send_to_user(
        &self,
        user_id: &UserId,
        event: Event,
        options: SendOptions,
    ) -> Result<usize> {
        self.history.record(&event, Some(user_id));
        let options = self.effective_options(options);
        let result = self.inner.send_to_user(user_id, event, options).await;
        self.observe(&result);
        result
    }

    async fn broadcast(&self, event: Event, options: SendOptions) -> Result<usize> {
        self.history.record(&event, None);
        let options = self.effective_options(options);
        let result = self.inner.broadcast(event, options).await;
        self.observe(&result);
        result
    }

    async fn update_activity(&self, id: &ConnectionId) {
        self.inner.update_activity(id).await;
    }

    fn status(&self) -> HandlerStatus {
        let inner = self.inner.status();
        let circuit_open = self.breaker.lock().unwrap().state() == CircuitState::Open;
        HandlerStatus {
            kind: HandlerKind::EnhancedSharedStore,
            is_ready: inner.is_ready && !circuit_open,
            ..inner
        }
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics_snapshot()
    }

    async fn sweep(&self, thresholds: SweepThresholds) -> usize {
        self.inner.sweep(thresholds).await
    }

    async fn reconcile(&self) {
        self.inner.reconcile().await;
    }

    fn export_connections(&self) -> Vec<ExportedConnection> {
        self.inner.export_connections()
    }

    async fn import_connections(&self, connections: Vec<ExportedConnection>) {
        self.inner.import_connections(connections).await;
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[test]
    fn test_priming_withholds_other_users_targeted_events() {
        let history = EventHistory::new(10, chrono::Duration::hours(1));
        let alice = "alice".to_string();
        let bob = "bob".to_string();
        history.record(
            &Event::new("notification", json!({"msg": "private"})),
            Some(&alice),
        );
        history.record(&Event::new("announcement", json!({"msg": "public"})), None);

        let (tx, mut rx) = mpsc::unbounded_channel();
        prime_connection(&history, &bob, &tx);
        drop(tx);

        let frame = rx.try_recv().unwrap();
        assert!(frame.contains("event: announcement\n"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_priming_replays_own_targeted_events() {
        let history = EventHistory::new(10, chrono::Duration::hours(1));
        let alice = "alice".to_string();
        history.record(
            &Event::new("notification", json!({"msg": "private"})),
            Some(&alice),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        prime_connection(&history, &alice, &tx);
        drop(tx);

        let frame = rx.try_recv().unwrap();
        assert!(frame.contains("event: notification\n"));
    }

    #[test]
    fn test_priming_stops_on_closed_stream() {
        let history = EventHistory::new(10, chrono::Duration::hours(1));
        history.record(&Event::new("announcement", json!({})), None);

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        drop(rx);
        prime_connection(&history, &"alice".to_string(), &tx);
    }
}

//! In-process delivery backend: the always-available last resort.
//!
//! No shared store, no fan-out. Events reach the connections this process
//! holds and nothing else; offline messages queue in memory and do not
//! survive a restart. Construction cannot fail, which is what makes it the
//! terminal fallback in the selection order.

use crate::connection::{
    ConnectionId, ConnectionMetadata, ConnectionRegistry, ExportedConnection, FrameSender,
};
use crate::error::{ErrorKind, Result};
use crate::handler::{
    EventHandler, HandlerKind, HandlerStatus, PerformanceStats, SweepThresholds,
};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::offline::{MemoryOfflineStore, OfflineQueueSettings, OfflineStore};
use crate::wire;
use async_trait::async_trait;
use events::{Event, SendOptions, UserId};
use log::*;
use std::sync::Arc;
use std::time::Instant;

pub struct InProcessHandler {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<MetricsCollector>,
    offline: MemoryOfflineStore,
    started_at: Instant,
}

impl InProcessHandler {
    pub fn new(metrics: Arc<MetricsCollector>, offline_settings: OfflineQueueSettings) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            metrics,
            offline: MemoryOfflineStore::new(offline_settings),
            started_at: Instant::now(),
        }
    }

    fn performance(&self) -> PerformanceStats {
        PerformanceStats {
            throughput: self.metrics.throughput(),
            avg_latency_ms: self.metrics.average_latency_ms(),
            error_rate: self.metrics.error_rate(),
        }
    }
}

/// Replays a drained offline queue to the user's local connections, oldest
/// first. Shared by every backend: replay is always local-only so it never
/// echoes through fan-out.
pub(crate) fn replay_offline(
    registry: &ConnectionRegistry,
    metrics: &MetricsCollector,
    user_id: &UserId,
    queued: Vec<Event>,
) {
    if queued.is_empty() {
        return;
    }
    info!(
        "Replaying {} queued event(s) to user {}",
        queued.len(),
        user_id
    );
    for event in queued {
        match wire::frame_event(&event) {
            Ok(frame) => {
                let outcome = registry.send_to_user(user_id, &frame);
                metrics.record_event(&event.event_type, Some(user_id));
                for _ in 0..outcome.failed {
                    metrics.record_error(&ErrorKind::TransportWrite);
                }
            }
            Err(e) => {
                warn!("Queued event {} failed framing: {e}", event.id);
                metrics.record_error(&e.error_kind);
            }
        }
    }
}

#[async_trait]
impl EventHandler for InProcessHandler {
    async fn add_client(
        &self,
        id: ConnectionId,
        user_id: UserId,
        sender: FrameSender,
        metadata: ConnectionMetadata,
    ) -> Result<()> {
        self.registry
            .register(id, user_id.clone(), sender, metadata);
        self.metrics.record_connection_opened(&user_id);

        let queued = self.offline.drain(&user_id).await?;
        replay_offline(&self.registry, &self.metrics, &user_id, queued);
        Ok(())
    }

    async fn remove_client(&self, id: &ConnectionId) {
        if let Some(user_id) = self.registry.unregister(id) {
            self.metrics.record_connection_closed(&user_id);
        }
    }

    async fn send_to_user(
        &self,
        user_id: &UserId,
        event: Event,
        _options: SendOptions,
    ) -> Result<usize> {
        let started = Instant::now();
        let frame = wire::frame_event(&event)?;
        let outcome = self.registry.send_to_user(user_id, &frame);

        self.metrics.record_event(&event.event_type, Some(user_id));
        for _ in 0..outcome.failed {
            self.metrics.record_error(&ErrorKind::TransportWrite);
        }

        // No peers to consult: zero local recipients means offline.
        if outcome.delivered == 0 {
            self.offline.enqueue(user_id, &event).await?;
        }

        self.metrics.record_latency(started.elapsed());
        Ok(outcome.delivered)
    }

    async fn broadcast(&self, event: Event, _options: SendOptions) -> Result<usize> {
        let started = Instant::now();
        let frame = wire::frame_event(&event)?;
        let outcome = self.registry.broadcast(&frame);

        self.metrics.record_event(&event.event_type, None);
        for _ in 0..outcome.failed {
            self.metrics.record_error(&ErrorKind::TransportWrite);
        }
        self.metrics.record_latency(started.elapsed());
        Ok(outcome.delivered)
    }

    async fn update_activity(&self, id: &ConnectionId) {
        self.registry.touch(id);
    }

    fn status(&self) -> HandlerStatus {
        HandlerStatus {
            kind: HandlerKind::InProcess,
            is_ready: true,
            local_connections: self.registry.connection_count(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            performance: self.performance(),
        }
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn sweep(&self, thresholds: SweepThresholds) -> usize {
        let candidates = self
            .registry
            .sweep_candidates(thresholds.inactivity_timeout, thresholds.max_lifetime);
        let mut evicted = 0;
        for (id, reason) in candidates {
            if let Some(user_id) = self.registry.unregister(&id) {
                debug!(
                    "Swept connection {} of user {} ({:?})",
                    id.as_str(),
                    user_id,
                    reason
                );
                self.metrics.record_connection_closed(&user_id);
                evicted += 1;
            }
        }
        evicted
    }

    async fn reconcile(&self) {
        // Nothing shared to reconcile against.
    }

    fn export_connections(&self) -> Vec<ExportedConnection> {
        self.registry.export()
    }

    async fn import_connections(&self, connections: Vec<ExportedConnection>) {
        for conn in connections {
            self.registry
                .register(conn.id, conn.user_id.clone(), conn.sender, conn.metadata);
            self.metrics.record_connection_opened(&conn.user_id);
        }
    }

    async fn shutdown(&self) {
        debug!("In-process backend shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn handler() -> InProcessHandler {
        InProcessHandler::new(
            Arc::new(MetricsCollector::new(Duration::from_secs(3600))),
            OfflineQueueSettings::default(),
        )
    }

    async fn connect(
        handler: &InProcessHandler,
        user: &str,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        handler
            .add_client(
                id.clone(),
                user.to_string(),
                tx,
                ConnectionMetadata::default(),
            )
            .await
            .unwrap();
        (id, rx)
    }

    #[tokio::test]
    async fn test_send_to_connected_user_delivers_frame() {
        let handler = handler();
        let (_id, mut rx) = connect(&handler, "u1").await;

        let delivered = handler
            .send_to_user(
                &"u1".to_string(),
                Event::new("notification", json!({"msg": "hi"})),
                SendOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(delivered, 1);

        let frame = rx.try_recv().unwrap();
        assert!(frame.starts_with("event: notification\n"));
        assert!(frame.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn test_offline_events_replay_on_connect_in_order() {
        let handler = handler();
        let user = "u1".to_string();

        for i in 0..3 {
            let delivered = handler
                .send_to_user(
                    &user,
                    Event::new("notification", json!({ "seq": i })),
                    SendOptions::default(),
                )
                .await
                .unwrap();
            assert_eq!(delivered, 0);
        }

        let (_id, mut rx) = connect(&handler, "u1").await;
        for i in 0..3 {
            let frame = rx.try_recv().unwrap();
            assert!(frame.contains(&format!("\"seq\":{i}")), "frame: {frame}");
        }
        assert!(rx.try_recv().is_err());

        // Queue was deleted by the replay.
        let (_id2, mut rx2) = connect(&handler, "u1").await;
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_counts_local_recipients() {
        let handler = handler();
        let (_a, mut rx_a) = connect(&handler, "u1").await;
        let (_b, mut rx_b) = connect(&handler, "u2").await;

        let delivered = handler
            .broadcast(Event::new("ping", json!({})), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(delivered, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_remove_client_is_idempotent() {
        let handler = handler();
        let (id, _rx) = connect(&handler, "u1").await;
        handler.remove_client(&id).await;
        handler.remove_client(&id).await;
        assert_eq!(handler.status().local_connections, 0);
        assert_eq!(handler.metrics_snapshot().active_connections, 0);
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_connections() {
        let handler = handler();
        let (_idle, _rx_a) = connect(&handler, "u1").await;
        let (fresh, _rx_b) = connect(&handler, "u2").await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        handler.update_activity(&fresh).await;

        let evicted = handler
            .sweep(SweepThresholds {
                inactivity_timeout: Duration::from_millis(20),
                max_lifetime: Duration::from_secs(3600),
            })
            .await;
        assert_eq!(evicted, 1);
        assert_eq!(handler.status().local_connections, 1);
    }

    #[tokio::test]
    async fn test_import_carries_connections_across_backends() {
        let first = handler();
        let (_id, mut rx) = connect(&first, "u1").await;

        let second = handler();
        second.import_connections(first.export_connections()).await;

        rx.try_recv().ok(); // drain nothing; stream is shared

        let delivered = second
            .send_to_user(
                &"u1".to_string(),
                Event::new("notification", json!({"msg": "after switch"})),
                SendOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(rx.try_recv().unwrap().contains("after switch"));
    }

    #[tokio::test]
    async fn test_status_reports_kind_and_readiness() {
        let handler = handler();
        let status = handler.status();
        assert_eq!(status.kind, HandlerKind::InProcess);
        assert!(status.is_ready);
        assert_eq!(status.local_connections, 0);
    }
}

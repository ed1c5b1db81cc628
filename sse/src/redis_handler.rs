//! Shared-store delivery backend.
//!
//! Local dispatch stays in the process-local registry; Redis carries the
//! fleet-wide bookkeeping: pub/sub fan-out to peer instances, per-user
//! connection counters under `pulse:conn:<user>`, and the offline queues.
//! Local delivery is authoritative and never blocked by store trouble;
//! everything shared is best-effort with its own recovery.

use crate::connection::{
    ConnectionId, ConnectionMetadata, ConnectionRegistry, ExportedConnection, FrameSender,
};
use crate::error::{Error, ErrorKind, Result};
use crate::fanout::FanoutBridge;
use crate::handler::{
    EventHandler, HandlerKind, HandlerStatus, PerformanceStats, SweepThresholds,
};
use crate::local_handler::replay_offline;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::offline::{OfflineQueueSettings, OfflineStore, RedisOfflineStore};
use crate::wire;
use async_trait::async_trait;
use events::{FanoutMessage, FanoutPolicy, Event, SendOptions, UserId};
use log::*;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Instant;

const CONN_KEY_PREFIX: &str = "pulse:conn:";
/// Counters self-heal via TTL if an instance dies without decrementing.
const CONN_KEY_TTL_SECS: i64 = 86_400;

fn conn_key(user_id: &UserId) -> String {
    format!("{CONN_KEY_PREFIX}{user_id}")
}

pub struct SharedStoreHandler {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<MetricsCollector>,
    bridge: FanoutBridge,
    offline: RedisOfflineStore,
    redis: redis::aio::ConnectionManager,
    started_at: Instant,
}

impl SharedStoreHandler {
    /// Connects to the shared store and starts the fan-out bridge. An
    /// unreachable store fails construction so selection can fall through.
    pub async fn connect(
        redis_url: &str,
        metrics: Arc<MetricsCollector>,
        offline_settings: OfflineQueueSettings,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis = client.get_connection_manager().await?;

        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = FanoutBridge::connect(redis_url, registry.clone(), metrics.clone()).await?;

        info!("Shared-store backend connected to {redis_url}");
        Ok(Self {
            registry,
            metrics,
            offline: RedisOfflineStore::new(redis.clone(), offline_settings),
            bridge,
            redis,
            started_at: Instant::now(),
        })
    }

    pub fn instance_id(&self) -> &str {
        self.bridge.instance_id()
    }

    async fn increment_counter(&self, user_id: &UserId) {
        let mut conn = self.redis.clone();
        let key = conn_key(user_id);
        let result: redis::RedisResult<()> = redis::pipe()
            .incr(&key, 1)
            .ignore()
            .expire(&key, CONN_KEY_TTL_SECS)
            .ignore()
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!("Failed to increment connection counter for {user_id}: {e}");
            self.metrics.record_error(&ErrorKind::StoreUnavailable);
        }
    }

    async fn decrement_counter(&self, user_id: &UserId) {
        let mut conn = self.redis.clone();
        let key = conn_key(user_id);
        match conn.decr::<_, _, i64>(&key, 1).await {
            Ok(remaining) if remaining <= 0 => {
                // Floor at zero; a stray DECR must not leave negative state.
                if let Err(e) = conn.del::<_, ()>(&key).await {
                    warn!("Failed to clear connection counter for {user_id}: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to decrement connection counter for {user_id}: {e}");
                self.metrics.record_error(&ErrorKind::StoreUnavailable);
            }
        }
    }

    /// Fleet-wide connection count for a user, from the shared counter.
    async fn fleet_connection_count(&self, user_id: &UserId) -> Result<usize> {
        let mut conn = self.redis.clone();
        let count: Option<i64> = conn
            .get(conn_key(user_id))
            .await
            .map_err(|e| Error::with_source(ErrorKind::StoreUnavailable, e))?;
        Ok(count.unwrap_or(0).max(0) as usize)
    }

    /// Queues an event when nobody in the fleet can take it. A failed
    /// counter read queues anyway: redundant delivery beats a lost message,
    /// and clients deduplicate by event id.
    async fn enqueue_if_fleet_offline(&self, user_id: &UserId, event: &Event) -> Result<()> {
        let fleet_offline = match self.fleet_connection_count(user_id).await {
            Ok(count) => count == 0,
            Err(e) => {
                warn!("Counter read failed for {user_id} ({e}); queueing offline anyway");
                self.metrics.record_error(&ErrorKind::StoreUnavailable);
                true
            }
        };
        if fleet_offline {
            self.offline.enqueue(user_id, event).await?;
        }
        Ok(())
    }

    fn performance(&self) -> PerformanceStats {
        PerformanceStats {
            throughput: self.metrics.throughput(),
            avg_latency_ms: self.metrics.average_latency_ms(),
            error_rate: self.metrics.error_rate(),
        }
    }
}

#[async_trait]
impl EventHandler for SharedStoreHandler {
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
        self.increment_counter(&user_id).await;

        // Replay before the first live event can interleave.
        match self.offline.drain(&user_id).await {
            Ok(queued) => replay_offline(&self.registry, &self.metrics, &user_id, queued),
            Err(e) => {
                warn!("Offline drain failed for {user_id}: {e}");
                self.metrics.record_error(&e.error_kind);
            }
        }
        Ok(())
    }

    async fn remove_client(&self, id: &ConnectionId) {
        if let Some(user_id) = self.registry.unregister(id) {
            self.metrics.record_connection_closed(&user_id);
            self.decrement_counter(&user_id).await;
        }
    }

    async fn send_to_user(
        &self,
        user_id: &UserId,
        event: Event,
        options: SendOptions,
    ) -> Result<usize> {
        let started = Instant::now();
        let frame = wire::frame_event(&event)?;
        let outcome = self.registry.send_to_user(user_id, &frame);

        self.metrics.record_event(&event.event_type, Some(user_id));
        for _ in 0..outcome.failed {
            self.metrics.record_error(&ErrorKind::TransportWrite);
        }

        if options.fanout == FanoutPolicy::Publish {
            self.bridge.publish(FanoutMessage::targeted(
                self.bridge.instance_id(),
                user_id.clone(),
                event.clone(),
            ));
        }

        if outcome.delivered == 0 {
            self.enqueue_if_fleet_offline(user_id, &event).await?;
        }

        self.metrics.record_latency(started.elapsed());
        Ok(outcome.delivered)
    }

    async fn broadcast(&self, event: Event, options: SendOptions) -> Result<usize> {
        let started = Instant::now();
        let frame = wire::frame_event(&event)?;
        let outcome = self.registry.broadcast(&frame);

        self.metrics.record_event(&event.event_type, None);
        for _ in 0..outcome.failed {
            self.metrics.record_error(&ErrorKind::TransportWrite);
        }

        if options.fanout == FanoutPolicy::Publish {
            self.bridge
                .publish(FanoutMessage::broadcast(self.bridge.instance_id(), event));
        }

        self.metrics.record_latency(started.elapsed());
        Ok(outcome.delivered)
    }

    async fn update_activity(&self, id: &ConnectionId) {
        self.registry.touch(id);
    }

    fn status(&self) -> HandlerStatus {
        HandlerStatus {
            kind: HandlerKind::SharedStore,
            is_ready: self.bridge.is_connected(),
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
                self.decrement_counter(&user_id).await;
                evicted += 1;
            }
        }
        evicted
    }

    /// Repairs counter drift for locally connected users: a shared counter
    /// must never report fewer connections than this process alone holds,
    /// and live counters get their TTL refreshed. Counters at zero or below
    /// anywhere in the fleet are deleted so stale per-user keys do not
    /// accumulate.
    async fn reconcile(&self) {
        let mut conn = self.redis.clone();

        let keys: Vec<String> = {
            let mut iter = match conn
                .scan_match::<_, String>(format!("{CONN_KEY_PREFIX}*"))
                .await
            {
                Ok(iter) => iter,
                Err(e) => {
                    warn!("Reconcile counter scan failed: {e}");
                    self.metrics.record_error(&ErrorKind::StoreUnavailable);
                    return;
                }
            };
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        for key in keys {
            match conn.get::<_, Option<i64>>(&key).await {
                Ok(Some(count)) if count <= 0 => {
                    debug!("Reconcile deleting drained counter {key}");
                    if let Err(e) = conn.del::<_, ()>(&key).await {
                        warn!("Reconcile delete of {key} failed: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Reconcile read of {key} failed: {e}");
                    self.metrics.record_error(&ErrorKind::StoreUnavailable);
                    return;
                }
            }
        }

        for user_id in self.registry.connected_users() {
            let local = self.registry.user_connection_count(&user_id) as i64;
            let key = conn_key(&user_id);
            let shared: i64 = match conn.get::<_, Option<i64>>(&key).await {
                Ok(value) => value.unwrap_or(0),
                Err(e) => {
                    warn!("Reconcile read failed for {user_id}: {e}");
                    self.metrics.record_error(&ErrorKind::StoreUnavailable);
                    return;
                }
            };

            let result: redis::RedisResult<()> = if shared < local {
                debug!("Raising connection counter for {user_id}: {shared} -> {local}");
                redis::pipe()
                    .set(&key, local)
                    .ignore()
                    .expire(&key, CONN_KEY_TTL_SECS)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            } else {
                conn.expire(&key, CONN_KEY_TTL_SECS).await
            };
            if let Err(e) = result {
                warn!("Reconcile write failed for {user_id}: {e}");
                self.metrics.record_error(&ErrorKind::StoreUnavailable);
            }
        }
    }

    fn export_connections(&self) -> Vec<ExportedConnection> {
        self.registry.export()
    }

    async fn import_connections(&self, connections: Vec<ExportedConnection>) {
        for conn in connections {
            let user_id = conn.user_id.clone();
            self.registry
                .register(conn.id, conn.user_id, conn.sender, conn.metadata);
            self.metrics.record_connection_opened(&user_id);
            self.increment_counter(&user_id).await;
        }
    }

    async fn shutdown(&self) {
        // Release our share of the fleet counters before stopping fan-out.
        for user_id in self.registry.connected_users() {
            for _ in 0..self.registry.user_connection_count(&user_id) {
                self.decrement_counter(&user_id).await;
            }
        }
        self.bridge.shutdown();
        info!("Shared-store backend shut down");
    }
}

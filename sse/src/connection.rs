//! Connection registry and local dispatch.
//!
//! The registry is strictly process-local: it owns the write handles for the
//! streams this process serves and is never replicated. Cross-instance
//! visibility happens through counters and queued messages in the shared
//! store, not by sharing this table.

use dashmap::DashMap;
use events::UserId;
use log::*;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

/// Write-only handle for one connection's transport. Frames are pre-rendered
/// SSE text; the HTTP layer just forwards them to the response body.
pub type FrameSender = UnboundedSender<String>;

/// Unique identifier for a connection (server-generated, unique per process).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Arbitrary per-connection context supplied at stream open.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetadata {
    pub role: Option<String>,
    pub client_kind: Option<String>,
    pub origin: Option<String>,
}

/// Registry entry. `last_activity` moves forward on every successful write
/// and on explicit heartbeat touches; the lifecycle sweep reads both
/// timestamps.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub user_id: UserId,
    pub sender: FrameSender,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub metadata: ConnectionMetadata,
}

/// Outcome of a local dispatch call. `delivered` is the count callers see;
/// `failed` feeds the transport-write-failure metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub delivered: usize,
    pub failed: usize,
}

/// A connection exported for best-effort migration between backends within
/// the same process. The write handle is cloneable, so the stream survives a
/// handler switch as long as the import happens before eviction.
#[derive(Debug, Clone)]
pub struct ExportedConnection {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub sender: FrameSender,
    pub metadata: ConnectionMetadata,
}

/// Dual-index registry: O(1) by connection id for lifecycle operations, O(1)
/// by user id for routing.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionInfo>,
    user_index: DashMap<UserId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            user_index: DashMap::new(),
        }
    }

    /// Registers a connection under the given id. A duplicate id overwrites
    /// the previous entry (the old write handle is dropped, which ends that
    /// stream).
    pub fn register(
        &self,
        id: ConnectionId,
        user_id: UserId,
        sender: FrameSender,
        metadata: ConnectionMetadata,
    ) {
        let now = Instant::now();
        if let Some(previous) = self.connections.insert(
            id.clone(),
            ConnectionInfo {
                user_id: user_id.clone(),
                sender,
                connected_at: now,
                last_activity: now,
                metadata,
            },
        ) {
            warn!(
                "Connection id {} re-registered; previous stream dropped",
                id.as_str()
            );
            self.remove_from_user_index(&previous.user_id, &id);
        }

        self.user_index.entry(user_id).or_default().insert(id);
    }

    /// Removes a connection. Idempotent: unknown ids are a no-op. Returns the
    /// owning user id when an entry was actually removed.
    pub fn unregister(&self, id: &ConnectionId) -> Option<UserId> {
        let (_, info) = self.connections.remove(id)?;
        self.remove_from_user_index(&info.user_id, id);
        Some(info.user_id)
    }

    fn remove_from_user_index(&self, user_id: &UserId, id: &ConnectionId) {
        if let Some(mut entry) = self.user_index.get_mut(user_id) {
            entry.remove(id);
            if entry.is_empty() {
                drop(entry); // release the shard lock before removal
                self.user_index.remove(user_id);
            }
        }
    }

    /// Refreshes last-activity for an explicit heartbeat. Returns false for
    /// unknown ids.
    pub fn touch(&self, id: &ConnectionId) -> bool {
        match self.connections.get_mut(id) {
            Some(mut info) => {
                info.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Writes a frame to every live connection of one user. A failed write is
    /// logged and counted but does not abort the remaining deliveries, and
    /// the failing connection stays registered: the sweep evicts it once it
    /// times out, which avoids racing a transport that merely hiccuped.
    pub fn send_to_user(&self, user_id: &UserId, frame: &str) -> DeliveryOutcome {
        let ids: Vec<ConnectionId> = match self.user_index.get(user_id) {
            Some(entry) => entry.iter().cloned().collect(),
            None => return DeliveryOutcome::default(),
        };

        let mut outcome = DeliveryOutcome::default();
        for id in ids {
            self.write_frame(&id, frame, &mut outcome);
        }
        outcome
    }

    /// Writes a frame to every live connection in the process.
    pub fn broadcast(&self, frame: &str) -> DeliveryOutcome {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        let mut outcome = DeliveryOutcome::default();
        for id in ids {
            self.write_frame(&id, frame, &mut outcome);
        }
        outcome
    }

    fn write_frame(&self, id: &ConnectionId, frame: &str, outcome: &mut DeliveryOutcome) {
        if let Some(mut info) = self.connections.get_mut(id) {
            match info.sender.send(frame.to_string()) {
                Ok(()) => {
                    info.last_activity = Instant::now();
                    outcome.delivered += 1;
                }
                Err(e) => {
                    warn!(
                        "Failed to write to connection {}: {}. Leaving it for the lifecycle sweep.",
                        id.as_str(),
                        e
                    );
                    outcome.failed += 1;
                }
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_connection_count(&self, user_id: &UserId) -> usize {
        self.user_index
            .get(user_id)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    /// Connection ids whose inactivity or total age exceeds the given
    /// thresholds, paired with the reason they qualify.
    pub fn sweep_candidates(
        &self,
        inactivity_timeout: Duration,
        max_lifetime: Duration,
    ) -> Vec<(ConnectionId, SweepReason)> {
        let now = Instant::now();
        self.connections
            .iter()
            .filter_map(|entry| {
                if now.duration_since(entry.last_activity) > inactivity_timeout {
                    Some((entry.key().clone(), SweepReason::Idle))
                } else if now.duration_since(entry.connected_at) > max_lifetime {
                    Some((entry.key().clone(), SweepReason::MaxLifetime))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Snapshot of all connections for handler migration.
    pub fn export(&self) -> Vec<ExportedConnection> {
        self.connections
            .iter()
            .map(|entry| ExportedConnection {
                id: entry.key().clone(),
                user_id: entry.user_id.clone(),
                sender: entry.sender.clone(),
                metadata: entry.metadata.clone(),
            })
            .collect()
    }

    /// User ids currently holding at least one connection.
    pub fn connected_users(&self) -> Vec<UserId> {
        self.user_index.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the sweep selected a connection for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepReason {
    Idle,
    MaxLifetime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn channel() -> (FrameSender, mpsc::UnboundedReceiver<String>) {
        mpsc::unbounded_channel()
    }

    fn register(
        registry: &ConnectionRegistry,
        user: &str,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = channel();
        let id = ConnectionId::new();
        registry.register(
            id.clone(),
            user.to_string(),
            tx,
            ConnectionMetadata::default(),
        );
        (id, rx)
    }

    #[test]
    fn test_count_tracks_register_and_unregister() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = register(&registry, "u1");
        let (b, _rx_b) = register(&registry, "u1");
        let (_c, _rx_c) = register(&registry, "u2");
        assert_eq!(registry.connection_count(), 3);
        assert_eq!(registry.user_connection_count(&"u1".to_string()), 2);

        registry.unregister(&a);
        registry.unregister(&b);
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.user_connection_count(&"u1".to_string()), 0);
    }

    #[test]
    fn test_unregister_absent_id_is_noop() {
        let registry = ConnectionRegistry::new();
        let (_a, _rx) = register(&registry, "u1");
        let ghost = ConnectionId::new();
        assert!(registry.unregister(&ghost).is_none());
        assert!(registry.unregister(&ghost).is_none());
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_duplicate_id_overwrites() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new();
        let (tx1, _rx1) = channel();
        let (tx2, mut rx2) = channel();
        registry.register(
            id.clone(),
            "u1".to_string(),
            tx1,
            ConnectionMetadata::default(),
        );
        registry.register(
            id.clone(),
            "u2".to_string(),
            tx2,
            ConnectionMetadata::default(),
        );

        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.user_connection_count(&"u1".to_string()), 0);
        assert_eq!(registry.user_connection_count(&"u2".to_string()), 1);

        let outcome = registry.send_to_user(&"u2".to_string(), "frame");
        assert_eq!(outcome.delivered, 1);
        assert_eq!(rx2.try_recv().unwrap(), "frame");
    }

    #[test]
    fn test_send_to_user_delivers_to_each_connection_once() {
        let registry = ConnectionRegistry::new();
        let (_a, mut rx_a) = register(&registry, "u1");
        let (_b, mut rx_b) = register(&registry, "u1");
        let (_c, mut rx_c) = register(&registry, "u2");

        let outcome = registry.send_to_user(&"u1".to_string(), "hello");
        assert_eq!(
            outcome,
            DeliveryOutcome {
                delivered: 2,
                failed: 0
            }
        );
        assert_eq!(rx_a.try_recv().unwrap(), "hello");
        assert_eq!(rx_b.try_recv().unwrap(), "hello");
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn test_send_to_unknown_user_returns_zero() {
        let registry = ConnectionRegistry::new();
        let outcome = registry.send_to_user(&"nobody".to_string(), "hello");
        assert_eq!(outcome.delivered, 0);
    }

    #[test]
    fn test_failed_write_does_not_abort_others_or_evict() {
        let registry = ConnectionRegistry::new();
        let (_a, rx_a) = register(&registry, "u1");
        let (_b, mut rx_b) = register(&registry, "u1");
        drop(rx_a); // closes one transport

        let outcome = registry.send_to_user(&"u1".to_string(), "hello");
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(rx_b.try_recv().unwrap(), "hello");
        // The failed connection stays registered for the sweep to evict.
        assert_eq!(registry.connection_count(), 2);
    }

    #[test]
    fn test_broadcast_reaches_all_connections() {
        let registry = ConnectionRegistry::new();
        let (_a, mut rx_a) = register(&registry, "u1");
        let (_b, mut rx_b) = register(&registry, "u2");

        let outcome = registry.broadcast("news");
        assert_eq!(outcome.delivered, 2);
        assert_eq!(rx_a.try_recv().unwrap(), "news");
        assert_eq!(rx_b.try_recv().unwrap(), "news");
    }

    #[test]
    fn test_sweep_candidates_idle_vs_refreshed() {
        let registry = ConnectionRegistry::new();
        let (idle, _rx_a) = register(&registry, "u1");
        let (fresh, _rx_b) = register(&registry, "u2");

        std::thread::sleep(Duration::from_millis(30));
        registry.touch(&fresh);

        let candidates =
            registry.sweep_candidates(Duration::from_millis(20), Duration::from_secs(3600));
        let ids: Vec<&ConnectionId> = candidates.iter().map(|(id, _)| id).collect();
        assert!(ids.contains(&&idle));
        assert!(!ids.contains(&&fresh));
        assert_eq!(candidates[0].1, SweepReason::Idle);
    }

    #[test]
    fn test_sweep_max_lifetime_evicts_even_active_connections() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = register(&registry, "u1");
        std::thread::sleep(Duration::from_millis(30));
        registry.touch(&id); // activity-fresh, but over-age

        let candidates =
            registry.sweep_candidates(Duration::from_secs(3600), Duration::from_millis(20));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].1, SweepReason::MaxLifetime);
    }

    #[test]
    fn test_activity_refreshed_connection_outlives_inactivity_threshold() {
        // Age exceeds the inactivity threshold, but activity does not.
        let registry = ConnectionRegistry::new();
        let (id, _rx) = register(&registry, "u1");
        std::thread::sleep(Duration::from_millis(30));
        registry.touch(&id);

        let candidates =
            registry.sweep_candidates(Duration::from_millis(25), Duration::from_secs(3600));
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_export_snapshots_live_connections() {
        let registry = ConnectionRegistry::new();
        let (_a, _rx_a) = register(&registry, "u1");
        let (_b, _rx_b) = register(&registry, "u2");

        let exported = registry.export();
        assert_eq!(exported.len(), 2);
        let mut users: Vec<String> = exported.iter().map(|e| e.user_id.clone()).collect();
        users.sort();
        assert_eq!(users, vec!["u1".to_string(), "u2".to_string()]);
    }
}

//! The capability contract every delivery backend implements, plus the
//! status types reported through `getStatus()`.
//!
//! Backends are selected and swapped through the `selector` module; callers
//! only ever see `Arc<dyn EventHandler>`. No implementation inheritance:
//! shared behavior lives in the registry, stores, and metrics the backends
//! compose.

use crate::connection::{ConnectionId, ConnectionMetadata, ExportedConnection, FrameSender};
use crate::error::Result;
use crate::metrics::MetricsSnapshot;
use async_trait::async_trait;
use events::{Event, SendOptions, UserId};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The interchangeable backend kinds, in default preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandlerKind {
    /// Single-instance delivery, no shared store. Always constructible;
    /// the last-resort fallback.
    InProcess,
    /// Redis-backed fan-out, offline queue and fleet counters.
    SharedStore,
    /// SharedStore plus circuit breaking, recent-history priming and
    /// performance reporting.
    EnhancedSharedStore,
}

impl HandlerKind {
    /// Default preference order, best first. The in-process backend is
    /// always last so the subsystem degrades to single-instance delivery
    /// instead of failing outright.
    pub fn preference_order(preferred: HandlerKind) -> Vec<HandlerKind> {
        if preferred == HandlerKind::InProcess {
            return vec![HandlerKind::InProcess];
        }
        let mut order = vec![preferred];
        for kind in [HandlerKind::EnhancedSharedStore, HandlerKind::SharedStore] {
            if kind != preferred {
                order.push(kind);
            }
        }
        order.push(HandlerKind::InProcess);
        order
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandlerKind::InProcess => write!(f, "in-process"),
            HandlerKind::SharedStore => write!(f, "shared-store"),
            HandlerKind::EnhancedSharedStore => write!(f, "enhanced-shared-store"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct HandlerKindParseError;

impl FromStr for HandlerKind {
    type Err = HandlerKindParseError;
    fn from_str(kind: &str) -> std::result::Result<HandlerKind, Self::Err> {
        match kind.to_lowercase().as_str() {
            "in-process" | "memory" => Ok(HandlerKind::InProcess),
            "shared-store" | "redis" => Ok(HandlerKind::SharedStore),
            "enhanced-shared-store" | "enhanced" => Ok(HandlerKind::EnhancedSharedStore),
            _ => Err(HandlerKindParseError),
        }
    }
}

/// Dispatch performance figures, recomputed on demand.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceStats {
    /// Events per second over the current metrics window.
    pub throughput: f64,
    pub avg_latency_ms: f64,
    /// Errors per recorded event over the current metrics window.
    pub error_rate: f64,
}

/// Point-in-time backend status. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerStatus {
    pub kind: HandlerKind,
    pub is_ready: bool,
    pub local_connections: usize,
    pub uptime_secs: u64,
    pub performance: PerformanceStats,
}

/// Eviction thresholds applied by the lifecycle sweep.
#[derive(Debug, Clone, Copy)]
pub struct SweepThresholds {
    pub inactivity_timeout: Duration,
    pub max_lifetime: Duration,
}

/// The mandatory operation set of a delivery backend.
///
/// `send_to_user` and `broadcast` return the **local** delivery count; 0 is
/// a valid result meaning "no local recipient" (the event may still have
/// been fanned out or queued). Fan-out and persistence failures are
/// recovered internally and never abort local delivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Registers a connection and replays any queued offline messages for
    /// the user (oldest first, local-only, queue deleted afterwards).
    async fn add_client(
        &self,
        id: ConnectionId,
        user_id: UserId,
        sender: FrameSender,
        metadata: ConnectionMetadata,
    ) -> Result<()>;

    /// Deregisters a connection. Idempotent.
    async fn remove_client(&self, id: &ConnectionId);

    /// Frames and delivers an event to the user's local connections,
    /// fanning out / queueing offline according to `options`.
    async fn send_to_user(
        &self,
        user_id: &UserId,
        event: Event,
        options: SendOptions,
    ) -> Result<usize>;

    /// Frames and delivers an event to every local connection, fanning out
    /// according to `options`.
    async fn broadcast(&self, event: Event, options: SendOptions) -> Result<usize>;

    /// Explicit heartbeat: refreshes the connection's last-activity time.
    async fn update_activity(&self, id: &ConnectionId);

    fn status(&self) -> HandlerStatus;

    fn metrics_snapshot(&self) -> MetricsSnapshot;

    /// Evicts idle and over-age connections; returns how many were removed.
    async fn sweep(&self, thresholds: SweepThresholds) -> usize;

    /// Heavier reconciliation against shared bookkeeping. No-op for
    /// backends without a shared store.
    async fn reconcile(&self);

    /// Best-effort export of migratable connection state.
    fn export_connections(&self) -> Vec<ExportedConnection>;

    /// Re-imports connections exported from another backend in this
    /// process.
    async fn import_connections(&self, connections: Vec<ExportedConnection>);

    /// Stops background tasks and releases shared-store resources.
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parses_aliases() {
        assert_eq!("redis".parse(), Ok(HandlerKind::SharedStore));
        assert_eq!("enhanced".parse(), Ok(HandlerKind::EnhancedSharedStore));
        assert_eq!("in-process".parse(), Ok(HandlerKind::InProcess));
        assert_eq!("memory".parse(), Ok(HandlerKind::InProcess));
        assert!("carrier-pigeon".parse::<HandlerKind>().is_err());
    }

    #[test]
    fn test_kind_display_roundtrips() {
        for kind in [
            HandlerKind::InProcess,
            HandlerKind::SharedStore,
            HandlerKind::EnhancedSharedStore,
        ] {
            assert_eq!(kind.to_string().parse(), Ok(kind));
        }
    }

    #[test]
    fn test_preference_order_puts_preferred_first_and_in_process_last() {
        let order = HandlerKind::preference_order(HandlerKind::SharedStore);
        assert_eq!(
            order,
            vec![
                HandlerKind::SharedStore,
                HandlerKind::EnhancedSharedStore,
                HandlerKind::InProcess
            ]
        );

        // A preferred in-process backend needs no shared-store fallbacks.
        let order = HandlerKind::preference_order(HandlerKind::InProcess);
        assert_eq!(order, vec![HandlerKind::InProcess]);
    }
}

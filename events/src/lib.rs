//! Core event vocabulary for the Pulse Platform.
//!
//! This crate carries the types shared between the SSE distribution layer,
//! the HTTP surface, and the test client: the event itself, the cross-instance
//! fan-out envelope, the offline queue entry, and the typed dispatch options.
//!
//! It has no dependencies on internal crates, avoiding circular dependencies.
//! Payloads are carried as `serde_json::Value` so producers stay decoupled
//! from the delivery machinery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A user identifier as routed by the distribution layer. The web layer
/// converts whatever identity type the auth collaborator uses to a String.
pub type UserId = String;

/// A server-originated event pushed to browser clients.
///
/// Immutable once constructed. The id is globally unique and assigned at
/// creation; clients deduplicate on it, which is what makes at-least-once
/// delivery tolerable on replays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Suggested client reconnect delay in milliseconds, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_ms: Option<u64>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
            retry_ms: None,
        }
    }

    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry_ms = Some(retry_ms);
        self
    }

    /// Replaces the generated id. Used when replaying an event that already
    /// has an identity (offline queue, fan-out) so dedup keys stay stable.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Whether a dispatch call should be re-published to peer instances.
///
/// Replays (offline queue drains, fan-out deliveries) must use `LocalOnly`
/// or a single event would ping-pong between instances forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanoutPolicy {
    /// Deliver locally and publish to the shared broker for peer instances.
    #[default]
    Publish,
    /// Deliver to local connections only; never hits the broker.
    LocalOnly,
}

/// Options accepted by `send_event_to_user` / `broadcast_event`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub fanout: FanoutPolicy,
}

impl SendOptions {
    pub fn local_only() -> Self {
        Self {
            fanout: FanoutPolicy::LocalOnly,
        }
    }
}

/// Envelope published to the shared broker so peer instances can replay an
/// event into their own local dispatch.
///
/// Invariant: every subscribing instance delivers the envelope except the one
/// whose id equals `origin_instance_id` (echo suppression).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutMessage {
    pub id: String,
    pub origin_instance_id: String,
    /// Absent means broadcast to every connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<UserId>,
    pub event: Event,
    pub published_at: DateTime<Utc>,
}

impl FanoutMessage {
    pub fn targeted(origin_instance_id: impl Into<String>, user_id: UserId, event: Event) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            origin_instance_id: origin_instance_id.into(),
            target_user_id: Some(user_id),
            event,
            published_at: Utc::now(),
        }
    }

    pub fn broadcast(origin_instance_id: impl Into<String>, event: Event) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            origin_instance_id: origin_instance_id.into(),
            target_user_id: None,
            event,
            published_at: Utc::now(),
        }
    }
}

/// One queued message for a user with no live connection anywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineQueueEntry {
    pub user_id: UserId,
    pub event: Event,
    pub enqueued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OfflineQueueEntry {
    pub fn new(user_id: UserId, event: Event, retention: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            event,
            enqueued_at: now,
            expires_at: now + retention,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_new_assigns_unique_ids() {
        let a = Event::new("notification", json!({"msg": "hi"}));
        let b = Event::new("notification", json!({"msg": "hi"}));
        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_event_retry_roundtrips_through_json() {
        let event = Event::new("connected", json!({})).with_retry(3000);
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.retry_ms, Some(3000));
        assert_eq!(back.event_type, "connected");
    }

    #[test]
    fn test_fanout_message_broadcast_has_no_target() {
        let msg = FanoutMessage::broadcast("instance-a", Event::new("ping", json!({})));
        assert!(msg.target_user_id.is_none());
        assert_eq!(msg.origin_instance_id, "instance-a");
    }

    #[test]
    fn test_fanout_message_serializes_without_null_target() {
        let msg = FanoutMessage::broadcast("instance-a", Event::new("ping", json!({})));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("target_user_id"));
    }

    #[test]
    fn test_offline_entry_expiry() {
        let entry = OfflineQueueEntry::new(
            "u1".to_string(),
            Event::new("notification", json!({})),
            chrono::Duration::hours(24),
        );
        assert!(!entry.is_expired(Utc::now()));
        assert!(entry.is_expired(Utc::now() + chrono::Duration::hours(25)));
    }

    #[test]
    fn test_send_options_default_publishes() {
        assert_eq!(SendOptions::default().fanout, FanoutPolicy::Publish);
        assert_eq!(SendOptions::local_only().fanout, FanoutPolicy::LocalOnly);
    }
}

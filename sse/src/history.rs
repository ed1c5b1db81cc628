//! Bounded recent-history cache kept by the enhanced backend.
//!
//! Not durable storage: just the latest few events per type, inside an
//! expiry window, so a freshly (re)connected client can be primed with
//! last-known state before its first live push arrives. Each entry remembers
//! whether it was targeted; priming only ever hands a user broadcasts and
//! that user's own targeted events.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use events::{Event, UserId};
use std::collections::VecDeque;

struct HistoryEntry {
    event: Event,
    /// `None` for broadcasts; `Some` restricts visibility to that user.
    target: Option<UserId>,
}

impl HistoryEntry {
    fn visible_to(&self, user_id: &UserId) -> bool {
        self.target.as_ref().map_or(true, |target| target == user_id)
    }
}

pub struct EventHistory {
    per_type: DashMap<String, VecDeque<HistoryEntry>>,
    max_per_type: usize,
    expiry: Duration,
}

impl EventHistory {
    pub fn new(max_per_type: usize, expiry: Duration) -> Self {
        Self {
            per_type: DashMap::new(),
            max_per_type,
            expiry,
        }
    }

    pub fn record(&self, event: &Event, target: Option<&UserId>) {
        let mut ring = self.per_type.entry(event.event_type.clone()).or_default();
        ring.push_back(HistoryEntry {
            event: event.clone(),
            target: target.cloned(),
        });
        while ring.len() > self.max_per_type {
            ring.pop_front();
        }
    }

    /// The most recent unexpired event of each type that the user may see,
    /// oldest type-entry first. This is the priming set sent to new
    /// connections.
    pub fn latest_per_type(&self, user_id: &UserId) -> Vec<Event> {
        let cutoff = Utc::now() - self.expiry;
        let mut latest: Vec<Event> = self
            .per_type
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .iter()
                    .rev()
                    .find(|e| e.visible_to(user_id) && fresh(e.event.timestamp, cutoff))
                    .map(|e| e.event.clone())
            })
            .collect();
        latest.sort_by_key(|e| e.timestamp);
        latest
    }
}

fn fresh(timestamp: DateTime<Utc>, cutoff: DateTime<Utc>) -> bool {
    timestamp > cutoff
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_targeted_event_is_replayed_only_to_its_user() {
        let history = EventHistory::new(5, Duration::hours(1));
        let alice = "alice".to_string();
        let bob = "bob".to_string();
        history.record(
            &Event::new("notification", json!({"msg": "for alice"})),
            Some(&alice),
        );

        assert!(history.latest_per_type(&bob).is_empty());
        let for_alice = history.latest_per_type(&alice);
        assert_eq!(for_alice.len(), 1);
        assert_eq!(for_alice[0].payload["msg"], "for alice");
    }

    #[test]
    fn test_broadcasts_are_replayed_to_everyone() {
        let history = EventHistory::new(5, Duration::hours(1));
        history.record(&Event::new("announcement", json!({"msg": "all"})), None);

        for user in ["alice", "bob"] {
            let latest = history.latest_per_type(&user.to_string());
            assert_eq!(latest.len(), 1);
            assert_eq!(latest[0].payload["msg"], "all");
        }
    }

    #[test]
    fn test_newest_visible_entry_wins_over_newer_foreign_one() {
        let history = EventHistory::new(5, Duration::hours(1));
        let alice = "alice".to_string();
        let bob = "bob".to_string();
        history.record(&Event::new("notification", json!({"msg": "all"})), None);
        history.record(
            &Event::new("notification", json!({"msg": "for alice"})),
            Some(&alice),
        );

        let for_bob = history.latest_per_type(&bob);
        assert_eq!(for_bob.len(), 1);
        assert_eq!(for_bob[0].payload["msg"], "all");
        assert_eq!(
            history.latest_per_type(&alice)[0].payload["msg"],
            "for alice"
        );
    }

    #[test]
    fn test_ring_evicts_oldest_beyond_capacity() {
        let history = EventHistory::new(2, Duration::hours(1));
        let other = "other".to_string();
        history.record(&Event::new("dashboard_refresh", json!({"seq": 0})), None);
        history.record(&Event::new("dashboard_refresh", json!({"seq": 1})), None);
        history.record(
            &Event::new("dashboard_refresh", json!({"seq": 2})),
            Some(&other),
        );
        history.record(
            &Event::new("dashboard_refresh", json!({"seq": 3})),
            Some(&other),
        );

        // The broadcasts fell out of the ring, so a third user sees nothing.
        assert!(history.latest_per_type(&"me".to_string()).is_empty());
        assert_eq!(history.latest_per_type(&other)[0].payload["seq"], 3);
    }

    #[test]
    fn test_latest_per_type_returns_newest_of_each() {
        let history = EventHistory::new(5, Duration::hours(1));
        history.record(&Event::new("notification", json!({"msg": "old"})), None);
        history.record(&Event::new("notification", json!({"msg": "new"})), None);
        history.record(&Event::new("health", json!({"ok": true})), None);

        let latest = history.latest_per_type(&"u1".to_string());
        assert_eq!(latest.len(), 2);
        let notification = latest
            .iter()
            .find(|e| e.event_type == "notification")
            .unwrap();
        assert_eq!(notification.payload["msg"], "new");
    }

    #[test]
    fn test_expired_events_are_not_replayed() {
        let history = EventHistory::new(5, Duration::milliseconds(0));
        history.record(&Event::new("notification", json!({})), None);
        assert!(history.latest_per_type(&"u1".to_string()).is_empty());
    }
}

//! Offline message store: a bounded, time-limited per-user queue used when a
//! targeted user has no live connection anywhere in the fleet.
//!
//! Delivery from the queue is best-effort-ordered (oldest first) and
//! at-least-once: a crash between replay and deletion redelivers, which is
//! why clients deduplicate by event id.

use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use events::{Event, OfflineQueueEntry, UserId};
use log::*;
use redis::AsyncCommands;
use std::collections::VecDeque;

const OFFLINE_KEY_PREFIX: &str = "pulse:offline:";

/// Queue sizing and retention, from configuration.
#[derive(Debug, Clone, Copy)]
pub struct OfflineQueueSettings {
    /// Maximum entries kept per user; oldest entries are evicted first.
    pub max_len: usize,
    /// How long an entry stays replayable.
    pub retention: chrono::Duration,
}

impl Default for OfflineQueueSettings {
    fn default() -> Self {
        Self {
            max_len: 100,
            retention: chrono::Duration::hours(24),
        }
    }
}

/// Storage seam for the offline queue. The shared-store backends use Redis;
/// the in-process backend keeps a per-user in-memory queue with the same
/// semantics (single-instance only).
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Appends an event, trims to the configured max length (oldest first),
    /// and refreshes the queue's TTL.
    async fn enqueue(&self, user_id: &UserId, event: &Event) -> Result<()>;

    /// Takes the full queue for a user, oldest first, dropping entries past
    /// the retention window. The queue is deleted before this returns.
    async fn drain(&self, user_id: &UserId) -> Result<Vec<Event>>;
}

fn offline_key(user_id: &UserId) -> String {
    format!("{OFFLINE_KEY_PREFIX}{user_id}")
}

/// Redis-backed queue: one list per user under `pulse:offline:<user>`, with
/// a TTL on the whole list. Relies on Redis's own atomicity for RPUSH/LTRIM;
/// no client-side locking.
pub struct RedisOfflineStore {
    redis: redis::aio::ConnectionManager,
    settings: OfflineQueueSettings,
}

impl RedisOfflineStore {
    pub fn new(redis: redis::aio::ConnectionManager, settings: OfflineQueueSettings) -> Self {
        Self { redis, settings }
    }
}

#[async_trait]
impl OfflineStore for RedisOfflineStore {
    async fn enqueue(&self, user_id: &UserId, event: &Event) -> Result<()> {
        let entry =
            OfflineQueueEntry::new(user_id.clone(), event.clone(), self.settings.retention);
        let serialized = serde_json::to_string(&entry)?;
        let key = offline_key(user_id);
        let mut conn = self.redis.clone();

        let ttl_secs = self.settings.retention.num_seconds().max(1);
        redis::pipe()
            .rpush(&key, serialized)
            .ignore()
            .ltrim(&key, -(self.settings.max_len as isize), -1)
            .ignore()
            .expire(&key, ttl_secs)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!("Queued offline event {} for user {}", event.id, user_id);
        Ok(())
    }

    async fn drain(&self, user_id: &UserId) -> Result<Vec<Event>> {
        let key = offline_key(user_id);
        let mut conn = self.redis.clone();

        let raw: Vec<String> = conn.lrange(&key, 0, -1).await?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        let _: () = conn.del(&key).await?;

        let now = Utc::now();
        let mut events = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str::<OfflineQueueEntry>(&item) {
                Ok(entry) if !entry.is_expired(now) => events.push(entry.event),
                Ok(entry) => {
                    debug!(
                        "Dropping expired offline event {} for user {}",
                        entry.event.id, user_id
                    );
                }
                Err(e) => warn!("Discarding unparseable offline entry for {user_id}: {e}"),
            }
        }
        Ok(events)
    }
}

/// In-memory queue with the same trim/TTL semantics, for the in-process
/// backend and for tests.
pub struct MemoryOfflineStore {
    queues: DashMap<UserId, VecDeque<OfflineQueueEntry>>,
    settings: OfflineQueueSettings,
}

impl MemoryOfflineStore {
    pub fn new(settings: OfflineQueueSettings) -> Self {
        Self {
            queues: DashMap::new(),
            settings,
        }
    }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
    async fn enqueue(&self, user_id: &UserId, event: &Event) -> Result<()> {
        let entry =
            OfflineQueueEntry::new(user_id.clone(), event.clone(), self.settings.retention);
        let mut queue = self.queues.entry(user_id.clone()).or_default();
        queue.push_back(entry);
        while queue.len() > self.settings.max_len {
            queue.pop_front();
        }
        Ok(())
    }

    async fn drain(&self, user_id: &UserId) -> Result<Vec<Event>> {
        let Some((_, queue)) = self.queues.remove(user_id) else {
            return Ok(Vec::new());
        };
        let now = Utc::now();
        Ok(queue
            .into_iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.event)
            .collect())
    }
}

//! Client-side event cache, mirroring what the browser keeps between page
//! loads: per-type bounded rings of recent events, deduplicated by event id,
//! persisted as a JSON file and pruned by age on every insert.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEvent {
    pub id: String,
    pub event_type: String,
    pub data: Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventCache {
    max_per_type: usize,
    expiry_minutes: i64,
    rings: HashMap<String, VecDeque<CachedEvent>>,
    seen_ids: HashSet<String>,
}

impl EventCache {
    pub fn new(max_per_type: usize, expiry: Duration) -> Self {
        Self {
            max_per_type,
            expiry_minutes: expiry.num_minutes(),
            rings: HashMap::new(),
            seen_ids: HashSet::new(),
        }
    }

    fn expiry(&self) -> Duration {
        Duration::minutes(self.expiry_minutes)
    }

    /// Inserts an event unless its id was already seen. Returns true when the
    /// event was new. Oldest entries fall off the ring once the per-type cap
    /// is reached.
    pub fn insert(&mut self, event: CachedEvent) -> bool {
        self.prune_expired(Utc::now());

        if !self.seen_ids.insert(event.id.clone()) {
            return false;
        }

        let ring = self.rings.entry(event.event_type.clone()).or_default();
        if ring.len() == self.max_per_type {
            if let Some(evicted) = ring.pop_front() {
                self.seen_ids.remove(&evicted.id);
            }
        }
        ring.push_back(event);
        true
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<&CachedEvent> {
        self.rings
            .get(event_type)
            .map(|ring| ring.iter().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rings.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn prune_expired(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.expiry();
        for ring in self.rings.values_mut() {
            while let Some(front) = ring.front() {
                if front.received_at >= cutoff {
                    break;
                }
                if let Some(evicted) = ring.pop_front() {
                    self.seen_ids.remove(&evicted.id);
                }
            }
        }
        self.rings.retain(|_, ring| !ring.is_empty());
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write event cache to {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event cache from {}", path.display()))?;
        let mut cache: Self = serde_json::from_str(&json)?;
        cache.prune_expired(Utc::now());
        Ok(cache)
    }
}

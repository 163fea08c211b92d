//! In-memory stores for tests/dev.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;

use super::{PrioritySet, StoreError, TtlCache};

fn poisoned() -> StoreError {
    StoreError::Unavailable("in-memory store lock poisoned".to_string())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: JsonValue,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-memory TTL cache. Expired entries read as absent and are dropped on the
/// next write to the same key.
#[derive(Debug, Default)]
pub struct InMemoryTtlCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryTtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining lifetime of a live entry; `Some(Duration::MAX)` when it never
    /// expires, `None` when absent or expired.
    pub fn expires_in(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;
        let now = Instant::now();
        if !entry.is_live(now) {
            return None;
        }
        Some(entry.expires_at.map_or(Duration::MAX, |at| at - now))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TtlCache for InMemoryTtlCache {
    fn fetch(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    fn save(&self, key: &str, value: &JsonValue, ttl: Duration) -> Result<(), StoreError> {
        // A deadline `Instant` cannot represent never expires.
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.remove(key);
        Ok(())
    }
}

/// In-memory priority set. Increments run under one lock, so they are atomic
/// with respect to each other.
#[derive(Debug, Default)]
pub struct InMemoryPrioritySet {
    sets: Mutex<HashMap<String, HashMap<String, i64>>>,
}

impl InMemoryPrioritySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current score of `key`, if present.
    pub fn score(&self, set: &str, key: &str) -> Option<i64> {
        let sets = self.sets.lock().ok()?;
        sets.get(set)?.get(key).copied()
    }
}

impl PrioritySet for InMemoryPrioritySet {
    fn increment_score(&self, set: &str, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut sets = self.sets.lock().map_err(|_| poisoned())?;
        let score = sets
            .entry(set.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert(0);
        *score += delta;
        Ok(*score)
    }

    fn range_by_score_desc(&self, set: &str) -> Result<Vec<(String, i64)>, StoreError> {
        let sets = self.sets.lock().map_err(|_| poisoned())?;
        let mut members: Vec<(String, i64)> = sets
            .get(set)
            .map(|members| members.iter().map(|(k, s)| (k.clone(), *s)).collect())
            .unwrap_or_default();

        // Redis orders equal scores lexicographically; reversed for ZREVRANGE.
        members.sort_by(|(ka, sa), (kb, sb)| sb.cmp(sa).then_with(|| kb.cmp(ka)));
        Ok(members)
    }

    fn remove(&self, set: &str, key: &str) -> Result<(), StoreError> {
        let mut sets = self.sets.lock().map_err(|_| poisoned())?;
        if let Some(members) = sets.get_mut(set) {
            members.remove(key);
        }
        Ok(())
    }
}

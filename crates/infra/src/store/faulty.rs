//! In-memory stores that can be switched off, for fault-path tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value as JsonValue;

use super::{InMemoryPrioritySet, InMemoryTtlCache, PrioritySet, StoreError, TtlCache};

fn check(down: &AtomicBool) -> Result<(), StoreError> {
    if down.load(Ordering::SeqCst) {
        return Err(StoreError::Unavailable("connection refused".to_string()));
    }
    Ok(())
}

/// [`InMemoryTtlCache`] that fails every call while down.
#[derive(Debug, Default)]
pub struct FaultyTtlCache {
    pub inner: InMemoryTtlCache,
    down: AtomicBool,
}

impl FaultyTtlCache {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

impl TtlCache for FaultyTtlCache {
    fn fetch(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
        check(&self.down)?;
        self.inner.fetch(key)
    }

    fn save(&self, key: &str, value: &JsonValue, ttl: Duration) -> Result<(), StoreError> {
        check(&self.down)?;
        self.inner.save(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        check(&self.down)?;
        self.inner.delete(key)
    }
}

/// [`InMemoryPrioritySet`] that fails every call while down.
#[derive(Debug, Default)]
pub struct FaultyPrioritySet {
    pub inner: InMemoryPrioritySet,
    down: AtomicBool,
}

impl FaultyPrioritySet {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

impl PrioritySet for FaultyPrioritySet {
    fn increment_score(&self, set: &str, key: &str, delta: i64) -> Result<i64, StoreError> {
        check(&self.down)?;
        self.inner.increment_score(set, key, delta)
    }

    fn range_by_score_desc(&self, set: &str) -> Result<Vec<(String, i64)>, StoreError> {
        check(&self.down)?;
        self.inner.range_by_score_desc(set)
    }

    fn remove(&self, set: &str, key: &str) -> Result<(), StoreError> {
        check(&self.down)?;
        self.inner.remove(set, key)
    }
}

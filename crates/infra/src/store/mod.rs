//! Store abstractions backing the registry and the result cache.
//!
//! Two independent key spaces are needed:
//!
//! - a **TTL key/value cache**, holding both descriptor payloads (under a
//!   provisioning prefix) and final query results (under the target key);
//! - a **priority set**, mapping target keys to integer scores with an atomic
//!   increment.
//!
//! They are joined only by the shared key string. Redis provides both (see
//! [`RedisStore`], feature `redis`); the in-memory versions back tests
//! and development.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

#[cfg(test)]
pub(crate) mod faulty;
pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use in_memory::{InMemoryPrioritySet, InMemoryTtlCache};
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Store error.
///
/// The core has no degraded mode without its stores, so these propagate to
/// whoever called the affected operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store command failed: {0}")]
    Command(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Key/value cache with per-entry lifetime.
pub trait TtlCache: Send + Sync {
    /// `None` when the key is absent or expired. A cached null comes back as
    /// `Some(JsonValue::Null)`.
    fn fetch(&self, key: &str) -> Result<Option<JsonValue>, StoreError>;

    /// Store `value` under `key`. A zero `ttl` means no expiry.
    fn save(&self, key: &str, value: &JsonValue, ttl: Duration) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Score-ordered set of keys.
pub trait PrioritySet: Send + Sync {
    /// Atomically add `delta` to the score of `key` (creating it at 0 first)
    /// and return the new score.
    fn increment_score(&self, set: &str, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Every `(key, score)` pair of the set, highest score first.
    fn range_by_score_desc(&self, set: &str) -> Result<Vec<(String, i64)>, StoreError>;

    fn remove(&self, set: &str, key: &str) -> Result<(), StoreError>;
}

impl<C> TtlCache for Arc<C>
where
    C: TtlCache + ?Sized,
{
    fn fetch(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
        (**self).fetch(key)
    }

    fn save(&self, key: &str, value: &JsonValue, ttl: Duration) -> Result<(), StoreError> {
        (**self).save(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key)
    }
}

impl<P> PrioritySet for Arc<P>
where
    P: PrioritySet + ?Sized,
{
    fn increment_score(&self, set: &str, key: &str, delta: i64) -> Result<i64, StoreError> {
        (**self).increment_score(set, key, delta)
    }

    fn range_by_score_desc(&self, set: &str) -> Result<Vec<(String, i64)>, StoreError> {
        (**self).range_by_score_desc(set)
    }

    fn remove(&self, set: &str, key: &str) -> Result<(), StoreError> {
        (**self).remove(set, key)
    }
}

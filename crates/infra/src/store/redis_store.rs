//! Redis-backed cache and priority set (optional).
//!
//! One client serves both key spaces:
//!
//! - **Cache**: `GET` / `SET key value [EX secs]` / `DEL`, values stored as
//!   JSON text so a cached null round-trips as `null`.
//! - **Priority set**: a sorted set driven by `ZINCRBY` (atomic on the server,
//!   so live promotions and a sweep's demotion never lose updates),
//!   `ZREVRANGE ... WITHSCORES` and `ZREM`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::instrument;

use super::{PrioritySet, StoreError, TtlCache};

#[derive(Debug, Clone)]
pub struct RedisStore {
    client: Arc<redis::Client>,
}

impl RedisStore {
    /// Create a store for `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// No connection is made until the first command.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn connection(&self) -> Result<redis::Connection, StoreError> {
        self.client
            .get_connection()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

/// Whole seconds for `EX`, rounding a sub-second lifetime up so it is not
/// silently turned into "no expiry".
fn expiry_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 { secs.saturating_add(1) } else { secs }
}

impl TtlCache for RedisStore {
    fn fetch(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let mut conn = self.connection()?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("GET failed: {e}")))?;

        // Foreign writers may store plain text; surface it as a JSON string so
        // shape checks upstream can reject it instead of failing the read.
        Ok(raw.map(|text| serde_json::from_str(&text).unwrap_or(JsonValue::String(text))))
    }

    #[instrument(skip(self, value), err)]
    fn save(&self, key: &str, value: &JsonValue, ttl: Duration) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(payload);
        if !ttl.is_zero() {
            cmd.arg("EX").arg(expiry_secs(ttl));
        }

        let mut conn = self.connection()?;
        let _: () = cmd
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("SET failed: {e}")))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("DEL failed: {e}")))?;
        Ok(())
    }
}

impl PrioritySet for RedisStore {
    #[instrument(skip(self), err)]
    fn increment_score(&self, set: &str, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.connection()?;
        let score: f64 = redis::cmd("ZINCRBY")
            .arg(set)
            .arg(delta)
            .arg(key)
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("ZINCRBY failed: {e}")))?;

        // Only whole-unit deltas are ever applied, so the score is integral.
        Ok(score as i64)
    }

    fn range_by_score_desc(&self, set: &str) -> Result<Vec<(String, i64)>, StoreError> {
        let mut conn = self.connection()?;
        let members: Vec<(String, f64)> = redis::cmd("ZREVRANGE")
            .arg(set)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("ZREVRANGE failed: {e}")))?;

        Ok(members
            .into_iter()
            .map(|(key, score)| (key, score as i64))
            .collect())
    }

    fn remove(&self, set: &str, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("ZREM")
            .arg(set)
            .arg(key)
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("ZREM failed: {e}")))?;
        Ok(())
    }
}

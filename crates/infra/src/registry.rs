//! Priority registry of pending deferred queries.
//!
//! Two key spaces, joined by the descriptor's target cache key:
//!
//! - the **priority set** (`deferred_queries` by default) maps each target key
//!   to a demand score;
//! - the **provisioning store** holds the full descriptor payload under
//!   `provision_<target key>`.
//!
//! Every request for a deferred query promotes it (+1). A sweep enumerates the
//! set highest-score first and demotes each serviced entry by exactly the
//! score it observed, so promotions that arrive mid-sweep survive. Once the
//! score drops below 1 the entry and its payload are evicted.
//!
//! The registry also fronts the result cache (target key -> result), since
//! both live in the same TTL cache.

use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use deferq_core::{CachedDeferredQuery, DeferredQuery};

use crate::error::DeferResult;
use crate::store::{PrioritySet, StoreError, TtlCache};

/// Default priority-set name.
pub const DEFAULT_SET_NAME: &str = "deferred_queries";

/// Default provisioning key prefix.
pub const DEFAULT_PROVISION_PREFIX: &str = "provision_";

/// Default period between sweeps (daily).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(86_400);

/// Score added by one promotion.
const SCORE_INCREMENT: i64 = 1;

/// Entries whose score falls below this are evicted.
const MIN_RETAINED_SCORE: i64 = 1;

/// Payload retention as a multiple of the sweep interval. Must stay above 1
/// so a payload cannot expire while its key is still ranked.
const RETENTION_FACTOR: f64 = 1.1;

/// Registry key layout and payload retention.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    pub set_name: String,
    pub provision_prefix: String,
    pub payload_retention: Duration,
}

impl RegistryConfig {
    /// Default layout with payload retention derived from `sweep_interval`.
    /// Retention saturates at `Duration::MAX`.
    pub fn for_sweep_interval(sweep_interval: Duration) -> Self {
        let retention = sweep_interval.as_secs_f64() * RETENTION_FACTOR;
        Self {
            set_name: DEFAULT_SET_NAME.to_string(),
            provision_prefix: DEFAULT_PROVISION_PREFIX.to_string(),
            payload_retention: Duration::try_from_secs_f64(retention).unwrap_or(Duration::MAX),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::for_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }
}

/// What the result cache holds for a descriptor.
///
/// A cached null is a real outcome (the query failed, or something stored a
/// placeholder) and must not be confused with "never executed".
#[derive(Debug, Clone, PartialEq)]
pub enum CachedResult {
    Absent,
    Null,
    Present(JsonValue),
}

/// Outcome of a demotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demotion {
    /// Score fell below the minimum; score entry and payload were deleted.
    Evicted,
    /// Score is still positive; payload retention was refreshed.
    Retained { score: i64 },
}

/// Score-ranked registry of pending deferred queries.
#[derive(Debug)]
pub struct PriorityRegistry<C, P> {
    cache: C,
    scores: P,
    config: RegistryConfig,
}

impl<C: TtlCache, P: PrioritySet> PriorityRegistry<C, P> {
    pub fn new(cache: C, scores: P, config: RegistryConfig) -> Self {
        Self {
            cache,
            scores,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register (or boost) `query`: +1 on its score, and (re)write its payload
    /// with a fresh retention window.
    pub fn promote(&self, query: &DeferredQuery) -> DeferResult<()> {
        let key = query.target_cache_key();
        let score = self
            .scores
            .increment_score(&self.config.set_name, key, SCORE_INCREMENT)?;
        self.save_payload(query)?;

        debug!(key, score, "deferred query promoted");
        Ok(())
    }

    /// Pending queries, highest score first.
    ///
    /// The ranking is read once, up front; payloads are loaded as the iterator
    /// is pulled. Entries with a non-positive score are skipped silently;
    /// missing or malformed payloads are skipped with a warning. A store
    /// failure while loading a payload is yielded as an `Err` item.
    pub fn enumerate(&self) -> DeferResult<PendingQueries<'_, C>> {
        let ranked = self.scores.range_by_score_desc(&self.config.set_name)?;
        Ok(PendingQueries {
            cache: &self.cache,
            provision_prefix: &self.config.provision_prefix,
            ranked: ranked.into_iter(),
        })
    }

    /// Subtract the score observed at enumeration time.
    ///
    /// Below the minimum, the score entry and payload are deleted. Otherwise
    /// the payload retention is refreshed for the promotions still pending.
    pub fn demote(&self, cached: &CachedDeferredQuery) -> DeferResult<Demotion> {
        let query = cached.query();
        let key = query.target_cache_key();

        let remaining =
            self.scores
                .increment_score(&self.config.set_name, key, -cached.score())?;

        if remaining < MIN_RETAINED_SCORE {
            // A promotion landing between the decrement and the removal is
            // dropped here; its next request registers the query again.
            self.cache.delete(&self.provision_key(key))?;
            self.scores.remove(&self.config.set_name, key)?;
            debug!(key, remaining, "deferred query evicted");
            Ok(Demotion::Evicted)
        } else {
            self.save_payload(query)?;
            debug!(key, remaining, "deferred query retained");
            Ok(Demotion::Retained { score: remaining })
        }
    }

    /// Probe the result cache at the descriptor's target key, once.
    pub fn check_cached_result(&self, query: &DeferredQuery) -> DeferResult<CachedResult> {
        Ok(match self.cache.fetch(query.target_cache_key())? {
            None => CachedResult::Absent,
            Some(JsonValue::Null) => CachedResult::Null,
            Some(value) => CachedResult::Present(value),
        })
    }

    /// Write `value` (null included) to the result cache with the
    /// descriptor's result TTL.
    pub fn cache_result(&self, query: &DeferredQuery, value: &JsonValue) -> DeferResult<()> {
        self.cache
            .save(query.target_cache_key(), value, query.result_ttl())?;
        Ok(())
    }

    fn provision_key(&self, key: &str) -> String {
        format!("{}{}", self.config.provision_prefix, key)
    }

    fn save_payload(&self, query: &DeferredQuery) -> DeferResult<()> {
        let payload =
            serde_json::to_value(query).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.cache.save(
            &self.provision_key(query.target_cache_key()),
            &payload,
            self.config.payload_retention,
        )?;
        Ok(())
    }
}

/// Lazy, one-shot iterator over pending queries. See
/// [`PriorityRegistry::enumerate`].
pub struct PendingQueries<'a, C> {
    cache: &'a C,
    provision_prefix: &'a str,
    ranked: std::vec::IntoIter<(String, i64)>,
}

impl<C: TtlCache> PendingQueries<'_, C> {
    fn load(&self, key: &str) -> Result<Option<DeferredQuery>, StoreError> {
        let provision_key = format!("{}{}", self.provision_prefix, key);
        let Some(payload) = self.cache.fetch(&provision_key)? else {
            warn!(key, "provisioned payload is missing");
            return Ok(None);
        };

        match serde_json::from_value::<DeferredQuery>(payload.clone()) {
            Ok(query) if query.target_cache_key() == key => Ok(Some(query)),
            Ok(query) => {
                warn!(
                    key,
                    payload_key = query.target_cache_key(),
                    "provisioned payload belongs to another key"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(
                    key,
                    payload_type = json_type(&payload),
                    error = %e,
                    "received undefined query payload type"
                );
                Ok(None)
            }
        }
    }
}

impl<C: TtlCache> Iterator for PendingQueries<'_, C> {
    type Item = DeferResult<CachedDeferredQuery>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, score) = self.ranked.next()?;
            if score <= 0 {
                continue;
            }

            match self.load(&key) {
                Ok(Some(query)) => return Some(Ok(CachedDeferredQuery::new(query, score))),
                Ok(None) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

fn json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

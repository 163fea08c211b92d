//! Deferred query executor.
//!
//! Runs one descriptor against the query engine and stores the outcome in the
//! result cache. The skip decision is taken on a single probe of the result
//! cache:
//!
//! | cached   | force | action  |
//! |----------|-------|---------|
//! | absent   | any   | run     |
//! | null     | yes   | run     |
//! | null     | no    | skip    |
//! | non-null | any   | skip    |
//!
//! Engine failures, panics included, are logged and turned into a cached null,
//! so a query that keeps failing is skipped by later non-forced runs instead of
//! retried.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tracing::{info, warn};

use deferq_core::{DeferredQuery, ExecuteResultRow};

use crate::engine::{BoundParameter, QueryEngine, TimeoutGuard};
use crate::error::DeferResult;
use crate::registry::{CachedResult, PriorityRegistry};
use crate::store::{PrioritySet, TtlCache};
use crate::sweep::saturating_millis;

/// Executes one deferred query. The seam between the batch driver and the
/// executor.
pub trait ExecuteDeferred {
    /// Run `query` within `timeout`. `score` is the priority it was swept at
    /// (for logging). `force` recomputes a cached null.
    fn execute(
        &self,
        query: &DeferredQuery,
        timeout: Duration,
        score: i64,
        force: bool,
    ) -> DeferResult<ExecuteResultRow>;
}

impl<X> ExecuteDeferred for Arc<X>
where
    X: ExecuteDeferred + ?Sized,
{
    fn execute(
        &self,
        query: &DeferredQuery,
        timeout: Duration,
        score: i64,
        force: bool,
    ) -> DeferResult<ExecuteResultRow> {
        (**self).execute(query, timeout, score, force)
    }
}

/// Executor backed by a [`PriorityRegistry`] (for the result cache) and a
/// [`QueryEngine`].
pub struct DeferredExecutor<C, P, E> {
    registry: Arc<PriorityRegistry<C, P>>,
    engine: E,
}

impl<C: TtlCache, P: PrioritySet, E: QueryEngine> DeferredExecutor<C, P, E> {
    pub fn new(registry: Arc<PriorityRegistry<C, P>>, engine: E) -> Self {
        Self { registry, engine }
    }

    pub fn registry(&self) -> &Arc<PriorityRegistry<C, P>> {
        &self.registry
    }

    fn should_skip(&self, query: &DeferredQuery, force: bool) -> DeferResult<bool> {
        let key = query.target_cache_key();
        match self.registry.check_cached_result(query)? {
            CachedResult::Absent => Ok(false),
            CachedResult::Null if force => {
                info!(key, "updating the query result over a cached null");
                Ok(false)
            }
            CachedResult::Null | CachedResult::Present(_) => {
                info!(key, "skipped execution: the query result already exists");
                Ok(true)
            }
        }
    }

    /// Run under `timeout`. Engine failures, panics included, become `Null`;
    /// only a failure to set or reset the timeout is an error.
    fn run_bounded(&self, query: &DeferredQuery, timeout: Duration) -> DeferResult<JsonValue> {
        let parameters: Vec<BoundParameter> =
            query.parameters().iter().map(BoundParameter::from).collect();

        let guard = TimeoutGuard::acquire(&self.engine, timeout)?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.engine.run(query.query(), &parameters, query.hints())
        }));
        let failure = match outcome {
            Ok(Ok(value)) => {
                guard.release()?;
                return Ok(value);
            }
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("query engine panicked: {}", panic_message(payload.as_ref())),
        };
        warn!(
            key = query.target_cache_key(),
            query = query.query(),
            params = %query.parameters_display(),
            timeout_ms = saturating_millis(timeout),
            error = %failure,
            "failed query execute"
        );
        guard.release()?;

        Ok(JsonValue::Null)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

impl<C: TtlCache, P: PrioritySet, E: QueryEngine> ExecuteDeferred for DeferredExecutor<C, P, E> {
    fn execute(
        &self,
        query: &DeferredQuery,
        timeout: Duration,
        score: i64,
        force: bool,
    ) -> DeferResult<ExecuteResultRow> {
        if self.should_skip(query, force)? {
            return Ok(ExecuteResultRow::skipped(query.query()));
        }

        let started = Instant::now();
        let value = self.run_bounded(query, timeout)?;
        let elapsed = started.elapsed();

        self.registry.cache_result(query, &value)?;

        if value.is_null() {
            return Ok(ExecuteResultRow::failed(query.query()));
        }

        info!(
            key = query.target_cache_key(),
            query = query.query(),
            params = %query.parameters_display(),
            duration_ms = saturating_millis(elapsed),
            score,
            "the query is done"
        );
        Ok(ExecuteResultRow::done(query.query()))
    }
}

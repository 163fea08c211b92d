//! Query engine abstraction.
//!
//! The engine runs a query string with bound parameters and hints. Its only
//! other duty towards the core is an engine-wide execution timeout, which the
//! executor sets around each run through a [`TimeoutGuard`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::warn;

use deferq_core::{Hints, QueryParameter};

pub mod postgres;
pub mod scripted;

pub use postgres::PostgresQueryEngine;
pub use scripted::ScriptedQueryEngine;

/// Engine error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("query timed out")]
    Timeout,
    #[error("query execution failed: {0}")]
    Execution(String),
    #[error("engine connection error: {0}")]
    Connection(String),
}

/// A parameter as the engine binds it: entity references already resolved to
/// their identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParameter {
    pub name: String,
    pub value: JsonValue,
    pub type_hint: Option<String>,
}

impl From<&QueryParameter> for BoundParameter {
    fn from(parameter: &QueryParameter) -> Self {
        Self {
            name: parameter.name.clone(),
            value: parameter.value.bind_value().clone(),
            type_hint: parameter.type_hint.clone(),
        }
    }
}

/// Something that can run a query.
pub trait QueryEngine: Send + Sync {
    /// Bound every subsequent run to `timeout`.
    fn set_timeout(&self, timeout: Duration) -> Result<(), EngineError>;

    /// Make subsequent runs unbounded again.
    fn clear_timeout(&self) -> Result<(), EngineError>;

    /// Run `query`. A `JsonValue::Null` result is a legitimate outcome.
    fn run(
        &self,
        query: &str,
        parameters: &[BoundParameter],
        hints: &Hints,
    ) -> Result<JsonValue, EngineError>;
}

impl<E> QueryEngine for Arc<E>
where
    E: QueryEngine + ?Sized,
{
    fn set_timeout(&self, timeout: Duration) -> Result<(), EngineError> {
        (**self).set_timeout(timeout)
    }

    fn clear_timeout(&self) -> Result<(), EngineError> {
        (**self).clear_timeout()
    }

    fn run(
        &self,
        query: &str,
        parameters: &[BoundParameter],
        hints: &Hints,
    ) -> Result<JsonValue, EngineError> {
        (**self).run(query, parameters, hints)
    }
}

/// Scoped engine timeout.
///
/// [`acquire`](Self::acquire) sets the timeout; [`release`](Self::release)
/// clears it and reports failure. If the guard is dropped without being
/// released (early return, panic), the timeout is cleared on drop and a
/// failure to do so is logged.
#[must_use = "dropping the guard immediately clears the timeout"]
pub struct TimeoutGuard<'a, E: QueryEngine + ?Sized> {
    engine: &'a E,
    armed: bool,
}

impl<'a, E: QueryEngine + ?Sized> TimeoutGuard<'a, E> {
    pub fn acquire(engine: &'a E, timeout: Duration) -> Result<Self, EngineError> {
        engine.set_timeout(timeout)?;
        Ok(Self {
            engine,
            armed: true,
        })
    }

    pub fn release(mut self) -> Result<(), EngineError> {
        self.armed = false;
        self.engine.clear_timeout()
    }
}

impl<E: QueryEngine + ?Sized> Drop for TimeoutGuard<'_, E> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.engine.clear_timeout() {
                warn!(error = %e, "failed to clear query timeout");
            }
        }
    }
}

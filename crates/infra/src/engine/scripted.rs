//! Scripted in-memory query engine for tests/dev.
//!
//! Responses are registered per query text. Each response may carry a
//! simulated execution cost; a run whose cost exceeds the current timeout
//! fails with [`EngineError::Timeout`], which is how the engine-wide timeout
//! is observed without sleeping.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value as JsonValue;

use deferq_core::Hints;

use super::{BoundParameter, EngineError, QueryEngine};

#[derive(Debug, Clone)]
struct Scripted {
    outcome: Result<JsonValue, EngineError>,
    cost: Duration,
    panic: Option<String>,
}

/// One recorded call to [`QueryEngine::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRun {
    pub query: String,
    pub parameters: Vec<BoundParameter>,
    pub hints: Hints,
    /// Timeout in force while the query ran.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct ScriptState {
    timeout: Option<Duration>,
    responses: HashMap<String, Scripted>,
    runs: Vec<RecordedRun>,
    reject_timeouts: bool,
}

#[derive(Debug, Default)]
pub struct ScriptedQueryEngine {
    state: Mutex<ScriptState>,
}

impl ScriptedQueryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ScriptState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Answer `query` with `value`.
    pub fn respond(&self, query: impl Into<String>, value: JsonValue) {
        self.respond_after(query, value, Duration::ZERO);
    }

    /// Answer `query` with `value` after a simulated execution cost.
    pub fn respond_after(&self, query: impl Into<String>, value: JsonValue, cost: Duration) {
        self.with_state(|s| {
            s.responses.insert(
                query.into(),
                Scripted {
                    outcome: Ok(value),
                    cost,
                    panic: None,
                },
            );
        });
    }

    /// Fail `query` with `error`.
    pub fn fail(&self, query: impl Into<String>, error: EngineError) {
        self.with_state(|s| {
            s.responses.insert(
                query.into(),
                Scripted {
                    outcome: Err(error),
                    cost: Duration::ZERO,
                    panic: None,
                },
            );
        });
    }

    /// Panic with `message` whenever `query` runs, as a driver bug would.
    pub fn panic_on(&self, query: impl Into<String>, message: impl Into<String>) {
        self.with_state(|s| {
            s.responses.insert(
                query.into(),
                Scripted {
                    outcome: Ok(JsonValue::Null),
                    cost: Duration::ZERO,
                    panic: Some(message.into()),
                },
            );
        });
    }

    /// Make `set_timeout` fail, as a lost database connection would.
    pub fn reject_timeouts(&self, reject: bool) {
        self.with_state(|s| s.reject_timeouts = reject);
    }

    pub fn current_timeout(&self) -> Option<Duration> {
        self.with_state(|s| s.timeout)
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.with_state(|s| s.runs.clone())
    }

    pub fn run_count(&self) -> usize {
        self.with_state(|s| s.runs.len())
    }
}

impl QueryEngine for ScriptedQueryEngine {
    fn set_timeout(&self, timeout: Duration) -> Result<(), EngineError> {
        self.with_state(|s| {
            if s.reject_timeouts {
                return Err(EngineError::Connection("connection refused".to_string()));
            }
            s.timeout = Some(timeout);
            Ok(())
        })
    }

    fn clear_timeout(&self) -> Result<(), EngineError> {
        self.with_state(|s| s.timeout = None);
        Ok(())
    }

    fn run(
        &self,
        query: &str,
        parameters: &[BoundParameter],
        hints: &Hints,
    ) -> Result<JsonValue, EngineError> {
        let (scripted, timeout) = self.with_state(|s| {
            s.runs.push(RecordedRun {
                query: query.to_string(),
                parameters: parameters.to_vec(),
                hints: hints.clone(),
                timeout: s.timeout,
            });
            (s.responses.get(query).cloned(), s.timeout)
        });
        let scripted = scripted.ok_or_else(|| {
            EngineError::Execution(format!("no scripted response for: {query}"))
        })?;

        // Outside the lock, so the script stays usable afterwards.
        if let Some(message) = scripted.panic {
            panic!("{message}");
        }
        if timeout.is_some_and(|limit| scripted.cost > limit) {
            return Err(EngineError::Timeout);
        }
        scripted.outcome
    }
}

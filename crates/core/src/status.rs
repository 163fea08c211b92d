//! Execution outcomes and sweep tallies.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteStatus {
    /// The query ran and produced a non-null result.
    Done,
    /// A usable result was already cached; nothing ran.
    Skipped,
    /// The query failed or produced null; null was cached.
    Failed,
    /// A status this build does not know (e.g. reported by a newer executor).
    #[serde(other)]
    Unrecognized,
}

impl ExecuteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecuteStatus::Done => "done",
            ExecuteStatus::Skipped => "skipped",
            ExecuteStatus::Failed => "failed",
            ExecuteStatus::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for ExecuteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The query text of an execution attempt paired with its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResultRow {
    pub query: String,
    pub status: ExecuteStatus,
}

impl ExecuteResultRow {
    pub fn new(query: impl Into<String>, status: ExecuteStatus) -> Self {
        Self {
            query: query.into(),
            status,
        }
    }

    pub fn done(query: impl Into<String>) -> Self {
        Self::new(query, ExecuteStatus::Done)
    }

    pub fn skipped(query: impl Into<String>) -> Self {
        Self::new(query, ExecuteStatus::Skipped)
    }

    pub fn failed(query: impl Into<String>) -> Self {
        Self::new(query, ExecuteStatus::Failed)
    }
}

/// Counters accumulated over one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub done: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl SweepSummary {
    pub fn new(done: u64, skipped: u64, failed: u64) -> Self {
        Self {
            done,
            skipped,
            failed,
        }
    }

    /// Credit one status. Returns `false` (and counts nothing) for
    /// [`ExecuteStatus::Unrecognized`].
    pub fn record(&mut self, status: ExecuteStatus) -> bool {
        match status {
            ExecuteStatus::Done => self.done += 1,
            ExecuteStatus::Skipped => self.skipped += 1,
            ExecuteStatus::Failed => self.failed += 1,
            ExecuteStatus::Unrecognized => return false,
        }
        true
    }

    pub fn total(&self) -> u64 {
        self.done + self.skipped + self.failed
    }
}

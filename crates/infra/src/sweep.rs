//! Batch driver: one sweep over the priority registry.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use deferq_core::{SweepId, SweepSummary};

use crate::error::DeferResult;
use crate::executor::ExecuteDeferred;
use crate::registry::PriorityRegistry;
use crate::store::{PrioritySet, TtlCache};

/// Default base timeout unit (5 minutes).
pub const DEFAULT_BASE_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout budget for an entry swept at `score`: `max(score × base, base)`.
pub fn timeout_for_score(base: Duration, score: i64) -> Duration {
    let factor = u32::try_from(score.max(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).max(base)
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Drives sweeps: enumerate, execute (forced), demote, tally.
///
/// Sweeps must be serialised by the caller; two concurrent sweeps would both
/// demote the same observed scores.
pub struct BatchDriver<C, P, X> {
    registry: Arc<PriorityRegistry<C, P>>,
    executor: X,
    base_timeout: Duration,
}

impl<C: TtlCache, P: PrioritySet, X: ExecuteDeferred> BatchDriver<C, P, X> {
    pub fn new(registry: Arc<PriorityRegistry<C, P>>, executor: X) -> Self {
        Self {
            registry,
            executor,
            base_timeout: DEFAULT_BASE_TIMEOUT,
        }
    }

    pub fn with_base_timeout(mut self, base_timeout: Duration) -> Self {
        self.base_timeout = base_timeout;
        self
    }

    pub fn base_timeout(&self) -> Duration {
        self.base_timeout
    }

    /// Run one sweep to exhaustion.
    ///
    /// Only store or engine unavailability is an `Err`; entries processed
    /// before the error keep their demotions.
    pub fn run_sweep(&self) -> DeferResult<SweepSummary> {
        let sweep_id = SweepId::new();
        let mut summary = SweepSummary::default();

        info!(sweep_id = %sweep_id, "sweep started");

        for entry in self.registry.enumerate()? {
            let entry = entry?;
            let query = entry.query();
            let score = entry.score();
            let timeout = timeout_for_score(self.base_timeout, score);

            debug!(
                sweep_id = %sweep_id,
                key = query.target_cache_key(),
                score,
                timeout_ms = saturating_millis(timeout),
                "sweeping deferred query"
            );

            let row = self.executor.execute(query, timeout, score, true)?;
            self.registry.demote(&entry)?;

            if !summary.record(row.status) {
                warn!(
                    sweep_id = %sweep_id,
                    key = query.target_cache_key(),
                    query = %row.query,
                    status = %row.status,
                    "undefined query execute status"
                );
            }
        }

        info!(
            sweep_id = %sweep_id,
            done = summary.done,
            skipped = summary.skipped,
            failed = summary.failed,
            "sweep finished"
        );
        Ok(summary)
    }
}

/// Something that can run one sweep. Lets the worker hold any driver.
pub trait Sweep: Send + Sync {
    fn run_sweep(&self) -> DeferResult<SweepSummary>;
}

impl<C, P, X> Sweep for BatchDriver<C, P, X>
where
    C: TtlCache,
    P: PrioritySet,
    X: ExecuteDeferred + Send + Sync,
{
    fn run_sweep(&self) -> DeferResult<SweepSummary> {
        BatchDriver::run_sweep(self)
    }
}

impl<S: Sweep + ?Sized> Sweep for Arc<S> {
    fn run_sweep(&self) -> DeferResult<SweepSummary> {
        (**self).run_sweep()
    }
}

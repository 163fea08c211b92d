//! Periodic sweep worker.
//!
//! One background thread runs one sweep per interval, so sweeps never overlap
//! within the process. Across processes, sweeps must still be serialised by
//! whatever schedules them.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{error, info};

use deferq_core::SweepSummary;

use crate::registry::DEFAULT_SWEEP_INTERVAL;
use crate::sweep::Sweep;

/// Sweep worker configuration.
#[derive(Debug, Clone)]
pub struct SweepWorkerConfig {
    /// Time between the start of one sweep and the next
    pub interval: Duration,
    /// Thread name, also used in logs
    pub name: String,
    /// Sweep once at startup instead of waiting a full interval
    pub sweep_on_start: bool,
}

impl Default for SweepWorkerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
            name: "deferq-sweep".to_string(),
            sweep_on_start: true,
        }
    }
}

impl SweepWorkerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_sweep_on_start(mut self, sweep_on_start: bool) -> Self {
        self.sweep_on_start = sweep_on_start;
        self
    }
}

/// Cumulative worker statistics.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct SweepStats {
    pub sweeps_run: u64,
    pub sweep_errors: u64,
    pub done: u64,
    pub skipped: u64,
    pub failed: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub last_summary: Option<SweepSummary>,
}

impl SweepStats {
    fn record(&mut self, summary: SweepSummary) {
        self.sweeps_run += 1;
        self.done += summary.done;
        self.skipped += summary.skipped;
        self.failed += summary.failed;
        self.last_summary = Some(summary);
        self.last_sweep_at = Some(Utc::now());
    }

    fn record_error(&mut self) {
        self.sweep_errors += 1;
        self.last_sweep_at = Some(Utc::now());
    }
}

/// Handle to control a running sweep worker.
#[derive(Debug)]
pub struct SweepWorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SweepStats>>,
}

impl SweepWorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop. A sweep in
    /// progress is finished first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> SweepStats {
        lock(&self.stats).clone()
    }
}

pub struct SweepWorker;

impl SweepWorker {
    /// Spawn a thread that runs `driver` every `config.interval`.
    pub fn spawn<S>(driver: S, config: SweepWorkerConfig) -> io::Result<SweepWorkerHandle>
    where
        S: Sweep + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(SweepStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || worker_loop(driver, config, shutdown_rx, stats_clone))?;

        Ok(SweepWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn worker_loop<S: Sweep>(
    driver: S,
    config: SweepWorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<SweepStats>>,
) {
    info!(worker = %config.name, interval_secs = config.interval.as_secs(), "sweep worker started");

    // `None` means the next deadline is beyond what `Instant` can represent.
    let mut next_sweep = if config.sweep_on_start {
        Some(Instant::now())
    } else {
        Instant::now().checked_add(config.interval)
    };

    loop {
        let signal = match next_sweep {
            Some(at) => shutdown_rx.recv_timeout(at.saturating_duration_since(Instant::now())),
            None => shutdown_rx
                .recv()
                .map_err(|_| mpsc::RecvTimeoutError::Disconnected),
        };
        match signal {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        next_sweep = Instant::now().checked_add(config.interval);
        match panic::catch_unwind(AssertUnwindSafe(|| driver.run_sweep())) {
            Ok(Ok(summary)) => lock(&stats).record(summary),
            Ok(Err(e)) => {
                error!(worker = %config.name, error = %e, "sweep failed");
                lock(&stats).record_error();
            }
            Err(_) => {
                error!(worker = %config.name, "sweep panicked");
                lock(&stats).record_error();
            }
        }
    }

    info!(worker = %config.name, "sweep worker stopped");
}

fn lock(stats: &Mutex<SweepStats>) -> MutexGuard<'_, SweepStats> {
    match stats.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

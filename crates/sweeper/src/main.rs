use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use deferq_core::SweepSummary;
use deferq_infra::engine::PostgresQueryEngine;
use deferq_infra::store::RedisStore;
use deferq_infra::{
    BatchDriver, DeferConfig, DeferredExecutor, PriorityRegistry, RegistryConfig, SweepMode,
    SweepWorker, SweepWorkerConfig,
};
use deferq_observability::LogSettings;

/// One sweep runs at a time, so a small pool is enough.
const DB_MAX_CONNECTIONS: u32 = 2;

fn main() -> anyhow::Result<()> {
    deferq_observability::subscriber::init(&LogSettings::from_env());

    let config = DeferConfig::from_env().context("invalid configuration")?;
    let database_url = config.require_database_url()?;

    let store = Arc::new(RedisStore::new(&config.redis_url).context("failed to open redis client")?);
    let engine = PostgresQueryEngine::connect(database_url, DB_MAX_CONNECTIONS)
        .context("failed to connect to postgres")?;

    let registry = Arc::new(PriorityRegistry::new(
        store.clone(),
        store,
        RegistryConfig::from(&config),
    ));
    let executor = DeferredExecutor::new(registry.clone(), engine);
    let driver = BatchDriver::new(registry, executor).with_base_timeout(config.base_timeout);

    match config.sweep_mode {
        SweepMode::Once => {
            let summary = driver.run_sweep().context("sweep failed")?;
            report(&summary);
        }
        SweepMode::Loop => {
            let handle = SweepWorker::spawn(
                driver,
                SweepWorkerConfig::default().with_interval(config.sweep_interval),
            )
            .context("failed to spawn sweep worker")?;

            wait_for_shutdown_signal()?;
            info!("shutdown requested");

            let stats = handle.stats();
            handle.shutdown();
            info!(
                sweeps = stats.sweeps_run,
                errors = stats.sweep_errors,
                done = stats.done,
                skipped = stats.skipped,
                failed = stats.failed,
                "sweep worker stopped"
            );
        }
    }

    Ok(())
}

fn report(summary: &SweepSummary) {
    info!(
        done = summary.done,
        skipped = summary.skipped,
        failed = summary.failed,
        total = summary.total(),
        "deferred queries swept"
    );
}

fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for ctrl-c")
}

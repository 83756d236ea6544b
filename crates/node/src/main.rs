use std::sync::Arc;

use anyhow::Context;

use cadence_core::SystemClock;
use cadence_infra::producer::ScheduleWorkSource;
use cadence_infra::store::PostgresStore;
use cadence_infra::workers::HttpExecutor;
use cadence_infra::{Scheduler, SchedulerConfig, SchedulerHandle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cadence_observability::init();

    let config = SchedulerConfig::from_env();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let schedules_path = std::env::var("CADENCE_SCHEDULES").unwrap_or_else(|_| {
        tracing::warn!("CADENCE_SCHEDULES not set; using ./schedules.json");
        "schedules.json".to_string()
    });
    let store = PostgresStore::connect(&database_url, config.db_pool_size())
        .await
        .context("failed to connect to postgres")?;
    let source = ScheduleWorkSource::load(&schedules_path)
        .with_context(|| format!("failed to load schedules from {schedules_path}"))?;
    tracing::info!(schedules = source.schedules().len(), path = %schedules_path, "schedules loaded");

    // The blocking HTTP client and the service threads live outside the runtime.
    let handle = tokio::task::spawn_blocking(move || -> anyhow::Result<SchedulerHandle> {
        let executor = HttpExecutor::new().context("failed to build HTTP executor")?;
        let handle = Scheduler::new(
            Arc::new(store),
            Arc::new(source),
            Arc::new(executor),
            Arc::new(SystemClock),
            config,
        )
        .start()
        .context("failed to start scheduler")?;
        Ok(handle)
    })
    .await??;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested, draining workers");

    tokio::task::spawn_blocking(move || handle.shutdown()).await?;
    Ok(())
}

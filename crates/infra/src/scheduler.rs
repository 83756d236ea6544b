//! Composition of producer, dispatcher, worker pool and reaper.

use std::io;
use std::sync::Arc;

use tracing::info;

use cadence_core::Clock;

use crate::config::SchedulerConfig;
use crate::dispatcher::Dispatcher;
use crate::producer::{Producer, WorkSource};
use crate::reaper::Reaper;
use crate::runner::{Health, ServiceHandle, spawn_periodic};
use crate::store::{ExecutionStore, JobStore, WatermarkStore};
use crate::workers::{JobExecutor, SlotAllocator, WorkerPool};

/// A running scheduler node.
pub struct SchedulerHandle {
    services: Vec<ServiceHandle>,
    pool: WorkerPool,
}

impl SchedulerHandle {
    /// Health of each service loop, by name.
    pub fn health(&self) -> Vec<(&'static str, Health)> {
        self.services
            .iter()
            .map(|service| (service.name(), service.health()))
            .collect()
    }

    /// Every service loop is live.
    pub fn is_live(&self) -> bool {
        self.services.iter().all(|service| service.health().is_live())
    }

    pub fn slots(&self) -> SlotAllocator {
        self.pool.slots()
    }

    /// Stop the timers, then drain the worker pool.
    pub fn shutdown(self) {
        info!("scheduler stopping");
        for service in self.services {
            service.shutdown();
        }
        self.pool.shutdown();
        info!("scheduler stopped");
    }
}

/// Wires the services of one node around a shared store.
pub struct Scheduler<S> {
    store: S,
    source: Arc<dyn WorkSource>,
    executor: Arc<dyn JobExecutor>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl<S> Scheduler<S>
where
    S: WatermarkStore + JobStore + ExecutionStore + Clone + 'static,
{
    pub fn new(
        store: S,
        source: Arc<dyn WorkSource>,
        executor: Arc<dyn JobExecutor>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            source,
            executor,
            clock,
            config,
        }
    }

    /// Start the worker pool and the three service loops.
    pub fn start(self) -> io::Result<SchedulerHandle> {
        let config = &self.config;
        let pool = WorkerPool::start(
            config.workers,
            self.store.clone(),
            self.executor.clone(),
            self.clock.clone(),
        )?;

        let producer = Producer::new(
            self.store.clone(),
            self.source.clone(),
            self.clock.clone(),
            config.producer_settings(),
        );
        let dispatcher = Dispatcher::new(
            self.store.clone(),
            pool.slots(),
            self.clock.clone(),
            config.dispatcher_settings(),
        );
        let reaper = Reaper::new(self.store.clone(), self.clock.clone(), config.reaper_settings());

        let mut services = Vec::with_capacity(3);
        let spawned = spawn_periodic(producer, config.loop_settings(config.producer_interval))
            .and_then(|producer| {
                services.push(producer);
                spawn_periodic(dispatcher, config.loop_settings(config.dispatch_interval))
            })
            .and_then(|dispatcher| {
                services.push(dispatcher);
                spawn_periodic(reaper, config.loop_settings(config.reaper_interval))
            });

        match spawned {
            Ok(reaper) => services.push(reaper),
            Err(e) => {
                for service in services {
                    service.shutdown();
                }
                pool.shutdown();
                return Err(e);
            }
        }

        info!(
            config_id = %config.config_id,
            workers = config.workers,
            max_retries = config.max_retries,
            "scheduler started"
        );
        Ok(SchedulerHandle { services, pool })
    }
}

//! Job producer.
//!
//! Each cycle turns the work that fell due since the stored watermark into
//! Pending jobs, then moves the watermark forward with a compare-and-swap.
//! Job ids are derived from `(config, work key, due time)`, so a cycle that
//! is repeated (lost watermark race, crash between insert and advance)
//! produces `Duplicate` inserts instead of second copies.

mod work_source;

pub use work_source::{
    MAX_FIRES_PER_WINDOW, Schedule, ScheduleWorkSource, StaticWorkSource, Trigger, WorkItem,
    WorkSource,
};

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use cadence_core::time::duration_millis;
use cadence_core::{Clock, ConfigId, EpochMillis, Job};

use crate::error::CycleError;
use crate::runner::PeriodicTask;
use crate::store::{JobStore, StoreError, WatermarkStore};

/// Producer settings.
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub config_id: ConfigId,
    /// Oldest history a cycle will look back on. Older work is skipped.
    pub max_history: Option<Duration>,
    /// Watermark compare-and-swap attempts per cycle.
    pub max_cas_retries: u32,
}

impl ProducerSettings {
    pub fn new(config_id: ConfigId) -> Self {
        Self {
            config_id,
            max_history: None,
            max_cas_retries: 5,
        }
    }

    pub fn with_max_history(mut self, max_history: Duration) -> Self {
        self.max_history = Some(max_history);
        self
    }

    pub fn with_max_cas_retries(mut self, retries: u32) -> Self {
        self.max_cas_retries = retries;
        self
    }
}

/// Outcome of one producer cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Window start actually queried (after the history clamp).
    pub since: EpochMillis,
    /// Window end (`now`).
    pub until: EpochMillis,
    /// Jobs newly inserted.
    pub produced: usize,
    /// Items whose job already existed.
    pub duplicates: usize,
    /// Items returned outside the window.
    pub ignored: usize,
    /// Watermark races lost before this cycle settled.
    pub conflicts: u32,
    /// Whether this cycle moved the watermark.
    pub advanced: bool,
    /// Watermark after the cycle.
    pub watermark: EpochMillis,
}

/// Converts due work into jobs and advances the watermark.
pub struct Producer<S> {
    store: S,
    source: Arc<dyn WorkSource>,
    clock: Arc<dyn Clock>,
    settings: ProducerSettings,
}

impl<S> Producer<S>
where
    S: WatermarkStore + JobStore,
{
    pub fn new(
        store: S,
        source: Arc<dyn WorkSource>,
        clock: Arc<dyn Clock>,
        settings: ProducerSettings,
    ) -> Self {
        Self {
            store,
            source,
            clock,
            settings,
        }
    }

    pub fn config_id(&self) -> &ConfigId {
        &self.settings.config_id
    }

    /// Run one production cycle.
    ///
    /// The watermark only moves after every job of the window was inserted
    /// (or already existed). A lost compare-and-swap restarts the cycle from
    /// the fresh watermark, up to `max_cas_retries` times.
    pub fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let config_id = &self.settings.config_id;
        let attempts = self.settings.max_cas_retries.max(1);
        let mut conflicts = 0;

        for _ in 0..attempts {
            let last = self.store.get_watermark(config_id)?.last_produced_timestamp;
            let now = self.clock.now_millis();

            if now <= last {
                debug!(config_id = %config_id, watermark = last, now, "nothing new to produce");
                return Ok(CycleReport {
                    since: last,
                    until: now,
                    conflicts,
                    watermark: last,
                    ..CycleReport::default()
                });
            }

            let since = self.window_start(last, now);
            let mut report = self.produce_window(since, now)?;
            report.conflicts = conflicts;

            match self.store.advance_watermark(config_id, last, now) {
                Ok(advanced) => {
                    report.advanced = true;
                    report.watermark = advanced.last_produced_timestamp;
                    if report.produced > 0 || report.duplicates > 0 {
                        info!(
                            config_id = %config_id,
                            since,
                            until = now,
                            produced = report.produced,
                            duplicates = report.duplicates,
                            "produced jobs"
                        );
                    }
                    return Ok(report);
                }
                Err(StoreError::Conflict(reason)) => {
                    conflicts += 1;
                    debug!(
                        config_id = %config_id,
                        expected = last,
                        reason = %reason,
                        "lost watermark race, retrying cycle"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(config_id = %config_id, attempts, "watermark contention, giving up this cycle");
        Err(CycleError::Contention(attempts))
    }

    fn window_start(&self, last: EpochMillis, now: EpochMillis) -> EpochMillis {
        let Some(max_history) = self.settings.max_history else {
            return last;
        };
        let oldest = now.saturating_sub(duration_millis(max_history));
        if oldest > last {
            warn!(
                config_id = %self.settings.config_id,
                watermark = last,
                skipped_until = oldest,
                "watermark older than max history, skipping old work"
            );
            oldest
        } else {
            last
        }
    }

    fn produce_window(&self, since: EpochMillis, now: EpochMillis) -> Result<CycleReport, CycleError> {
        let config_id = &self.settings.config_id;
        let items = self
            .source
            .list_due_work(since, now)
            .map_err(CycleError::WorkSource)?;

        let mut report = CycleReport {
            since,
            until: now,
            ..CycleReport::default()
        };

        for item in items {
            if !item.is_due_within(since, now) {
                debug!(key = %item.key, due_at = item.due_at, since, until = now, "ignoring item outside window");
                report.ignored += 1;
                continue;
            }

            let job = Job::new(config_id.clone(), item.key, item.payload, item.due_at, now)
                .with_guarantee(item.guarantee);
            match self.store.insert_job(&job) {
                Ok(()) => {
                    debug!(job_id = %job.job_id, scheduled_for = job.scheduled_for, "job created");
                    report.produced += 1;
                }
                Err(StoreError::Duplicate(_)) => report.duplicates += 1,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }
}

impl<S> PeriodicTask for Producer<S>
where
    S: WatermarkStore + JobStore + 'static,
{
    fn name(&self) -> &'static str {
        "producer"
    }

    fn tick(&self) -> Result<(), CycleError> {
        self.run_cycle().map(|_| ())
    }
}

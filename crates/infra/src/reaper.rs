//! Stale execution reaper.
//!
//! A worker that dies mid-execution leaves a Running execution and a
//! Dispatched job behind. The reaper fails such executions once they are
//! older than `stale_after` and returns their jobs to the queue. Only the
//! caller whose `update_execution` actually applied the Failure moves the
//! job, so every stale execution is reclaimed exactly once even with many
//! reapers running.
//!
//! A second sweep settles Dispatched jobs without a Running execution. They
//! are left behind when a writer stops between its two writes: the worker
//! or reaper after finishing the execution, or the dispatcher after its
//! claim. Such a job takes the result of the execution of its current
//! attempt, or goes back to Pending if that execution never started.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use cadence_core::time::duration_millis;
use cadence_core::{Clock, EpochMillis, Execution, ExecutionResult, Job, JobStatus};

use crate::error::CycleError;
use crate::runner::PeriodicTask;
use crate::store::{ExecutionStore, ExecutionUpdate, JobStore, JobTransition, StoreError, UpdateOutcome};

#[derive(Debug, Clone)]
pub struct ReaperSettings {
    /// Age after which a Running execution is considered abandoned.
    pub stale_after: Duration,
    /// Total execution budget per job; exhausted and at-most-once jobs end Failed.
    pub max_attempts: u32,
    pub batch_size: usize,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(600),
            max_attempts: 3,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Jobs returned to Pending.
    pub reclaimed: usize,
    /// Jobs failed because their budget was spent or they run at most once.
    pub exhausted: usize,
    /// Stale executions finished by someone else first.
    pub skipped: usize,
    /// Dispatched jobs without a Running execution that were settled.
    pub settled: usize,
}

/// What the reaper did with a Dispatched job that had no Running execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    /// Took the result of its finished execution (Completed or Failed).
    Finished(JobStatus),
    /// The execution never started; back to Pending.
    Released,
    /// Still running, or moved by someone else.
    Untouched,
}

pub struct Reaper<S> {
    store: S,
    clock: Arc<dyn Clock>,
    settings: ReaperSettings,
}

impl<S> Reaper<S>
where
    S: JobStore + ExecutionStore,
{
    pub fn new(store: S, clock: Arc<dyn Clock>, settings: ReaperSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn run_cycle(&self) -> Result<ReapReport, CycleError> {
        let now = self.clock.now_millis();
        let cutoff = now.saturating_sub(duration_millis(self.settings.stale_after));
        let stale = self
            .store
            .list_stale_running(cutoff, self.settings.batch_size)?;

        let mut report = ReapReport::default();
        for execution in stale {
            match self.reap(&execution, now)? {
                Some(JobStatus::Pending) => report.reclaimed += 1,
                Some(_) => report.exhausted += 1,
                None => report.skipped += 1,
            }
        }

        let stranded = self
            .store
            .list_stale_dispatched(cutoff, self.settings.batch_size)?;
        for job in stranded {
            if self.settle(&job, cutoff, now)? != Settled::Untouched {
                report.settled += 1;
            }
        }

        if report.reclaimed > 0 || report.exhausted > 0 || report.settled > 0 {
            info!(
                reclaimed = report.reclaimed,
                exhausted = report.exhausted,
                skipped = report.skipped,
                settled = report.settled,
                "reclaimed stale work"
            );
        }
        Ok(report)
    }

    /// Finish a Dispatched job whose current attempt is not running.
    fn settle(&self, job: &Job, cutoff: EpochMillis, now: EpochMillis) -> Result<Settled, CycleError> {
        let history = self.store.list_executions(&job.job_id)?;
        if history.iter().any(Execution::is_running) {
            // the Running sweep owns it
            return Ok(Settled::Untouched);
        }

        let current = history.iter().find(|e| e.attempt == job.attempts);
        if current.and_then(|e| e.finished_at).is_some_and(|at| at >= cutoff) {
            // whoever finished it may still be about to move the job
            return Ok(Settled::Untouched);
        }
        let transition = match current.map(|e| e.result) {
            Some(ExecutionResult::Success) => {
                JobTransition::new(JobStatus::Dispatched, JobStatus::Completed, now)
            }
            Some(ExecutionResult::Failure) => {
                JobTransition::new(JobStatus::Dispatched, JobStatus::Failed, now)
            }
            Some(ExecutionResult::Running) => return Ok(Settled::Untouched),
            None => JobTransition::new(JobStatus::Dispatched, JobStatus::Pending, now)
                .with_attempts(job.attempts.saturating_sub(1))
                .with_available_at(now),
        }
        .expecting_attempts(job.attempts);

        match self.store.transition_job(&job.job_id, &transition) {
            Ok(_) => {
                warn!(
                    job_id = %job.job_id,
                    attempts = job.attempts,
                    status = %transition.to,
                    "settled stranded dispatched job"
                );
                Ok(match transition.to {
                    JobStatus::Pending => Settled::Released,
                    other => Settled::Finished(other),
                })
            }
            Err(StoreError::Conflict(reason)) => {
                debug!(job_id = %job.job_id, reason = %reason, "stranded job moved before settling");
                Ok(Settled::Untouched)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn reap(&self, execution: &Execution, now: EpochMillis) -> Result<Option<JobStatus>, CycleError> {
        let update = ExecutionUpdate::failure(
            now,
            format!("stale: no result after {}ms", now - execution.started_at),
        );
        match self.store.update_execution(&execution.execution_id, &update) {
            Ok(UpdateOutcome::Applied(_)) => {}
            Ok(UpdateOutcome::AlreadyApplied(_)) | Err(StoreError::Conflict(_)) => {
                debug!(execution_id = %execution.execution_id, "stale execution already finished");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let Some(job) = self.store.get_job(&execution.job_id)? else {
            warn!(job_id = %execution.job_id, "stale execution without job");
            return Ok(None);
        };

        let target = if job.may_retry(self.settings.max_attempts) {
            JobStatus::Pending
        } else {
            JobStatus::Failed
        };
        let mut transition = JobTransition::new(JobStatus::Dispatched, target, now)
            .expecting_attempts(execution.attempt);
        if target == JobStatus::Pending {
            transition = transition.with_available_at(now);
        }

        match self.store.transition_job(&job.job_id, &transition) {
            Ok(_) => {
                warn!(
                    job_id = %job.job_id,
                    execution_id = %execution.execution_id,
                    attempts = job.attempts,
                    status = %target,
                    "reclaimed stale execution"
                );
                Ok(Some(target))
            }
            Err(StoreError::Conflict(reason)) => {
                warn!(job_id = %job.job_id, reason = %reason, "job moved while reclaiming");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<S> PeriodicTask for Reaper<S>
where
    S: JobStore + ExecutionStore + 'static,
{
    fn name(&self) -> &'static str {
        "reaper"
    }

    fn tick(&self) -> Result<(), CycleError> {
        self.run_cycle().map(|_| ())
    }
}
